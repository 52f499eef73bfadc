// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Versioned configuration snapshots.
//!
//! A [`ConfigSnapshot`] is the full hierarchical configuration tree at a
//! point in time, together with its logical identity (`name`) and a
//! monotonic `version` label regenerated on every committed mutation.
//!
//! Snapshots travel between servers as zstd-compressed serialized buffers;
//! [`maybe_decompress`] sniffs the zstd magic so older uncompressed payloads
//! still decode.
//!
//! The replica server list is itself a configuration option stored under a
//! reserved section of the tree ([`SERVERS_OPTION`]), so membership changes
//! replicate to slaves exactly like any other option write.

use crate::error::{GridError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;

/// Reserved option holding the comma-separated list of alive servers.
pub const SERVERS_OPTION: &str = "/Mesh/Configuration/Servers";

/// Reserved option holding the master server endpoint.
pub const MASTER_OPTION: &str = "/Mesh/Configuration/MasterServer";

/// Reserved top-level section whose modifications are never user-visible.
///
/// Server list and master pointer churn under this section on every
/// membership change; diffs computed for merge purposes mask it out.
pub const RESERVED_SECTION: &str = "Mesh";

/// zstd magic bytes for decompression detection.
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// One node in the configuration tree: a scalar option or a child section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    /// Scalar option value.
    Value(String),
    /// Nested child section.
    Section(ConfigTree),
}

/// Hierarchical mapping of names to options or child sections.
///
/// `BTreeMap` gives a deterministic key order for serialization; the order
/// carries no semantic meaning.
pub type ConfigTree = BTreeMap<String, TreeNode>;

/// The full configuration tree at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// Logical configuration identity; must match between master and any
    /// submitted update.
    pub name: String,
    /// Monotonic version label, regenerated on every committed mutation.
    pub version: String,
    /// The configuration tree itself.
    pub tree: ConfigTree,
}

impl ConfigSnapshot {
    /// Create an empty snapshot with the given identity and no version.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: String::new(),
            tree: ConfigTree::new(),
        }
    }

    /// Whether a version label has ever been generated.
    pub fn has_version(&self) -> bool {
        !self.version.is_empty() && self.version != "0"
    }

    /// Generate a new, strictly greater version label.
    ///
    /// Labels are UTC timestamps with microsecond precision; if the clock
    /// has not advanced past the current label, the current label is
    /// extended instead so the ordering invariant holds regardless.
    pub fn generate_new_version(&mut self) {
        let candidate = Utc::now().format("%Y%m%d%H%M%S%6f").to_string();
        if candidate > self.version {
            self.version = candidate;
        } else {
            self.version = format!("{}1", self.version);
        }
    }

    /// Read an option by slash-separated path.
    pub fn get_option(&self, path: &str) -> Option<&str> {
        let mut parts = split_path(path);
        let last = parts.pop()?;
        let section = lookup_section(&self.tree, &parts)?;
        match section.get(last) {
            Some(TreeNode::Value(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Write an option by slash-separated path, creating intermediate
    /// sections as needed. Replaces an existing option value.
    pub fn set_option(&mut self, path: &str, value: impl Into<String>) {
        let mut parts = split_path(path);
        let Some(last) = parts.pop() else { return };
        let mut section = &mut self.tree;
        for part in parts {
            section = match section
                .entry(part.to_string())
                .or_insert_with(|| TreeNode::Section(ConfigTree::new()))
            {
                TreeNode::Section(child) => child,
                node => {
                    // An option in the way of a section path is replaced.
                    *node = TreeNode::Section(ConfigTree::new());
                    match node {
                        TreeNode::Section(child) => child,
                        TreeNode::Value(_) => unreachable!(),
                    }
                }
            };
        }
        section.insert(last.to_string(), TreeNode::Value(value.into()));
    }

    /// Remove an option by slash-separated path, returning its value.
    ///
    /// Sections are left alone: a path naming a section (or nothing at
    /// all) removes nothing.
    pub fn remove_option(&mut self, path: &str) -> Option<String> {
        let mut parts = split_path(path);
        let last = parts.pop()?;
        let section = lookup_section_mut(&mut self.tree, &parts)?;
        if !matches!(section.get(last), Some(TreeNode::Value(_))) {
            return None;
        }
        match section.remove(last) {
            Some(TreeNode::Value(v)) => Some(v),
            _ => None,
        }
    }

    /// Look up a section by slash-separated path.
    pub fn section(&self, path: &str) -> Option<&ConfigTree> {
        let parts = split_path(path);
        lookup_section(&self.tree, &parts)
    }

    /// Mutable lookup of a section by slash-separated path.
    pub fn section_mut(&mut self, path: &str) -> Option<&mut ConfigTree> {
        let parts = split_path(path);
        lookup_section_mut(&mut self.tree, &parts)
    }

    /// The alive server list, parsed from the reserved servers option.
    pub fn servers(&self) -> Vec<String> {
        self.get_option(SERVERS_OPTION)
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Overwrite the reserved servers option with a comma-joined list.
    pub fn set_servers(&mut self, servers: &[String]) {
        self.set_option(SERVERS_OPTION, servers.join(", "));
    }

    /// Record the master server endpoint in the reserved section.
    pub fn set_master_server(&mut self, url: &str) {
        self.set_option(MASTER_OPTION, url);
    }

    /// Serialize and zstd-compress for transport or archival.
    pub fn to_compressed_bytes(&self) -> Result<Vec<u8>> {
        let raw = serde_json::to_vec(self)?;
        zstd::encode_all(raw.as_slice(), 3)
            .map_err(|e| GridError::Codec(format!("zstd encode: {e}")))
    }

    /// Decode a snapshot from a (possibly compressed) wire buffer.
    pub fn from_compressed_bytes(data: &[u8]) -> Result<Self> {
        let raw = maybe_decompress(data)?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Decompress zstd data if it has the magic header, otherwise return as-is.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| GridError::Codec(format!("zstd init: {e}")))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| GridError::Codec(format!("zstd decode: {e}")))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|p| !p.is_empty()).collect()
}

fn lookup_section<'a>(tree: &'a ConfigTree, parts: &[&str]) -> Option<&'a ConfigTree> {
    let mut section = tree;
    for part in parts {
        match section.get(*part) {
            Some(TreeNode::Section(child)) => section = child,
            _ => return None,
        }
    }
    Some(section)
}

fn lookup_section_mut<'a>(
    tree: &'a mut ConfigTree,
    parts: &[&str],
) -> Option<&'a mut ConfigTree> {
    let mut section = tree;
    for part in parts {
        match section.get_mut(*part) {
            Some(TreeNode::Section(child)) => section = child,
            _ => return None,
        }
    }
    Some(section)
}
