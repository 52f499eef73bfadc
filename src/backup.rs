// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable version history: one zip archive per committed snapshot.
//!
//! Backups are append-only. Each committed write produces
//! `<configName>.<timestamp>.<committer>@<version>.zip` containing exactly
//! one member, the serialized configuration tree. Lookups walk the backup
//! directory recursively with a reverse-lexicographic sort per level, so the
//! first match is always the most recent; the newest backup doubles as the
//! merge base for the next submission.

use crate::error::{GridError, Result};
use crate::snapshot::ConfigSnapshot;
use chrono::Utc;
use regex::Regex;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Filesystem store for committed snapshot archives.
#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
    config_name: String,
}

/// One history entry parsed from a backup filename, most recent first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub version: String,
    pub committer: String,
}

impl BackupStore {
    /// Open (and create if missing) the backup directory.
    pub fn new(dir: impl Into<PathBuf>, config_name: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| GridError::backup("create backup dir", e))?;
        Ok(Self {
            dir,
            config_name: config_name.into(),
        })
    }

    /// Backup directory path.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a committed snapshot, tagged with the committer identity.
    ///
    /// Returns the path of the archive written. Disk failure is fatal to
    /// the triggering commit and never retried here.
    pub fn write(&self, snapshot: &ConfigSnapshot, committer: &str) -> Result<PathBuf> {
        // Microsecond resolution keeps the reverse-lexicographic sort
        // faithful to commit order even for back-to-back commits.
        let timestamp = Utc::now().format("%Y%m%d%H%M%S%6f").to_string();
        let filename = format!(
            "{}.{}.{}@{}.zip",
            self.config_name,
            timestamp,
            sanitize(committer),
            snapshot.version
        );
        let path = self.dir.join(&filename);
        let raw = serde_json::to_vec_pretty(snapshot)?;

        let file = File::create(&path).map_err(|e| GridError::backup("create archive", e))?;
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file(
            format!("{}.json", self.config_name),
            zip::write::SimpleFileOptions::default(),
        )
        .map_err(|e| GridError::archive("start member", e))?;
        zip.write_all(&raw)
            .map_err(|e| GridError::backup("write member", e))?;
        zip.finish().map_err(|e| GridError::archive("finish", e))?;

        info!(archive = %filename, version = %snapshot.version, "Backup written");
        Ok(path)
    }

    /// All backup archives matching a version-label prefix, most recent
    /// first. Paths are relative to the backup directory; subdirectories
    /// are searched recursively.
    pub fn scan(&self, version_prefix: &str) -> Result<Vec<PathBuf>> {
        let pattern = format!(
            "^{}\\..+@{}.*\\.zip$",
            regex::escape(&self.config_name),
            regex::escape(version_prefix)
        );
        let matcher = Regex::new(&pattern)
            .map_err(|e| GridError::Config(format!("bad backup pattern: {e}")))?;
        self.scan_dir(&self.dir, &matcher, Path::new(""))
    }

    fn scan_dir(&self, dir: &Path, matcher: &Regex, relative: &Path) -> Result<Vec<PathBuf>> {
        let mut entries: Vec<_> = fs::read_dir(dir)
            .map_err(|e| GridError::backup("read backup dir", e))?
            .filter_map(|e| e.ok())
            .collect();
        entries.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

        let mut matches = Vec::new();
        for entry in entries {
            let name = entry.file_name();
            let path = entry.path();
            if path.is_dir() {
                matches.extend(self.scan_dir(&path, matcher, &relative.join(&name))?);
            } else if let Some(name) = name.to_str() {
                if matcher.is_match(name) {
                    matches.push(relative.join(name));
                }
            }
        }
        Ok(matches)
    }

    /// The `(version, committer)` history parsed from backup filenames,
    /// most recent first. Files that do not parse are skipped.
    pub fn history(&self) -> Result<Vec<HistoryEntry>> {
        let parser = Regex::new(&format!(
            "^{}\\.\\d+\\.(?P<committer>.*)@(?P<version>[^@]+)\\.zip$",
            regex::escape(&self.config_name)
        ))
        .map_err(|e| GridError::Config(format!("bad history pattern: {e}")))?;

        let mut history = Vec::new();
        for path in self.scan("")? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(caps) = parser.captures(name) {
                history.push(HistoryEntry {
                    version: caps["version"].to_string(),
                    committer: caps["committer"].to_string(),
                });
            }
        }
        Ok(history)
    }

    /// Load the most recent backup, if any.
    pub fn load_latest(&self) -> Result<Option<ConfigSnapshot>> {
        match self.scan("")?.first() {
            Some(path) => Ok(Some(self.read_snapshot(path)?)),
            None => Ok(None),
        }
    }

    /// Load the snapshot committed at a version label (prefix match, most
    /// recent wins).
    pub fn load_at_version(&self, version: &str) -> Result<ConfigSnapshot> {
        let matches = self.scan(version)?;
        let path = matches
            .first()
            .ok_or_else(|| GridError::VersionNotFound(version.to_string()))?;
        self.read_snapshot(path)
    }

    /// The sole archive member at a version label, recompressed with zstd
    /// for transport.
    pub fn contents_at_version(&self, version: &str) -> Result<Vec<u8>> {
        let matches = self.scan(version)?;
        let path = matches
            .first()
            .ok_or_else(|| GridError::VersionNotFound(version.to_string()))?;
        let raw = self.read_member(path)?;
        zstd::encode_all(raw.as_slice(), 3).map_err(|e| GridError::Codec(format!("zstd encode: {e}")))
    }

    fn read_member(&self, relative: &Path) -> Result<Vec<u8>> {
        let path = self.dir.join(relative);
        debug!(archive = %path.display(), "Reading backup archive");
        let file = File::open(&path).map_err(|e| GridError::backup("open archive", e))?;
        let mut archive =
            zip::ZipArchive::new(file).map_err(|e| GridError::archive("open archive", e))?;
        let mut member = archive
            .by_index(0)
            .map_err(|e| GridError::archive("read member", e))?;
        let mut raw = Vec::new();
        member
            .read_to_end(&mut raw)
            .map_err(|e| GridError::backup("read member", e))?;
        Ok(raw)
    }

    fn read_snapshot(&self, relative: &Path) -> Result<ConfigSnapshot> {
        let raw = self.read_member(relative)?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Committer identities go into filenames; strip separators.
fn sanitize(committer: &str) -> String {
    let cleaned: String = committer
        .chars()
        .map(|c| match c {
            '/' | '\\' | '@' | ' ' => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        "anonymous".to_string()
    } else {
        cleaned
    }
}
