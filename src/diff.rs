//! Modification records: structural diffs between configuration trees.
//!
//! A [`Modification`] is a tagged action against one name inside a section;
//! section modifications nest a child list. Modification lists are an
//! in-memory representation only and are never persisted.
//!
//! Three entry points:
//! - [`modifications_between`] computes the diff of two trees,
//! - [`check_conflicts`] decides whether two diff lists sharing a common
//!   base can coexist (the auto-merge precondition),
//! - [`apply_modifications`] replays a diff list onto a tree.

use crate::error::{GridError, Result};
use crate::snapshot::{ConfigTree, TreeNode};

/// One tagged action against a named entry of a section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    /// A section that exists only in the target tree.
    AddSection { name: String, contents: ConfigTree },
    /// A section that exists only in the source tree.
    DeleteSection { name: String },
    /// A section present in both trees with differing contents.
    ModifySection {
        name: String,
        children: Vec<Modification>,
    },
    /// An option that exists only in the target tree.
    AddOption { name: String, value: String },
    /// An option that exists only in the source tree.
    DeleteOption { name: String },
    /// An option present in both trees with differing values.
    ModifyOption { name: String, value: String },
}

impl Modification {
    /// Target name of this action.
    pub fn name(&self) -> &str {
        match self {
            Self::AddSection { name, .. }
            | Self::DeleteSection { name }
            | Self::ModifySection { name, .. }
            | Self::AddOption { name, .. }
            | Self::DeleteOption { name }
            | Self::ModifyOption { name, .. } => name,
        }
    }

    /// Whether this action targets a section.
    pub fn is_section_action(&self) -> bool {
        matches!(
            self,
            Self::AddSection { .. } | Self::DeleteSection { .. } | Self::ModifySection { .. }
        )
    }

    /// Whether this action targets a scalar option.
    pub fn is_option_action(&self) -> bool {
        !self.is_section_action()
    }
}

/// Compute the modifications that turn `from` into `to`.
///
/// Entries only in `to` become adds, entries only in `from` become deletes,
/// shared sections recurse into [`Modification::ModifySection`] (emitted only
/// when the child list is non-empty). An entry changing kind (option to
/// section or back) becomes a delete plus an add.
pub fn modifications_between(from: &ConfigTree, to: &ConfigTree) -> Vec<Modification> {
    let mut mods = Vec::new();

    for (name, node) in to {
        match (from.get(name), node) {
            (None, TreeNode::Section(contents)) => mods.push(Modification::AddSection {
                name: name.clone(),
                contents: contents.clone(),
            }),
            (None, TreeNode::Value(value)) => mods.push(Modification::AddOption {
                name: name.clone(),
                value: value.clone(),
            }),
            (Some(TreeNode::Section(old)), TreeNode::Section(new)) => {
                let children = modifications_between(old, new);
                if !children.is_empty() {
                    mods.push(Modification::ModifySection {
                        name: name.clone(),
                        children,
                    });
                }
            }
            (Some(TreeNode::Value(old)), TreeNode::Value(new)) => {
                if old != new {
                    mods.push(Modification::ModifyOption {
                        name: name.clone(),
                        value: new.clone(),
                    });
                }
            }
            // Kind changed: delete the old entry, add the new one.
            (Some(TreeNode::Value(_)), TreeNode::Section(contents)) => {
                mods.push(Modification::DeleteOption { name: name.clone() });
                mods.push(Modification::AddSection {
                    name: name.clone(),
                    contents: contents.clone(),
                });
            }
            (Some(TreeNode::Section(_)), TreeNode::Value(value)) => {
                mods.push(Modification::DeleteSection { name: name.clone() });
                mods.push(Modification::AddOption {
                    name: name.clone(),
                    value: value.clone(),
                });
            }
        }
    }

    for (name, node) in from {
        if !to.contains_key(name) {
            match node {
                TreeNode::Section(_) => {
                    mods.push(Modification::DeleteSection { name: name.clone() })
                }
                TreeNode::Value(_) => mods.push(Modification::DeleteOption { name: name.clone() }),
            }
        }
    }

    mods
}

/// Decide whether `requested` can be replayed next to `real`.
///
/// Both lists are diffs from the same base. The rule:
/// - a requested add or delete of a section the real list also touched
///   conflicts,
/// - a section both lists modified recurses into the child lists,
/// - once a commonly-touched section is reached, any option-level
///   modification in the real list makes the section unmergeable.
///
/// Failure messages name the colliding section or option path so the
/// submitter can remediate directly.
pub fn check_conflicts(
    real: &[Modification],
    requested: &[Modification],
    parent: &str,
) -> Result<()> {
    let real_sections: std::collections::HashMap<&str, Option<&[Modification]>> = real
        .iter()
        .filter(|m| m.is_section_action())
        .map(|m| match m {
            Modification::ModifySection { name, children } => {
                (name.as_str(), Some(children.as_slice()))
            }
            other => (other.name(), None),
        })
        .collect();

    for modification in requested {
        match modification {
            Modification::AddSection { name, .. } => {
                if real_sections.contains_key(name.as_str()) {
                    return Err(GridError::Merge(format!(
                        "section {parent}/{name} already exists"
                    )));
                }
            }
            Modification::DeleteSection { name } => {
                if real_sections.contains_key(name.as_str()) {
                    return Err(GridError::Merge(format!(
                        "section {parent}/{name} cannot be deleted, it has been modified"
                    )));
                }
            }
            Modification::ModifySection { name, children } => {
                if let Some(Some(real_children)) = real_sections.get(name.as_str()) {
                    check_conflicts(real_children, children, &format!("{parent}/{name}"))?;
                }
            }
            _ => {}
        }
    }

    for modification in real {
        if modification.is_option_action() {
            let name = modification.name();
            return Err(GridError::Merge(format!(
                "section {parent} cannot be merged, option {parent}/{name} has been modified"
            )));
        }
    }

    Ok(())
}

/// Replay a modification list onto a tree.
pub fn apply_modifications(tree: &mut ConfigTree, mods: &[Modification]) -> Result<()> {
    for modification in mods {
        match modification {
            Modification::AddSection { name, contents } => {
                if tree.contains_key(name) {
                    return Err(GridError::Merge(format!(
                        "cannot add section {name}: it already exists"
                    )));
                }
                tree.insert(name.clone(), TreeNode::Section(contents.clone()));
            }
            Modification::DeleteSection { name } => {
                match tree.remove(name) {
                    Some(TreeNode::Section(_)) => {}
                    _ => {
                        return Err(GridError::Merge(format!(
                            "cannot delete section {name}: not present"
                        )))
                    }
                };
            }
            Modification::ModifySection { name, children } => match tree.get_mut(name) {
                Some(TreeNode::Section(child)) => apply_modifications(child, children)?,
                _ => {
                    return Err(GridError::Merge(format!(
                        "cannot modify section {name}: not present"
                    )))
                }
            },
            Modification::AddOption { name, value } | Modification::ModifyOption { name, value } => {
                tree.insert(name.clone(), TreeNode::Value(value.clone()));
            }
            Modification::DeleteOption { name } => {
                match tree.remove(name) {
                    Some(TreeNode::Value(_)) => {}
                    _ => {
                        return Err(GridError::Merge(format!(
                            "cannot delete option {name}: not present"
                        )))
                    }
                };
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ConfigSnapshot;

    fn base() -> ConfigSnapshot {
        let mut snap = ConfigSnapshot::new("t");
        snap.set_option("/Systems/Port", "9197");
        snap.set_option("/Systems/Protocol", "dips");
        snap.set_option("/Registry/DefaultGroup", "user");
        snap
    }

    #[test]
    fn test_identical_trees_have_no_modifications() {
        let snap = base();
        assert!(modifications_between(&snap.tree, &snap.tree).is_empty());
    }

    #[test]
    fn test_option_change_is_nested_modify() {
        let from = base();
        let mut to = base();
        to.set_option("/Systems/Port", "9198");
        let mods = modifications_between(&from.tree, &to.tree);
        assert_eq!(mods.len(), 1);
        match &mods[0] {
            Modification::ModifySection { name, children } => {
                assert_eq!(name, "Systems");
                assert_eq!(
                    children,
                    &vec![Modification::ModifyOption {
                        name: "Port".into(),
                        value: "9198".into()
                    }]
                );
            }
            other => panic!("unexpected modification: {other:?}"),
        }
    }

    #[test]
    fn test_new_section_is_add() {
        let from = base();
        let mut to = base();
        to.set_option("/Operations/Banning/Status", "Active");
        let mods = modifications_between(&from.tree, &to.tree);
        assert!(matches!(
            &mods[0],
            Modification::AddSection { name, .. } if name == "Operations"
        ));
    }

    #[test]
    fn test_removed_section_is_delete() {
        let mut from = base();
        from.set_option("/Operations/Banning/Status", "Active");
        let to = base();
        let mods = modifications_between(&from.tree, &to.tree);
        assert!(mods.contains(&Modification::DeleteSection {
            name: "Operations".into()
        }));
    }

    #[test]
    fn test_kind_change_is_delete_plus_add() {
        let mut from = ConfigSnapshot::new("t");
        from.set_option("/A", "scalar");
        let mut to = ConfigSnapshot::new("t");
        to.set_option("/A/B", "nested");
        let mods = modifications_between(&from.tree, &to.tree);
        assert_eq!(mods.len(), 2);
        assert!(matches!(mods[0], Modification::DeleteOption { .. }));
        assert!(matches!(mods[1], Modification::AddSection { .. }));
    }

    #[test]
    fn test_apply_round_trips_diff() {
        let from = base();
        let mut to = base();
        to.set_option("/Systems/Port", "9999");
        to.set_option("/Operations/Mode", "on");
        let mods = modifications_between(&from.tree, &to.tree);

        let mut replayed = from.tree.clone();
        apply_modifications(&mut replayed, &mods).unwrap();
        assert_eq!(replayed, to.tree);
    }

    #[test]
    fn test_apply_add_existing_section_fails() {
        let mut tree = base().tree;
        let mods = vec![Modification::AddSection {
            name: "Systems".into(),
            contents: ConfigTree::new(),
        }];
        assert!(apply_modifications(&mut tree, &mods).is_err());
    }

    #[test]
    fn test_conflict_add_over_touched_section() {
        let real = vec![Modification::ModifySection {
            name: "Systems".into(),
            children: vec![],
        }];
        let requested = vec![Modification::AddSection {
            name: "Systems".into(),
            contents: ConfigTree::new(),
        }];
        let err = check_conflicts(&real, &requested, "").unwrap_err();
        assert!(err.to_string().contains("/Systems"));
    }

    #[test]
    fn test_conflict_delete_of_modified_section() {
        let real = vec![Modification::ModifySection {
            name: "Systems".into(),
            children: vec![],
        }];
        let requested = vec![Modification::DeleteSection {
            name: "Systems".into(),
        }];
        assert!(check_conflicts(&real, &requested, "").is_err());
    }

    #[test]
    fn test_conflict_option_modified_in_real_list() {
        let real = vec![Modification::ModifyOption {
            name: "Port".into(),
            value: "1".into(),
        }];
        let requested = vec![Modification::AddSection {
            name: "Operations".into(),
            contents: ConfigTree::new(),
        }];
        let err = check_conflicts(&real, &requested, "/Systems").unwrap_err();
        assert!(err.to_string().contains("/Systems/Port"));
    }

    #[test]
    fn test_disjoint_section_changes_do_not_conflict() {
        let real = vec![Modification::ModifySection {
            name: "Systems".into(),
            children: vec![Modification::AddSection {
                name: "New".into(),
                contents: ConfigTree::new(),
            }],
        }];
        let requested = vec![Modification::AddSection {
            name: "Operations".into(),
            contents: ConfigTree::new(),
        }];
        assert!(check_conflicts(&real, &requested, "").is_ok());
    }

    #[test]
    fn test_common_modify_recurses_and_finds_nested_conflict() {
        let real = vec![Modification::ModifySection {
            name: "Systems".into(),
            children: vec![Modification::ModifyOption {
                name: "Port".into(),
                value: "1".into(),
            }],
        }];
        let requested = vec![Modification::ModifySection {
            name: "Systems".into(),
            children: vec![Modification::AddSection {
                name: "Sub".into(),
                contents: ConfigTree::new(),
            }],
        }];
        let err = check_conflicts(&real, &requested, "").unwrap_err();
        assert!(err.to_string().contains("/Systems/Port"));
    }
}
