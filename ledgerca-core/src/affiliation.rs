//! Dotted affiliation paths and the nested bootstrap tree.
//!
//! Affiliations form a hierarchy addressed by dotted paths (`org1.dept1`).
//! The empty path is the implicit root and always exists. A child refers to
//! its parent by path only, so the parent must be present before the child
//! is inserted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Path of the implicit root affiliation.
pub const ROOT: &str = "";

/// One node of the affiliation tree as it appears in configuration.
///
/// ```yaml
/// affiliations:
///   org1:
///     - dept1
///     - dept2:
///         - team1
///   org2: ~
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AffiliationNode {
    /// A single affiliation name with no children.
    Leaf(String),
    /// Siblings, in order, under the current parent.
    Sequence(Vec<AffiliationNode>),
    /// Names mapped to their (optional) children.
    Mapping(BTreeMap<String, Option<AffiliationNode>>),
}

/// An affiliation to insert, with the parent it hangs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffiliationEntry {
    pub path: String,
    pub parent: String,
}

impl AffiliationNode {
    /// Flatten the tree below `parent` into insertion order.
    ///
    /// Every entry comes after the entry for its parent (pre-order), so
    /// inserting sequentially never references a missing parent.
    pub fn insertion_order(&self, parent: &str) -> Vec<AffiliationEntry> {
        let mut out = Vec::new();
        self.collect(parent, &mut out);
        out
    }

    fn collect(&self, parent: &str, out: &mut Vec<AffiliationEntry>) {
        match self {
            Self::Leaf(name) => {
                out.push(AffiliationEntry {
                    path: join(parent, name),
                    parent: parent.to_string(),
                });
            }
            Self::Sequence(nodes) => {
                for node in nodes {
                    node.collect(parent, out);
                }
            }
            Self::Mapping(children) => {
                for (name, child) in children {
                    let path = join(parent, name);
                    out.push(AffiliationEntry {
                        path: path.clone(),
                        parent: parent.to_string(),
                    });
                    if let Some(child) = child {
                        child.collect(&path, out);
                    }
                }
            }
        }
    }
}

/// Full path of `name` under `parent`.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}.{name}")
    }
}

/// Parent path of `path`; the root for top-level affiliations.
pub fn parent_of(path: &str) -> &str {
    path.rsplit_once('.').map(|(parent, _)| parent).unwrap_or(ROOT)
}

/// Whether `path` equals `scope` or lies beneath it. Everything is within
/// the root.
pub fn is_within(path: &str, scope: &str) -> bool {
    if scope.is_empty() || path == scope {
        return true;
    }
    path.strip_prefix(scope)
        .map(|rest| rest.starts_with('.'))
        .unwrap_or(false)
}
