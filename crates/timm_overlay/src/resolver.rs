//! Conflict resolution between content sources.
//!
//! [`resolve`] is a pure function of a manifest snapshot and one candidate
//! source. Each path is decided on its own against the snapshot, so the result
//! does not depend on the order in which paths are supplied.
//!
//! | Current owner of the path          | Decision                      |
//! |------------------------------------|-------------------------------|
//! | none                               | granted                       |
//! | the candidate itself               | granted (ownership reasserted)|
//! | base content / unknown source      | granted                       |
//! | source with lower priority         | granted (displaces it)        |
//! | source with equal priority         | denied (incumbent keeps it)   |
//! | source with higher priority        | denied                        |

use crate::manifest::{Manifest, BASE_CONTENT_ID};
use crate::path::VirtualPath;
use std::collections::BTreeSet;

/// Why a path was not granted to the candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denied {
    pub path: VirtualPath,
    /// Source that keeps the path.
    pub owner: String,
    pub owner_priority: i32,
}

impl Denied {
    /// Equal-priority collisions are legal but worth a warning.
    pub fn is_tie(&self, candidate_priority: i32) -> bool {
        self.owner_priority == candidate_priority
    }
}

/// Outcome of resolving one candidate against a manifest snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Paths the candidate may link now (includes `reasserted` and `displaced`).
    pub granted: BTreeSet<VirtualPath>,
    /// Granted paths the candidate already owned.
    pub reasserted: BTreeSet<VirtualPath>,
    /// Granted paths taken from another source, with that source's id.
    pub displaced: Vec<(VirtualPath, String)>,
    /// Paths an incumbent keeps.
    pub denied: Vec<Denied>,
}

/// Decide which of `candidate_paths` the candidate may claim.
pub fn resolve<'a, I>(
    manifest: &Manifest,
    candidate_id: &str,
    candidate_priority: i32,
    candidate_paths: I,
) -> Resolution
where
    I: IntoIterator<Item = &'a VirtualPath>,
{
    let mut resolution = Resolution::default();

    for path in candidate_paths {
        let Some(owner) = manifest.owner(path) else {
            resolution.granted.insert(path.clone());
            continue;
        };

        if owner.eq_ignore_ascii_case(candidate_id) {
            resolution.granted.insert(path.clone());
            resolution.reasserted.insert(path.clone());
            continue;
        }

        let owner_priority = if owner == BASE_CONTENT_ID {
            None
        } else {
            manifest.source(owner).map(|record| record.priority)
        };

        match owner_priority {
            Some(owner_priority) if owner_priority >= candidate_priority => {
                resolution.denied.push(Denied {
                    path: path.clone(),
                    owner: owner.to_string(),
                    owner_priority,
                });
            }
            _ => {
                resolution.granted.insert(path.clone());
                resolution
                    .displaced
                    .push((path.clone(), owner.to_string()));
            }
        }
    }

    resolution.displaced.sort();
    resolution.denied.sort_by(|a, b| a.path.cmp(&b.path));
    resolution
}
