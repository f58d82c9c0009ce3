//! Drift detection between the manifest and the mount root.
//!
//! The manifest is the intended state; the links in the mount root are the
//! actual state. They can diverge when an operation is interrupted between the
//! path pass and the manifest save, or when something outside the engine edits
//! the mount root. [`reconcile`] reports every divergence without repairing it.

use crate::error::Result;
use crate::link::{LinkMaterializer, LinkState};
use crate::manifest::Manifest;
use crate::path::VirtualPath;
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeSet;

/// One divergence between the manifest and the disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drift {
    /// The manifest records an owner but nothing is mounted there.
    MissingLink { path: VirtualPath, owner: String },
    /// A link exists but points somewhere other than the owner's file.
    WrongTarget {
        path: VirtualPath,
        owner: String,
        expected: Utf8PathBuf,
        actual: Utf8PathBuf,
    },
    /// A regular file or directory sits where a link is expected.
    NotALink { path: VirtualPath, owner: String },
    /// The recorded owner has no source record.
    UnknownOwner { path: VirtualPath, owner: String },
    /// A link in the mount root that the manifest does not know about.
    UntrackedLink { path: VirtualPath, target: Utf8PathBuf },
}

impl Drift {
    pub fn path(&self) -> &VirtualPath {
        match self {
            Drift::MissingLink { path, .. }
            | Drift::WrongTarget { path, .. }
            | Drift::NotALink { path, .. }
            | Drift::UnknownOwner { path, .. }
            | Drift::UntrackedLink { path, .. } => path,
        }
    }
}

impl std::fmt::Display for Drift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Drift::MissingLink { path, owner } => {
                write!(f, "{path}: owned by '{owner}' but not mounted")
            }
            Drift::WrongTarget {
                path,
                owner,
                expected,
                actual,
            } => write!(
                f,
                "{path}: owned by '{owner}', expected link to {expected} but found {actual}"
            ),
            Drift::NotALink { path, owner } => {
                write!(f, "{path}: owned by '{owner}' but occupied by a regular file")
            }
            Drift::UnknownOwner { path, owner } => {
                write!(f, "{path}: owner '{owner}' is not a registered source")
            }
            Drift::UntrackedLink { path, target } => {
                write!(f, "{path}: untracked link to {target}")
            }
        }
    }
}

/// Result of [`reconcile`], sorted by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub drift: Vec<Drift>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.drift.is_empty()
    }
}

/// Compare every manifest entry with the mount root, then look for links the
/// manifest does not track. `source_file` maps an owner id and a path to the
/// file that owner provides for it.
pub fn reconcile<F>(
    manifest: &Manifest,
    mount_root: &Utf8Path,
    materializer: &dyn LinkMaterializer,
    source_file: F,
) -> Result<ReconcileReport>
where
    F: Fn(&str, &VirtualPath) -> Utf8PathBuf,
{
    let mut report = ReconcileReport::default();

    for (path, owner) in &manifest.mount_manifest {
        report.checked += 1;

        let Some(record) = manifest.source(owner) else {
            report.drift.push(Drift::UnknownOwner {
                path: path.clone(),
                owner: owner.clone(),
            });
            continue;
        };

        let expected = source_file(&record.id, path);
        match materializer.inspect(path, mount_root) {
            LinkState::Absent => report.drift.push(Drift::MissingLink {
                path: path.clone(),
                owner: owner.clone(),
            }),
            LinkState::Foreign => report.drift.push(Drift::NotALink {
                path: path.clone(),
                owner: owner.clone(),
            }),
            LinkState::Linked(actual) if actual != expected => {
                report.drift.push(Drift::WrongTarget {
                    path: path.clone(),
                    owner: owner.clone(),
                    expected,
                    actual,
                })
            }
            LinkState::Linked(_) => {}
        }
    }

    if mount_root.as_std_path().is_dir() {
        let tracked: BTreeSet<&VirtualPath> = manifest.mount_manifest.keys().collect();

        for entry in walkdir::WalkDir::new(mount_root.as_std_path())
            .follow_links(false)
            .min_depth(1)
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Skipping unreadable mount entry: {}", e);
                    continue;
                }
            };
            if !entry.path_is_symlink() {
                continue;
            }
            let Some(rel) = Utf8Path::from_path(entry.path())
                .and_then(|p| p.strip_prefix(mount_root).ok())
                .and_then(|rel| VirtualPath::from_relative(rel).ok())
            else {
                continue;
            };
            if tracked.contains(&rel) {
                continue;
            }
            if let LinkState::Linked(target) = materializer.inspect(&rel, mount_root) {
                report.drift.push(Drift::UntrackedLink { path: rel, target });
            }
        }
    }

    report.drift.sort_by(|a, b| a.path().cmp(b.path()));
    tracing::info!(
        "Reconciled {} manifest entries, {} drift(s)",
        report.checked,
        report.drift.len()
    );
    Ok(report)
}
