//! Read-only enumeration of content source directories.
//!
//! A content source is either a mod folder (`mods/<id>/`) or the base-content
//! folder. The engine only ever asks two things of it: "which files do you
//! provide?" and "do you (still) provide this one file?". Neither question
//! mutates anything below the source root.
//!
//! ```text
//! mods/alpha/
//!   weapons/
//!     knife.model        -> virtual path "weapons/knife.model"
//!   maps/
//!     depot.bsp          -> virtual path "maps/depot.bsp"
//! ```

use crate::error::{Error, Result};
use crate::path::VirtualPath;
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeSet;
use std::fs;

/// Filesystem-backed content source.
#[derive(Debug, Clone)]
pub struct FsContent {
    id: String,
    root: Utf8PathBuf,
    excluded: Vec<String>,
}

impl FsContent {
    /// Create a content source rooted at `root`. `id` is only used for error reporting.
    pub fn new(id: impl Into<String>, root: Utf8PathBuf) -> Self {
        Self {
            id: id.into(),
            root,
            excluded: Vec::new(),
        }
    }

    /// Hide top-level files with these names from enumeration (e.g. marker files).
    pub fn with_excluded<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Fail with [`Error::SourceUnavailable`] if the root directory is missing.
    pub fn ensure_available(&self) -> Result<()> {
        if self.root.as_std_path().is_dir() {
            Ok(())
        } else {
            Err(Error::SourceUnavailable {
                id: self.id.clone(),
                root: self.root.clone(),
            })
        }
    }

    /// Lazily walk every regular file below the root.
    ///
    /// Each call starts a fresh walk, so the enumeration can be restarted at will.
    pub fn iter_paths(&self) -> Result<ContentPaths<'_>> {
        self.ensure_available()?;
        Ok(ContentPaths {
            source: self,
            walker: walkdir::WalkDir::new(self.root.as_std_path())
                .follow_links(false)
                .sort_by_file_name()
                .into_iter(),
        })
    }

    /// Collect every provided path into a sorted, deduplicated set.
    pub fn list_paths(&self) -> Result<BTreeSet<VirtualPath>> {
        self.iter_paths()?.collect()
    }

    /// Whether this source currently provides `path` as a regular file.
    pub fn provides(&self, path: &VirtualPath) -> bool {
        self.locate(path).is_some()
    }

    /// Absolute location of `path` inside this source, spelled as given.
    pub fn file_path(&self, path: &VirtualPath) -> Utf8PathBuf {
        path.under(&self.root)
    }

    /// Find the regular file this source has for `path`, whatever its case on disk.
    ///
    /// The exact spelling is tried first. Otherwise each segment is matched
    /// against the directory entries ignoring ASCII case.
    pub fn locate(&self, path: &VirtualPath) -> Option<Utf8PathBuf> {
        if self.is_excluded(path) {
            return None;
        }

        let exact = path.under(&self.root);
        if is_regular_file(&exact) {
            return Some(exact);
        }

        let mut current = self.root.clone();
        for segment in path.segments() {
            let found = fs::read_dir(current.as_std_path())
                .ok()?
                .filter_map(|entry| entry.ok()?.file_name().into_string().ok())
                .find(|name| name.eq_ignore_ascii_case(segment))?;
            current.push(found);
        }
        is_regular_file(&current).then_some(current)
    }

    /// Every directory below the root, relative to it (used for pruning).
    pub fn list_dirs(&self) -> Result<Vec<VirtualPath>> {
        self.ensure_available()?;
        let mut dirs = Vec::new();
        for entry in walkdir::WalkDir::new(self.root.as_std_path())
            .follow_links(false)
            .min_depth(1)
        {
            let entry = entry.map_err(walk_error)?;
            if !entry.file_type().is_dir() {
                continue;
            }
            if let Some(rel) = self.relative(entry.path()) {
                dirs.push(rel);
            }
        }
        Ok(dirs)
    }

    fn is_excluded(&self, path: &VirtualPath) -> bool {
        !path.as_str().contains('/')
            && self
                .excluded
                .iter()
                .any(|name| name.eq_ignore_ascii_case(path.as_str()))
    }

    fn relative(&self, path: &std::path::Path) -> Option<VirtualPath> {
        let utf8 = match Utf8Path::from_path(path) {
            Some(p) => p,
            None => {
                tracing::warn!("Skipping non-UTF-8 path: {}", path.display());
                return None;
            }
        };
        let rel = utf8.strip_prefix(&self.root).ok()?;
        VirtualPath::from_relative(rel).ok()
    }
}

/// Lazy iterator returned by [`FsContent::iter_paths`].
pub struct ContentPaths<'a> {
    source: &'a FsContent,
    walker: walkdir::IntoIter,
}

impl Iterator for ContentPaths<'_> {
    type Item = Result<VirtualPath>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(walk_error(e))),
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let Some(path) = self.source.relative(entry.path()) else {
                continue;
            };
            if self.source.is_excluded(&path) {
                continue;
            }
            return Some(Ok(path));
        }
    }
}

fn is_regular_file(path: &Utf8Path) -> bool {
    fs::symlink_metadata(path.as_std_path())
        .map(|meta| meta.file_type().is_file())
        .unwrap_or(false)
}

fn walk_error(e: walkdir::Error) -> Error {
    match e.into_io_error() {
        Some(io) => Error::Io(io),
        None => Error::Io(std::io::Error::other("filesystem loop detected")),
    }
}
