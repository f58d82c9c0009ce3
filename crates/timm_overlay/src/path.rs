//! Virtual path normalization.
//!
//! A [`VirtualPath`] is a file location relative to both a content source root
//! and the mount root. Sources on disk may spell the same file differently
//! (`weapons\knife.model`, `./weapons/knife.model`), so every path is
//! normalized once on construction.
//!
//! The game runs on Windows, where `Materials/x.vmt` and `materials/x.vmt` are
//! the same file. Paths therefore keep their spelling for display and linking
//! but compare, order and hash on an ASCII-lower-cased key.

use crate::error::{Error, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A normalized relative path shared by every content source and the mount root.
///
/// Invariants: forward slashes only, no empty, `.` or `..` segments, not absolute,
/// not empty. Equality and ordering ignore ASCII case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VirtualPath {
    path: String,
    key: String,
}

impl VirtualPath {
    /// Normalize `raw` into a virtual path.
    ///
    /// - `weapons\knife.model` -> `weapons/knife.model`
    /// - `./weapons//knife.model` -> `weapons/knife.model`
    /// - `../knife.model`, `/abs/path`, `C:/x` -> error
    pub fn new(raw: &str) -> Result<Self> {
        let unified = raw.replace('\\', "/");

        if unified.starts_with('/') || has_drive_prefix(&unified) {
            return Err(invalid(raw, "path must be relative"));
        }

        let mut segments = Vec::new();
        for segment in unified.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Err(invalid(raw, "path must not contain '..'")),
                s => segments.push(s),
            }
        }

        if segments.is_empty() {
            return Err(invalid(raw, "path is empty"));
        }

        Ok(Self::from_normalized(segments.join("/")))
    }

    fn from_normalized(path: String) -> Self {
        let key = path.to_ascii_lowercase();
        Self { path, key }
    }

    /// Build a virtual path from a path relative to some root.
    pub fn from_relative(rel: &Utf8Path) -> Result<Self> {
        Self::new(rel.as_str())
    }

    /// The path as spelled by whoever constructed it.
    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('/')
    }

    /// Location of this path below `root` using native separators.
    pub fn under(&self, root: &Utf8Path) -> Utf8PathBuf {
        let mut out = root.to_path_buf();
        for segment in self.segments() {
            out.push(segment);
        }
        out
    }

    /// Parent directories of this path, deepest first (`d/e/f` -> `["d/e", "d"]`).
    pub fn parent_dirs(&self) -> Vec<&str> {
        let mut dirs = Vec::new();
        let mut rest = self.path.as_str();
        while let Some(idx) = rest.rfind('/') {
            rest = &rest[..idx];
            dirs.push(rest);
        }
        dirs
    }
}

fn has_drive_prefix(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn invalid(raw: &str, reason: &'static str) -> Error {
    Error::InvalidVirtualPath {
        path: raw.to_string(),
        reason,
    }
}

impl TryFrom<String> for VirtualPath {
    type Error = Error;

    /// Strict conversion used when reading the manifest: the stored string must
    /// already be in normalized form.
    fn try_from(value: String) -> Result<Self> {
        let normalized = Self::new(&value)?;
        if normalized.path != value {
            return Err(invalid(&value, "path is not normalized"));
        }
        Ok(normalized)
    }
}

impl From<VirtualPath> for String {
    fn from(value: VirtualPath) -> Self {
        value.path
    }
}

impl PartialEq for VirtualPath {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for VirtualPath {}

impl PartialOrd for VirtualPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VirtualPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl Hash for VirtualPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl AsRef<str> for VirtualPath {
    fn as_ref(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}
