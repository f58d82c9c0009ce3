//! Directory layout of a managed game install.

use crate::game_path::GAME_FOLDER_NAME;
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

/// Base-content location relative to the game root when none is configured.
pub const DEFAULT_BASE_CONTENT_DIR: &str = "_timm/base";

#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error("'{0}' is not a Tactical Intervention install (folder must be named 'Tactical Intervention')")]
    NotGameDirectory(Utf8PathBuf),

    #[error("Required directory is missing: {0}")]
    MissingDirectory(Utf8PathBuf),

    #[error("Failed to create {path}: {source}")]
    CreateDirectory {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Every location the mod manager reads or writes, derived from the game root.
///
/// ```text
/// Tactical Intervention/
///   tacint/        game content (required)
///   bin/           game binaries (required)
///   mapkit/        mount root
///   mods/<id>/     one folder per installed mod
///   temp/          scratch space
///   timm.json      mount manifest
///   _timm/base/    base content (default)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameLayout {
    root: Utf8PathBuf,
    base_content_dir: Utf8PathBuf,
}

impl GameLayout {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        let root = root.into();
        let base_content_dir = root.join(DEFAULT_BASE_CONTENT_DIR);
        Self {
            root,
            base_content_dir,
        }
    }

    /// Use a different base-content directory. Relative paths are taken from the game root.
    pub fn with_base_content_dir(mut self, dir: impl AsRef<Utf8Path>) -> Self {
        self.base_content_dir = self.root.join(dir.as_ref());
        self
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn content_dir(&self) -> Utf8PathBuf {
        self.root.join("tacint")
    }

    pub fn bin_dir(&self) -> Utf8PathBuf {
        self.root.join("bin")
    }

    pub fn mount_dir(&self) -> Utf8PathBuf {
        self.root.join("mapkit")
    }

    pub fn mods_dir(&self) -> Utf8PathBuf {
        self.root.join("mods")
    }

    pub fn temp_dir(&self) -> Utf8PathBuf {
        self.root.join("temp")
    }

    pub fn manifest_path(&self) -> Utf8PathBuf {
        self.root.join("timm.json")
    }

    pub fn base_content_dir(&self) -> &Utf8Path {
        &self.base_content_dir
    }

    /// Check that the root looks like a game install.
    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.root.file_name() != Some(GAME_FOLDER_NAME) {
            return Err(LayoutError::NotGameDirectory(self.root.clone()));
        }

        for required in [self.content_dir(), self.bin_dir()] {
            if !required.is_dir() {
                return Err(LayoutError::MissingDirectory(required));
            }
        }
        Ok(())
    }

    /// Create the directories the manager owns (`mapkit/`, `mods/`, `temp/`).
    pub fn ensure_dirs(&self) -> Result<(), LayoutError> {
        for dir in [self.mount_dir(), self.mods_dir(), self.temp_dir()] {
            if dir.is_dir() {
                continue;
            }
            fs::create_dir_all(&dir).map_err(|source| LayoutError::CreateDirectory {
                path: dir.clone(),
                source,
            })?;
            tracing::debug!("Created {}", dir);
        }
        Ok(())
    }
}
