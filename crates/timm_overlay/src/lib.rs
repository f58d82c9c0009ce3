//! Symlink mount engine for Tactical Intervention mods.
//!
//! This crate overlays the files of several content sources (mods plus the
//! original game content) onto a single mount directory, one link per file. It
//! supports:
//!
//! - **Priority overlay**: the higher priority source owns a contested path
//! - **Fallback on unmount**: released paths go to the next best provider
//! - **Base content**: original game files fill every path no mod provides
//! - **Persistent manifest**: ownership is tracked in `timm.json` and saved atomically
//! - **Drift detection**: compare the manifest with what is actually on disk
//!
//! # Example
//!
//! ```no_run
//! use timm_overlay::{EnginePaths, MountEngine};
//! use camino::Utf8PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let game = Utf8PathBuf::from("C:/Steam/steamapps/common/Tactical Intervention");
//!
//! let engine = MountEngine::new(EnginePaths {
//!     manifest: game.join("timm.json"),
//!     mount_root: game.join("mapkit"),
//!     mods_dir: game.join("mods"),
//!     base_content_dir: game.join("_timm/base"),
//! })?
//! .with_progress(|progress| {
//!     println!("{}: {}/{}", progress.operation, progress.current, progress.total);
//! });
//!
//! engine.register_source("my-mod", Some("1.0.0"), 10)?;
//! let report = engine.mount_source("my-mod")?;
//! println!("Linked {} files, {} kept by other mods",
//!     report.linked.len(), report.denied.len());
//! # Ok(())
//! # }
//! ```

pub mod content;
pub mod engine;
pub mod error;
pub mod link;
pub mod manifest;
pub mod path;
pub mod reconcile;
pub mod resolver;

// Re-export main types
pub use content::FsContent;
pub use engine::{
    CancellationToken, EngineOptions, EnginePaths, MountEngine, MountProgress, MountReport,
    SourceStatus, StatusReport, UnmountReport, PATCHED_MARKER,
};
pub use error::{Error, Operation, PathFailure, Result};
pub use link::{LinkMaterializer, LinkState, SymlinkMaterializer};
pub use manifest::{
    source_id_from_name, Manifest, ManifestStore, SourceRecord, BASE_CONTENT_ID,
    DEFAULT_SOURCE_VERSION,
};
pub use path::VirtualPath;
pub use reconcile::{Drift, ReconcileReport};
pub use resolver::{resolve, Denied, Resolution};
