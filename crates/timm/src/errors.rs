use camino::Utf8PathBuf;
use miette::{Diagnostic, SourceSpan};
use thiserror::Error;
use timm_core::LayoutError;

#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    #[error("Could not find the Tactical Intervention folder")]
    #[diagnostic(
        code(game::not_found),
        help("Run 'timm config auto-detect', 'timm config set-game-dir <path>', or pass --game-dir")
    )]
    GameDirNotFound,

    #[error("Invalid game folder: {path}")]
    #[diagnostic(
        code(game::invalid_dir),
        help("Point timm at the 'Tactical Intervention' folder that contains tacint/ and bin/")
    )]
    InvalidGameDir {
        path: Utf8PathBuf,
        #[source]
        source: LayoutError,
    },

    #[error("Invalid mod name: {name}")]
    #[diagnostic(
        code(mod_source::invalid_name),
        help("Mod names must be alphanumeric and contain no spaces or special characters")
    )]
    InvalidModName {
        name: String,
        #[label("invalid mod name")]
        span: Option<SourceSpan>,
    },

    #[error("Invalid version format: {version}")]
    #[diagnostic(
        code(mod_source::invalid_version),
        help("Version must follow semantic versioning (e.g., 1.0.0, 2.1.3-beta)")
    )]
    InvalidVersion {
        version: String,
        #[label("invalid version")]
        span: Option<SourceSpan>,
    },

    #[error("Mod '{id}' is not registered")]
    #[diagnostic(
        code(mod_source::not_found),
        help("Run 'timm status' to list registered mods, or 'timm register {id}' to add it")
    )]
    ModNotFound { id: String },

    #[error("Mod '{id}' is still mounted")]
    #[diagnostic(
        code(mod_source::mounted),
        help("Run 'timm unmount {id}' first")
    )]
    ModMounted { id: String },

    #[error("Files for '{id}' are missing: {root}")]
    #[diagnostic(
        code(mod_source::unavailable),
        help("Extract the mod into this folder, then mount it again")
    )]
    SourceUnavailable { id: String, root: Utf8PathBuf },

    #[error("The mount manifest is corrupt: {path}")]
    #[diagnostic(
        code(manifest::corrupt),
        help("{reason}. timm never repairs timm.json on its own; restore it from a backup or fix it by hand")
    )]
    CorruptManifest { path: Utf8PathBuf, reason: String },

    #[error("Failed to write the mount manifest: {path}")]
    #[diagnostic(
        code(manifest::write_failed),
        help("The mount directory and timm.json may now disagree. Run 'timm reconcile' after fixing the cause")
    )]
    ManifestWriteFailed {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Another timm operation is running")]
    #[diagnostic(
        code(manifest::locked),
        help("Wait for it to finish. If nothing is running, delete {lock_path}")
    )]
    Locked { lock_path: Utf8PathBuf },

    #[error("{operation} failed for {count} path(s)")]
    #[diagnostic(
        code(mount::incomplete),
        help("{details}\nAll other paths were applied. On Windows, creating links requires Developer Mode or an administrator prompt")
    )]
    Incomplete {
        operation: String,
        count: usize,
        details: String,
    },

    #[error("Cancelled after {applied} of {total} path(s)")]
    #[diagnostic(
        code(mount::cancelled),
        help("The finished paths were recorded. Run the command again to complete it")
    )]
    Cancelled { applied: usize, total: usize },

    #[error("Found {count} difference(s) between timm.json and the mount directory")]
    #[diagnostic(
        code(mount::drift),
        help("Re-run 'timm mount' or 'timm unmount' for the affected mods")
    )]
    DriftDetected { count: usize },

    #[error("Mount engine error")]
    #[diagnostic(code(mount::engine))]
    Engine {
        #[source]
        source: timm_overlay::Error,
    },

    #[error("Failed to save config: {path}")]
    #[diagnostic(
        code(config::save_failed),
        help("Check that the folder containing the timm executable is writable")
    )]
    ConfigSaveFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO operation failed")]
    #[diagnostic(code(io::operation_failed))]
    IoError {
        #[from]
        source: std::io::Error,
    },
}

impl CliError {
    pub fn invalid_game_dir(path: Utf8PathBuf, source: LayoutError) -> Self {
        Self::InvalidGameDir { path, source }
    }

    pub fn invalid_mod_name(name: String, span: Option<SourceSpan>) -> Self {
        Self::InvalidModName { name, span }
    }

    pub fn invalid_version(version: String, span: Option<SourceSpan>) -> Self {
        Self::InvalidVersion { version, span }
    }

    pub fn config_save_failed(path: String, source: std::io::Error) -> Self {
        Self::ConfigSaveFailed { path, source }
    }
}

impl From<timm_overlay::Error> for CliError {
    fn from(error: timm_overlay::Error) -> Self {
        use timm_overlay::Error;

        match error {
            Error::SourceNotFound(id) => Self::ModNotFound { id },
            Error::SourceMounted(id) => Self::ModMounted { id },
            Error::InvalidSourceId(name) => Self::invalid_mod_name(name, None),
            Error::SourceUnavailable { id, root } => Self::SourceUnavailable { id, root },
            Error::CorruptManifest { path, reason } => Self::CorruptManifest { path, reason },
            Error::WriteFailure { path, source } => Self::ManifestWriteFailed { path, source },
            Error::Locked(lock_path) => Self::Locked { lock_path },
            Error::Cancelled { applied, total } => Self::Cancelled { applied, total },
            Error::Incomplete {
                operation,
                failures,
            } => Self::Incomplete {
                operation: operation.to_string(),
                count: failures.len(),
                details: failures
                    .iter()
                    .map(|failure| format!("  {}: {}", failure.path, failure.error))
                    .collect::<Vec<_>>()
                    .join("\n"),
            },
            other => Self::Engine { source: other },
        }
    }
}
