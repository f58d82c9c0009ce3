//! Locating the game install and building a mount engine for it.

use crate::errors::CliError;
use crate::utils::config::{self, AppConfig};
use camino::Utf8PathBuf;
use colored::Colorize;
use miette::Result;
use std::io::Write;
use timm_core::GameLayout;
use timm_overlay::{EngineOptions, EnginePaths, MountEngine, MountProgress};

/// Pick the game folder: `--game-dir`, then config, then auto-detection, then
/// the current directory.
pub fn resolve_game_dir(cli_game_dir: Option<Utf8PathBuf>, cfg: &AppConfig) -> Result<Utf8PathBuf> {
    if let Some(dir) = cli_game_dir.or_else(|| cfg.game_dir.clone()) {
        return Ok(dir);
    }

    if let Some(detected) = timm_core::auto_detect_game_dir() {
        tracing::info!("Using detected game folder {}", detected);
        return Ok(detected);
    }

    std::env::current_dir()
        .ok()
        .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
        .ok_or_else(|| CliError::GameDirNotFound.into())
}

/// Resolve and validate the game layout, creating the directories timm manages.
pub fn open_layout(cli_game_dir: Option<Utf8PathBuf>, cfg: &AppConfig) -> Result<GameLayout> {
    let root = resolve_game_dir(cli_game_dir, cfg)?;

    let mut layout = GameLayout::new(root.clone());
    if let Some(base) = &cfg.base_content_dir {
        layout = layout.with_base_content_dir(base);
    }

    layout
        .validate()
        .map_err(|e| CliError::invalid_game_dir(root.clone(), e))?;
    layout
        .ensure_dirs()
        .map_err(|e| CliError::invalid_game_dir(root, e))?;

    Ok(layout)
}

/// Build the engine for a command, printing a progress counter while it runs.
pub fn open_engine(cli_game_dir: Option<Utf8PathBuf>) -> Result<(GameLayout, MountEngine)> {
    let cfg = config::load_config();
    let layout = open_layout(cli_game_dir, &cfg)?;

    let engine = MountEngine::new(EnginePaths {
        manifest: layout.manifest_path(),
        mount_root: layout.mount_dir(),
        mods_dir: layout.mods_dir(),
        base_content_dir: layout.base_content_dir().to_path_buf(),
    })
    .map_err(CliError::from)?
    .with_options(EngineOptions {
        workers: cfg.workers,
    })
    .map_err(CliError::from)?
    .with_progress(print_progress);

    Ok((layout, engine))
}

fn print_progress(progress: MountProgress) {
    let mut stderr = std::io::stderr().lock();
    let _ = write!(
        stderr,
        "\r  {} {}/{}",
        format!("{}:", progress.operation).bright_cyan(),
        progress.current,
        progress.total
    );
    if progress.current == progress.total {
        let _ = writeln!(stderr);
    }
    let _ = stderr.flush();
}
