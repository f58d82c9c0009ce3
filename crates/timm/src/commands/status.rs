use crate::errors::CliError;
use crate::println_pad;
use crate::utils::game::open_engine;
use camino::Utf8PathBuf;
use colored::Colorize;
use miette::Result;
use timm_overlay::{Drift, BASE_CONTENT_ID};

pub fn show_status(game_dir: Option<Utf8PathBuf>) -> Result<()> {
    let (layout, engine) = open_engine(game_dir)?;
    let game_patched = engine.refresh_game_patched().map_err(CliError::from)?;
    let status = engine.status().map_err(CliError::from)?;

    println!();
    println_pad!("{} {}", "Game:".bright_white().bold(), layout.root());
    println_pad!(
        "{} {}",
        "Patched:".bright_white().bold(),
        if game_patched {
            "yes".bright_green()
        } else {
            "no".bright_yellow()
        }
    );
    println_pad!(
        "{} {}",
        "Mounted files:".bright_white().bold(),
        status.mounted_paths
    );
    println!();

    if status.sources.is_empty() {
        println_pad!("{}", "No mods registered".bright_yellow());
        println_pad!(
            "{}",
            "Run 'timm register <name>' after extracting a mod into mods/<name>/".dimmed()
        );
        return Ok(());
    }

    for source in &status.sources {
        let state = if source.mounted {
            "mounted".bright_green()
        } else {
            "unmounted".dimmed()
        };
        let name = if source.id == BASE_CONTENT_ID {
            "base content".bright_magenta().bold()
        } else {
            source.id.bright_cyan().bold()
        };

        println_pad!(
            "{} {} {} {} {}",
            "•".bright_cyan(),
            name,
            format!("v{}", source.version).dimmed(),
            format!("(priority {})", source.priority).dimmed(),
            state
        );
        if source.claimed_paths > 0 {
            println_pad!("    {} files", source.claimed_paths);
        }
    }
    println!();
    Ok(())
}

pub fn reconcile_mounts(game_dir: Option<Utf8PathBuf>) -> Result<()> {
    let (_layout, engine) = open_engine(game_dir)?;
    let report = engine.reconcile().map_err(CliError::from)?;

    if report.is_clean() {
        println!(
            "{} {}",
            "✓ Mount directory matches timm.json".bright_green().bold(),
            format!("({} files checked)", report.checked).dimmed()
        );
        return Ok(());
    }

    for drift in &report.drift {
        let marker = match drift {
            Drift::MissingLink { .. } | Drift::NotALink { .. } => "✗".bright_red(),
            Drift::WrongTarget { .. } | Drift::UnknownOwner { .. } => "!".bright_yellow(),
            Drift::UntrackedLink { .. } => "?".bright_blue(),
        };
        println_pad!("{} {}", marker, drift);
    }
    println!();

    Err(CliError::DriftDetected {
        count: report.drift.len(),
    }
    .into())
}
