use crate::errors::CliError;
use crate::utils::config::{self, AppConfig};
use camino::Utf8PathBuf;
use colored::Colorize;
use miette::Result;
use timm_core::GameLayout;

fn config_path_display() -> String {
    config::default_config_path()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

fn save(cfg: &AppConfig) -> Result<()> {
    config::save_config(cfg)
        .map_err(|e| CliError::config_save_failed(config_path_display(), e).into())
}

fn update_game_dir_in_config(path: Utf8PathBuf) -> Result<()> {
    let mut cfg = config::load_config();
    cfg.game_dir = Some(path);
    save(&cfg)
}

/// Print a config path entry with status indicator
fn print_path_config(
    name: &str,
    path: Option<&Utf8PathBuf>,
    validator: impl Fn(&Utf8PathBuf) -> bool,
) {
    match path {
        Some(p) => {
            let status = if validator(p) {
                "✓".bright_green()
            } else {
                "✗".bright_red()
            };
            println!("  {} {} {}", format!("{}:", name).bright_white(), p, status);
        }
        None => {
            println!(
                "  {} {}",
                format!("{}:", name).bright_white(),
                "(not set)".bright_yellow()
            );
        }
    }
}

pub fn show_config() -> Result<()> {
    let cfg = config::load_config();

    println!();
    println!("  {} {}", "config_file:".bright_white(), config_path_display());

    print_path_config("game_dir", cfg.game_dir.as_ref(), |p| {
        timm_core::is_valid_game_dir(p)
    });

    let base_dir = cfg.base_content_dir.as_ref().map(|base| match &cfg.game_dir {
        Some(game) => GameLayout::new(game.clone())
            .with_base_content_dir(base)
            .base_content_dir()
            .to_path_buf(),
        None => base.clone(),
    });
    print_path_config("base_content_dir", base_dir.as_ref(), |p| p.is_dir());

    match cfg.workers {
        Some(workers) => println!("  {} {}", "workers:".bright_white(), workers),
        None => println!(
            "  {} {}",
            "workers:".bright_white(),
            "(all cores)".bright_yellow()
        ),
    }

    println!();
    Ok(())
}

pub fn set_game_dir(path: Utf8PathBuf) -> Result<()> {
    if let Err(e) = GameLayout::new(path.clone()).validate() {
        eprintln!(
            "  {}",
            "The path must point to the 'Tactical Intervention' folder.".bright_yellow()
        );
        eprintln!(
            "  {}",
            "Example: C:\\Program Files (x86)\\Steam\\steamapps\\common\\Tactical Intervention"
                .bright_yellow()
        );
        eprintln!();

        return Err(CliError::invalid_game_dir(path, e).into());
    }

    update_game_dir_in_config(path.clone())?;

    println!("{}", "✓ Game folder set successfully!".bright_green().bold());
    println!();
    println!(
        "  {} {}",
        "Path:".bright_white().bold(),
        path.as_str().bright_green()
    );

    Ok(())
}

pub fn auto_detect_game_dir() -> Result<()> {
    println!(
        "{}",
        "Searching Steam libraries for Tactical Intervention...".bright_cyan()
    );
    println!();

    match timm_core::auto_detect_game_dir() {
        Some(detected_path) => {
            println!("{}", "✓ Found Tactical Intervention!".bright_green().bold());
            println!();
            println!(
                "  {} {}",
                "Path:".bright_white().bold(),
                detected_path.as_str().bright_green()
            );
            println!();

            update_game_dir_in_config(detected_path)?;

            println!(
                "{}",
                "✓ Configuration updated successfully!"
                    .bright_green()
                    .bold()
            );
        }
        None => {
            println!(
                "{}",
                "✗ Could not automatically detect the Tactical Intervention folder"
                    .bright_red()
                    .bold()
            );
            println!();
            println!(
                "  {}",
                "The game may not be installed, or it's in a non-standard Steam library."
                    .bright_yellow()
            );
            println!();
            println!(
                "  {} Use 'timm config set-game-dir <path>' to set the folder manually",
                "•".bright_cyan()
            );
            println!(
                "  {} Or run timm from inside the 'Tactical Intervention' folder",
                "•".bright_cyan()
            );
        }
    }

    Ok(())
}

pub fn reset_config() -> Result<()> {
    save(&AppConfig::default())?;

    println!(
        "{}",
        "✓ Configuration reset to defaults".bright_green().bold()
    );
    println!();
    println!(
        "  {} {}",
        "Config file:".bright_white().bold(),
        config_path_display()
    );
    println!();
    println!(
        "  {}",
        "Run 'timm config auto-detect' to find your game folder".bright_cyan()
    );

    Ok(())
}
