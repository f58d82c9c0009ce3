use crate::errors::CliError;
use crate::println_pad;
use crate::utils::{game::open_engine, validate_mod_name, validate_version_format};
use camino::Utf8PathBuf;
use colored::Colorize;
use miette::Result;
use timm_overlay::MountReport;

pub struct RegisterModArgs {
    pub name: String,
    pub version: Option<String>,
    pub priority: i32,
}

pub fn register_mod(game_dir: Option<Utf8PathBuf>, args: RegisterModArgs) -> Result<()> {
    validate_mod_name(&args.name)?;
    if let Some(version) = &args.version {
        validate_version_format(version)?;
    }

    let (_layout, engine) = open_engine(game_dir)?;
    let record = engine
        .register_source(&args.name, args.version.as_deref(), args.priority)
        .map_err(CliError::from)?;

    let mod_root = engine.mod_root(&record.id);
    println!(
        "{} {}",
        "✓ Registered".bright_green().bold(),
        record.id.bright_cyan().bold()
    );
    println_pad!(
        "{} {}\n{} {}\n{} {}",
        "Version:".bright_white(),
        record.version,
        "Priority:".bright_white(),
        record.priority,
        "Files:".bright_white(),
        mod_root
    );
    if !mod_root.is_dir() {
        println_pad!(
            "{}",
            format!("Place the mod's files in {} before mounting it", mod_root).bright_yellow()
        );
    }

    Ok(())
}

fn print_mount_report(report: &MountReport) {
    println!(
        "{} {} {}",
        "✓ Mounted".bright_green().bold(),
        report.source.bright_cyan().bold(),
        format!("in {:.2?}", report.duration).dimmed()
    );
    println_pad!("{} {}", "Linked:".bright_white(), report.linked.len());

    if !report.skipped.is_empty() {
        println_pad!(
            "{} {}",
            "Already occupied:".bright_white(),
            report.skipped.len()
        );
    }
    if !report.released.is_empty() {
        println_pad!(
            "{} {}",
            "No longer provided:".bright_white(),
            report.released.len()
        );
    }
    if !report.denied.is_empty() {
        println_pad!(
            "{} {}",
            "Kept by other mods:".bright_yellow(),
            report.denied.len()
        );
        for denied in &report.denied {
            println_pad!(
                "  {} {} {}",
                "•".bright_yellow(),
                denied.path,
                format!("({}, priority {})", denied.owner, denied.owner_priority).dimmed()
            );
        }
    }
}

pub fn mount_mod(game_dir: Option<Utf8PathBuf>, id: &str) -> Result<()> {
    let (_layout, engine) = open_engine(game_dir)?;
    let report = engine.mount_source(id).map_err(CliError::from)?;
    print_mount_report(&report);
    Ok(())
}

pub fn mount_base_content(game_dir: Option<Utf8PathBuf>) -> Result<()> {
    let (layout, engine) = open_engine(game_dir)?;
    tracing::info!("Base content: {}", layout.base_content_dir());

    let report = engine.mount_base_content().map_err(CliError::from)?;
    print_mount_report(&report);
    Ok(())
}

pub fn unmount_mod(game_dir: Option<Utf8PathBuf>, id: &str) -> Result<()> {
    let (_layout, engine) = open_engine(game_dir)?;
    let report = engine.unmount_source(id).map_err(CliError::from)?;

    let handed_over = report
        .released
        .iter()
        .filter(|(_, owner)| owner.is_some())
        .count();

    println!(
        "{} {} {}",
        "✓ Unmounted".bright_green().bold(),
        report.source.bright_cyan().bold(),
        format!("in {:.2?}", report.duration).dimmed()
    );
    println_pad!(
        "{} {}\n{} {}\n{} {}",
        "Released:".bright_white(),
        report.released.len(),
        "Taken over by other content:".bright_white(),
        handed_over,
        "Empty folders removed:".bright_white(),
        report.pruned.len()
    );
    Ok(())
}

pub fn forget_mod(game_dir: Option<Utf8PathBuf>, id: &str) -> Result<()> {
    let (_layout, engine) = open_engine(game_dir)?;
    let record = engine.forget_source(id).map_err(CliError::from)?;

    println!(
        "{} {}",
        "✓ Removed".bright_green().bold(),
        record.id.bright_cyan().bold()
    );
    println_pad!(
        "{}",
        format!("Its files in {} were left in place", engine.mod_root(&record.id)).dimmed()
    );
    Ok(())
}
