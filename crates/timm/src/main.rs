use camino::Utf8PathBuf;
use clap::builder::{styling::AnsiColor, Styles};
use clap::ColorChoice;
use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};
use commands::{
    auto_detect_game_dir, forget_mod, mount_base_content, mount_mod, reconcile_mounts,
    register_mod, reset_config, set_game_dir, show_config, show_status, unmount_mod,
    RegisterModArgs,
};
use miette::Result;

mod commands;
mod errors;
mod utils;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The Tactical Intervention folder (defaults to the configured or detected one)
    #[arg(short, long, global = true)]
    game_dir: Option<Utf8PathBuf>,

    /// Log every linked and unlinked path
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register a mod whose files are in mods/<name>/, or update its version and priority
    Register {
        /// The mod name (letters, digits, '-' and '_')
        name: String,

        /// The mod version
        #[arg(long = "mod-version")]
        version: Option<String>,

        /// Higher priority mods win conflicting files
        #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,
    },
    /// Link a registered mod's files into the mount directory
    Mount {
        /// The mod id
        id: String,
    },
    /// Remove a mod's links, handing its files to the next best provider
    Unmount {
        /// The mod id
        id: String,
    },
    /// Fill every unoccupied path with the original game content
    MountBase,
    /// Show registered mods and what they have mounted
    Status,
    /// Compare the manifest with the mount directory and report differences
    Reconcile,
    /// Remove an unmounted mod from the manifest
    Forget {
        /// The mod id
        id: String,
    },
    /// Manage the timm configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show the current configuration
    Show,
    /// Set the Tactical Intervention folder
    SetGameDir {
        /// Path to the 'Tactical Intervention' folder
        path: Utf8PathBuf,
    },
    /// Search Steam libraries for the game
    AutoDetect,
    /// Reset the configuration to defaults
    Reset,
}

fn parse_args() -> Result<Args> {
    // Configure colored/styled help output
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default().bold())
        .usage(AnsiColor::Green.on_default().bold())
        .literal(AnsiColor::Cyan.on_default())
        .placeholder(AnsiColor::Blue.on_default());

    let matches = Args::command()
        .styles(styles)
        .color(ColorChoice::Auto)
        .get_matches();

    Args::from_arg_matches(&matches).map_err(|e| miette::miette!("{}", e))
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "timm=debug,timm_overlay=debug,timm_core=debug"
    } else {
        "timm=info,timm_overlay=info"
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let args = parse_args()?;
    init_tracing(args.verbose);

    let game_dir = args.game_dir;
    match args.command {
        Commands::Register {
            name,
            version,
            priority,
        } => register_mod(
            game_dir,
            RegisterModArgs {
                name,
                version,
                priority,
            },
        ),
        Commands::Mount { id } => mount_mod(game_dir, &id),
        Commands::Unmount { id } => unmount_mod(game_dir, &id),
        Commands::MountBase => mount_base_content(game_dir),
        Commands::Status => show_status(game_dir),
        Commands::Reconcile => reconcile_mounts(game_dir),
        Commands::Forget { id } => forget_mod(game_dir, &id),
        Commands::Config { command } => match command {
            ConfigCommands::Show => show_config(),
            ConfigCommands::SetGameDir { path } => set_game_dir(path),
            ConfigCommands::AutoDetect => auto_detect_game_dir(),
            ConfigCommands::Reset => reset_config(),
        },
    }
}
