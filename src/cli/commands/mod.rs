mod subcommands;


use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "metaloop")]
#[command(about = "Conversational task loop with background memory and cognition analyses")]
#[command(version = crate::VERSION)]
pub struct Cli {
    /// Config file (defaults to $METALOOP_HOME/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task against a scripted model and print its events as JSON lines
    Run {
        /// JSON script of per-request model events
        #[arg(long, short = 's')]
        script: PathBuf,
        /// Initial user message (or a message added to a resumed task)
        #[arg(long, short = 'm')]
        message: Option<String>,
        /// Resume from a snapshot file instead of starting fresh
        #[arg(long)]
        resume: Option<PathBuf>,
        /// Where to persist the final snapshot (overrides storage.snapshotDir)
        #[arg(long)]
        save_dir: Option<PathBuf>,
        #[arg(long, default_value = "metaloop")]
        agent: String,
        #[arg(long, default_value = "scripted")]
        model: String,
        /// Alternative models the cognitive analyzer may switch to
        #[arg(long = "alt-model")]
        alt_models: Vec<String>,
    },
    /// Inspect saved task snapshots
    Snapshot {
        #[command(subcommand)]
        cmd: SnapshotCommands,
    },
    /// Show or validate configuration
    Config {
        #[command(subcommand)]
        cmd: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// Print a summary of a snapshot file
    Show {
        file: PathBuf,
        /// Print the full snapshot JSON
        #[arg(long)]
        json: bool,
    },
    /// List snapshots in the configured snapshot directory
    List {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as JSON
    Show,
    /// Validate the configuration and report the result
    Validate,
    /// Write the default configuration if none exists
    Init {
        #[arg(long)]
        force: bool,
    },
}

/// Options for `metaloop run`, separated from clap so tests can build them.
pub(crate) struct RunOptions {
    pub script: PathBuf,
    pub message: Option<String>,
    pub resume: Option<PathBuf>,
    pub save_dir: Option<PathBuf>,
    pub agent: String,
    pub model: String,
    pub alt_models: Vec<String>,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Run {
            script,
            message,
            resume,
            save_dir,
            agent,
            model,
            alt_models,
        } => {
            let config = crate::config::load_config(config_path)?;
            let opts = RunOptions {
                script,
                message,
                resume,
                save_dir,
                agent,
                model,
                alt_models,
            };
            let mut stdout = std::io::stdout();
            subcommands::run_task(&config, opts, &mut stdout).await?;
        }
        Commands::Snapshot { cmd } => match cmd {
            SnapshotCommands::Show { file, json } => {
                subcommands::snapshot_show(&file, json)?;
            }
            SnapshotCommands::List { dir } => {
                let config = crate::config::load_config(config_path)?;
                subcommands::snapshot_list(&config, dir).await?;
            }
        },
        Commands::Config { cmd } => match cmd {
            ConfigCommands::Show => subcommands::config_show(config_path)?,
            ConfigCommands::Validate => subcommands::config_validate(config_path)?,
            ConfigCommands::Init { force } => subcommands::config_init(config_path, force)?,
        },
    }

    Ok(())
}
