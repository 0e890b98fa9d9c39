//! rollcall - staff account activation
//!
//! Reads the roster mailbox, activates new staff on the portal and mails a
//! summary of the run.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod logging;

/// rollcall - staff account activation
#[derive(Parser, Debug)]
#[command(name = "rollcall")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "rollcall.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Process the newest roster email and send a summary
    Run,

    /// Activate one named user without reading the mailbox
    Activate(commands::activate::ActivateArgs),

    /// Parse a roster text file and print the records found
    Parse {
        /// Roster text file
        file: PathBuf,
    },

    /// Validate the configuration and its secrets
    CheckConfig,

    /// Inspect or edit the processed-message log
    #[command(subcommand)]
    Uids(UidsCommands),
}

#[derive(Subcommand, Debug)]
enum UidsCommands {
    /// List processed message UIDs
    List,

    /// Mark a message UID as processed
    Mark {
        /// Message UID
        uid: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => commands::run::run(&cli.config, &cli.log_level),
        Commands::Activate(args) => commands::activate::run(&cli.config, &cli.log_level, &args),
        Commands::Parse { file } => {
            logging::init_stdout(&cli.log_level);
            commands::parse::run(&file)
        },
        Commands::CheckConfig => {
            logging::init_stdout(&cli.log_level);
            commands::check_config::run(&cli.config)
        },
        Commands::Uids(uids_cmd) => {
            logging::init_stdout(&cli.log_level);
            match uids_cmd {
                UidsCommands::List => commands::uids::list(&cli.config),
                UidsCommands::Mark { uid } => commands::uids::mark(&cli.config, &uid),
            }
        },
    }
}
