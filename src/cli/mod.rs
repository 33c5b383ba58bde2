//! CLI module — command parsing and dispatch
//!
//! All CLI logic lives here. `main.rs` calls `cli::run()`.

pub mod config;
pub mod recovery;
pub mod simulate;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};

use parley::config::Config;

#[derive(Parser)]
#[command(name = "parley")]
#[command(version)]
#[command(about = "Voice session orchestrator for realtime speech models", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.parley/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSONL script of realtime events through a live session
    Simulate {
        /// Script file, one realtime event object per line
        #[arg(long)]
        script: PathBuf,
        /// Session id to use (generated when omitted)
        #[arg(long)]
        session: Option<String>,
        /// Resume from the stored recovery record for --session
        #[arg(long, requires = "session")]
        resume: bool,
        /// Persist recovery records to disk instead of memory
        #[arg(long)]
        persist: bool,
        /// How long to keep listening after the last script line
        #[arg(long, default_value_t = 500)]
        settle_ms: u64,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Inspect stored recovery records
    Recovery {
        #[command(subcommand)]
        action: RecoveryAction,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration (file + environment overrides)
    Show,
    /// Validate the configuration file
    Check,
}

#[derive(Subcommand)]
pub enum RecoveryAction {
    /// List session ids with a stored record
    List,
    /// Print one stored record
    Show {
        /// Session id
        session_id: String,
    },
}

pub(crate) fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };
    config.context("Failed to load configuration")
}

/// Entry point for the CLI — called from main().
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Logging follows the config file; fall back to defaults if it is unreadable.
    let logging_cfg = load_config(cli.config.as_deref())
        .map(|c| c.logging)
        .unwrap_or_default();
    parley::utils::logging::init_logging(&logging_cfg)?;

    match cli.command {
        None => {
            let mut cmd = Cli::command();
            cmd.print_help()?;
            println!();
        }
        Some(Commands::Version) => {
            println!("parley {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Simulate {
            script,
            session,
            resume,
            persist,
            settle_ms,
        }) => {
            let config = load_config(cli.config.as_deref())?;
            let options = simulate::SimulateOptions {
                script,
                session,
                resume,
                persist,
                settle_ms,
            };
            simulate::cmd_simulate(config, options).await?;
        }
        Some(Commands::Config { action }) => {
            config::cmd_config(cli.config.as_deref(), action)?;
        }
        Some(Commands::Recovery { action }) => {
            let config = load_config(cli.config.as_deref())?;
            recovery::cmd_recovery(&config, action).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_simulate() {
        let cli = Cli::try_parse_from([
            "parley",
            "simulate",
            "--script",
            "demo.jsonl",
            "--session",
            "s1",
            "--resume",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Simulate {
                script,
                session,
                resume,
                settle_ms,
                ..
            }) => {
                assert_eq!(script, PathBuf::from("demo.jsonl"));
                assert_eq!(session.as_deref(), Some("s1"));
                assert!(resume);
                assert_eq!(settle_ms, 500);
            }
            _ => panic!("expected simulate"),
        }
    }

    #[test]
    fn test_resume_requires_session() {
        assert!(Cli::try_parse_from(["parley", "simulate", "--script", "x", "--resume"]).is_err());
    }

    #[test]
    fn test_global_config_flag() {
        let cli =
            Cli::try_parse_from(["parley", "recovery", "list", "--config", "/tmp/c.json"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.json")));
        assert!(matches!(
            cli.command,
            Some(Commands::Recovery {
                action: RecoveryAction::List
            })
        ));
    }
}
