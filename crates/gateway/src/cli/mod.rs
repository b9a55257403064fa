//! CLI definition and config loading.

pub mod chat;
pub mod config_cmd;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use agently_domain::config::Config;
use agently_domain::error::Result;

#[derive(Debug, Parser)]
#[command(name = "agently", about = "Conversational agent runtime", version)]
pub struct Cli {
    /// Path to the config file (defaults to ./agently.toml when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP gateway (default).
    Serve,
    /// Interactive chat REPL against a local runtime.
    Chat {
        /// Existing conversation id to continue.
        #[arg(long)]
        conversation: Option<uuid::Uuid>,
        /// Workspace agent to chat with.
        #[arg(long)]
        agent: Option<String>,
        /// Model spec override.
        #[arg(long)]
        model: Option<String>,
    },
    /// Scheduler operations.
    #[command(subcommand)]
    Schedules(SchedulesCommand),
    /// Configuration operations.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum SchedulesCommand {
    /// Run due schedules: one batch with --once, else loop forever.
    Run {
        #[arg(long)]
        once: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Validate the configuration and exit non-zero on errors.
    Validate,
    /// Print the resolved configuration.
    Show,
}

/// Load configuration: explicit path, `./agently.toml` when present, or
/// built-in defaults rooted at the current directory.
pub fn load_config(explicit: Option<&PathBuf>) -> Result<Arc<Config>> {
    if let Some(path) = explicit {
        return Ok(Arc::new(Config::load(path)?));
    }
    let default_path = PathBuf::from("agently.toml");
    if default_path.exists() {
        return Ok(Arc::new(Config::load(&default_path)?));
    }
    let mut config = Config::default();
    config.workspace_root = Some(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    config.apply_env_overrides();
    Ok(Arc::new(config))
}
