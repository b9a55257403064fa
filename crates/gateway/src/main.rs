use clap::Parser;
use tracing_subscriber::EnvFilter;

use agently_domain::config::ConfigSeverity;
use agently_gateway::bootstrap;
use agently_gateway::cli::{self, Cli, Command, ConfigCommand, SchedulesCommand};
use agently_gateway::runtime::scheduler::Watchdog;
use agently_providers::ProviderRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing(true);
            let config = cli::load_config(cli.config.as_ref())?;
            validate_or_bail(&config)?;

            let state = bootstrap::build_app_state(config, ProviderRegistry::new())?;
            bootstrap::spawn_background_tasks(&state);
            bootstrap::serve(state).await?;
            Ok(())
        }
        Some(Command::Chat {
            conversation,
            agent,
            model,
        }) => {
            init_tracing(false);
            let config = cli::load_config(cli.config.as_ref())?;
            validate_or_bail(&config)?;
            cli::chat::chat(config, conversation, agent, model).await
        }
        Some(Command::Schedules(SchedulesCommand::Run { once })) => {
            init_tracing(false);
            let config = cli::load_config(cli.config.as_ref())?;
            validate_or_bail(&config)?;

            let interval = std::time::Duration::from_secs(config.scheduler.interval_sec);
            let state = bootstrap::build_app_state(config, ProviderRegistry::new())?;
            state.mcp.spawn_reaper();
            let watchdog = Watchdog::new(state);
            watchdog.run(once, interval).await?;
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = cli::load_config(cli.config.as_ref())?;
            if !cli::config_cmd::validate(&config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = cli::load_config(cli.config.as_ref())?;
            cli::config_cmd::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("agently {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// JSON logs for the server, compact logs for interactive commands.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,agently_gateway=debug"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    }
}

fn validate_or_bail(config: &agently_domain::config::Config) -> anyhow::Result<()> {
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    let errors = issues
        .iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .count();
    if errors > 0 {
        anyhow::bail!("config validation failed with {errors} error(s)");
    }
    Ok(())
}
