use anyhow::Result;
use clap::Parser;

use scenepilot::cli::{self, Cli, Commands};
use scenepilot::config::Config;
use scenepilot::paths::Paths;

fn main() -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(Cli::parse()))
}

async fn async_main(cli: Cli) -> Result<()> {
    // Initialize logging. Logs go to stderr so streamed replies on stdout
    // stay clean.
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        configured_log_level()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Chat(args) => cli::chat::run(args).await,
        Commands::Ask(args) => cli::ask::run(args).await,
        Commands::History(args) => cli::history::run(args).await,
        Commands::Cache(args) => cli::cache::run(args).await,
        Commands::Config(args) => cli::config::run(args).await,
        Commands::Paths => cli::paths::run(),
    }
}

/// Logging level from the config file when one exists, without creating it.
fn configured_log_level() -> String {
    Paths::resolve()
        .ok()
        .map(|p| p.config_file())
        .filter(|p| p.exists())
        .and_then(|p| std::fs::read_to_string(p).ok())
        .and_then(|s| toml::from_str::<Config>(&s).ok())
        .map(|c| c.logging.level)
        .unwrap_or_else(|| "info".to_string())
}
