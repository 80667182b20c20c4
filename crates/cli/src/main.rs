mod cli;
mod commands;
mod handlers;

use anyhow::Result;
use clap::Parser;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    hearth_core::config::load_dotenv();
    let cli = Cli::parse();

    let config = cli.config();
    config.validate()?;
    config.log_summary();

    commands::dispatch(cli.command, &config).await
}
