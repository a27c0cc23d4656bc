mod cli;
mod commands;
mod observability;
mod output;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands, ConfigCommands};
use expa_analytics::config::loader::load_config;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        output::print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Missing .env is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(api_url) = &cli.api_url {
        config.api_url = Some(api_url.clone());
    }
    if let Some(anonymous_id) = &cli.anonymous_id {
        config.anonymous_id = Some(anonymous_id.clone());
    }

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    observability::init_tracing_with_level(level);

    match &cli.command {
        Commands::Config(args) => match args.command {
            ConfigCommands::Show => commands::config::show(&config),
        },
        command => commands::record::run(&cli, command, &config).await,
    }
}
