//! modelshare CLI - inspect cache configuration and simulate shared workloads

mod backend;
mod cli;
mod commands;
mod output;

use clap::Parser;
use cli::{Cli, Commands, ConfigCommands};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_command_async(cli))
}

async fn run_command_async(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Config { action } => match action {
            ConfigCommands::Show => commands::config::run_show(config_path, cli.output)?,
        },

        Commands::Simulate(args) => {
            commands::simulate::run(config_path, &args, cli.output).await?;
        }
    }

    Ok(())
}
