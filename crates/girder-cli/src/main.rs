//! Girder CLI entrypoint.

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;
mod loader;
mod simulate;

use commands::{Commands, ConfigCommands};
use config::CliConfig;

#[derive(Parser)]
#[command(name = "girder")]
#[command(
    author,
    version,
    about = "Girder build orchestration command-line interface",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = CliConfig::load().unwrap_or_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Validate { path } => handlers::validate(&path)?,
        Commands::Graph { path } => handlers::graph(&config, &path)?,
        Commands::Effective { build_type, path } => {
            handlers::effective(&config, &path, &build_type)?
        }
        Commands::Schema => handlers::schema()?,
        Commands::Simulate { script, path } => handlers::simulate(&config, &path, &script).await?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config)?,
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
        },
    }

    Ok(())
}
