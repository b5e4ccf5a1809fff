mod main_runtime;

use clap::Parser;
use opsdeck::cli::{self, Cli, Commands, Console, OutputMode};
use opsdeck::config::AppConfig;

use crate::main_runtime::{init_logging, init_logging_simple};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_file(path)?,
        None => AppConfig::load()?,
    };
    if let Some(base_url) = &cli.base_url {
        config.backend.base_url = Some(base_url.clone());
    }

    let _log_guard = match &cli.command {
        Commands::Watch { .. } => init_logging(&config.logging),
        _ => {
            init_logging_simple();
            None
        }
    };

    let console = Console::new(config, OutputMode::from_json_flag(cli.json))?;

    match &cli.command {
        Commands::Status { mode } => cli::show_status(&console, *mode).await?,
        Commands::Watch { mode } => cli::watch(&console, *mode).await?,
        Commands::Alert { message, yes } => cli::send_alert(&console, message, *yes).await?,
        Commands::Report(cmd) => cli::run_report_command(&console, cmd).await?,
    }

    Ok(())
}
