use anyhow::Result;
use clap::Parser;
use vitalink::config::{Cli, Commands, Config};
use vitalink::monitor::Monitor;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load_with_cli(cli.clone())?;

    config.init_logging()?;

    tracing::info!("Vitalink starting");

    if let Some(command) = cli.command {
        handle_command(command, &config).await?;
        return Ok(());
    }

    let monitor = Monitor::new(config).await?;

    tracing::info!("Vitalink ready");

    monitor.run().await?;

    Ok(())
}

async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Run => {
            let monitor = Monitor::new(config.clone()).await?;
            monitor.run().await?;
        }
        Commands::ResetConfig => {
            let rendered = Config::generate_default_config()?;
            if let Some(config_path) = Config::get_user_config_path() {
                if let Some(parent) = config_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&config_path, rendered)?;
                println!("default configuration written to {}", config_path.display());
            } else {
                println!("could not determine the user configuration path");
            }
        }
    }

    Ok(())
}
