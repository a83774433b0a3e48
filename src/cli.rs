use anyhow::Result;

use crate::server::settings::Settings;

#[derive(Debug, Clone, clap::Subcommand)]
pub enum Commands {
    /// Start the HTTP build server
    Server,
    /// Check configuration for errors and unused options
    CheckConfig,
}

pub async fn handle_command(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Server => {
            let settings = Settings::new()?;
            crate::server::run_server(settings).await
        }
        Commands::CheckConfig => {
            println!("Checking configuration...");
            match Settings::new() {
                Ok(settings) => {
                    println!("✓ Configuration is valid");
                    println!("  registry:      {}", settings.registry.url);
                    println!("  container CLI: {}", settings.backend.container_cli);
                    println!("  temp dir:      {}", settings.pipeline.tmp_dir().display());
                    Ok(())
                }
                Err(e) => {
                    eprintln!("✗ Configuration error: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}
