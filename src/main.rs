use clap::Parser;

use quoterelay::cli::{self, Cli, Command};
use quoterelay::config::RelayConfig;
use quoterelay::logging;
use quoterelay::server;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Start) {
        Command::Start => {
            let config = match RelayConfig::from_env() {
                Ok(config) => config,
                Err(err) => {
                    eprintln!("Invalid configuration: {}", err);
                    std::process::exit(1);
                }
            };
            if let Err(err) = logging::init_logging(&config.logging()) {
                eprintln!("Failed to initialize logging: {}", err);
                std::process::exit(1);
            }
            if let Err(err) = server::serve(config).await {
                tracing::error!(error = %err, "server exited with error");
                std::process::exit(1);
            }
        }
        Command::Status { port, host } => {
            if let Err(err) = cli::handle_status(&host, port).await {
                eprintln!("Status check failed: {}", err);
                std::process::exit(1);
            }
        }
        Command::Version => cli::handle_version(),
    }
}
