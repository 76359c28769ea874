//! Command-line interface for the `qrelay` binary.
//!
//! Invoked with no subcommand, `qrelay` runs the relay server. `status`
//! asks a running instance for its health summary over HTTP, and
//! `version` reports the build metadata baked in at compile time.

use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::config::DEFAULT_PORT;

/// Relay between document uploads and an asynchronous analysis workflow.
#[derive(Parser, Debug)]
#[command(
    name = "qrelay",
    version = env!("CARGO_PKG_VERSION"),
    about = "Forwards document batches to an analysis workflow and serves the results"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server in the foreground (the default action).
    Start,

    /// Show the health summary of a running relay.
    Status {
        /// Port the relay listens on (falls back to PORT, then 3001).
        #[arg(short, long)]
        port: Option<u16>,

        /// Address where the relay is reachable.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Show version and build metadata.
    Version,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Probe a running relay's `/health` endpoint and print what it reports.
pub async fn handle_status(
    host: &str,
    port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let port = status_port(port);
    let url = format!("http://{}:{}/health", host, port);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?;

    let response = match client.get(&url).send().await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Could not connect to qrelay at {}:{}", host, port);
            eprintln!("  cause: {}", e);
            eprintln!();
            eprintln!("Is the server running? Start it with: qrelay start");
            std::process::exit(1);
        }
    };

    if !response.status().is_success() {
        eprintln!(
            "Health check failed with HTTP {}: {}",
            response.status(),
            response.text().await.unwrap_or_default()
        );
        std::process::exit(1);
    }

    let body: Value = response.json().await?;

    println!("qrelay at {}:{}", host, port);
    if let Some(status) = body.get("status").and_then(|v| v.as_str()) {
        println!("  health:         {}", status);
    }
    if let Some(stored) = body.get("stored_results").and_then(|v| v.as_u64()) {
        println!("  stored results: {}", stored);
    }
    if let Some(timestamp) = body.get("timestamp").and_then(|v| v.as_str()) {
        println!("  reported at:    {}", timestamp);
    }

    Ok(())
}

/// Print the version line plus the metadata captured by the build script.
pub fn handle_version() {
    println!("qrelay {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  built:  {} ({})",
        env!("QRELAY_BUILD_DATE"),
        env!("QRELAY_GIT_HASH")
    );
    println!(
        "  target: {}-{}",
        std::env::consts::ARCH,
        std::env::consts::OS
    );
}

// ---------------------------------------------------------------------------
// Port selection
// ---------------------------------------------------------------------------

/// Port to probe: the explicit flag wins, then a usable PORT variable,
/// then the built-in default.
fn status_port(explicit: Option<u16>) -> u16 {
    status_port_with(explicit, |name| std::env::var(name).ok())
}

fn status_port_with<F>(explicit: Option<u16>, lookup: F) -> u16
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = explicit {
        return port;
    }
    lookup("PORT")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_parse_no_subcommand() {
        let cli = Cli::try_parse_from(["qrelay"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_parse_start() {
        let cli = Cli::try_parse_from(["qrelay", "start"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Start)));
    }

    #[test]
    fn test_parse_version() {
        let cli = Cli::try_parse_from(["qrelay", "version"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Version)));
    }

    #[test]
    fn test_parse_status_flag_defaults() {
        let cli = Cli::try_parse_from(["qrelay", "status"]).unwrap();
        match cli.command {
            Some(Command::Status { port, ref host }) => {
                assert_eq!(port, None);
                assert_eq!(host, "127.0.0.1");
            }
            other => panic!("expected Status, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_status_long_port_flag() {
        let cli = Cli::try_parse_from(["qrelay", "status", "--port", "9000"]).unwrap();
        match cli.command {
            Some(Command::Status { port, .. }) => assert_eq!(port, Some(9000)),
            other => panic!("expected Status, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_status_short_port_flag() {
        let cli = Cli::try_parse_from(["qrelay", "status", "-p", "4500"]).unwrap();
        match cli.command {
            Some(Command::Status { port, .. }) => assert_eq!(port, Some(4500)),
            other => panic!("expected Status, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_status_host_flag() {
        let cli = Cli::try_parse_from(["qrelay", "status", "--host", "10.0.0.5"]).unwrap();
        match cli.command {
            Some(Command::Status { ref host, .. }) => assert_eq!(host, "10.0.0.5"),
            other => panic!("expected Status, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_subcommand() {
        assert!(Cli::try_parse_from(["qrelay", "upload"]).is_err());
    }

    #[test]
    fn test_status_port_explicit_flag_wins() {
        let port = status_port_with(Some(9000), |_| Some("4444".to_string()));
        assert_eq!(port, 9000);
    }

    #[test]
    fn test_status_port_reads_environment() {
        let port = status_port_with(None, |name| (name == "PORT").then(|| "4444".to_string()));
        assert_eq!(port, 4444);
    }

    #[test]
    fn test_status_port_ignores_blank_value() {
        let port = status_port_with(None, |_| Some("  ".to_string()));
        assert_eq!(port, DEFAULT_PORT);
    }

    #[test]
    fn test_status_port_ignores_unparsable_value() {
        let port = status_port_with(None, |_| Some("not-a-port".to_string()));
        assert_eq!(port, DEFAULT_PORT);
    }

    #[test]
    fn test_status_port_falls_back_to_default() {
        let port = status_port_with(None, |_| None);
        assert_eq!(port, DEFAULT_PORT);
    }
}
