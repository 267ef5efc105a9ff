//! # relay
//!
//! Standalone broadcast WebSocket server. Logs inbound messages, optionally
//! echoes them to every client, and broadcasts each stdin line as text.

#![deny(unsafe_code)]

mod host;

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use clap::Parser;
use relay_server::{HostCallbacks, RelayServer, ServerConfig, ServerController};
use relay_settings::RelaySettings;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::host::RelayHost;

/// Broadcast WebSocket relay.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Broadcast WebSocket relay", version)]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// WebSocket mount path (overrides settings).
    #[arg(long)]
    path: Option<String>,

    /// Maximum message size in bytes (overrides settings).
    #[arg(long)]
    max_message_size: Option<usize>,

    /// Rebroadcast every inbound message to all clients.
    #[arg(long)]
    echo: bool,

    /// Settings file (default `~/.relay/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Emit JSON-lines logs.
    #[arg(long)]
    json_logs: bool,

    /// Do not broadcast lines read from stdin.
    #[arg(long)]
    no_stdin: bool,
}

impl Cli {
    /// Layer CLI flags over loaded settings.
    fn apply(&self, settings: &mut RelaySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(path) = &self.path {
            settings.server.path.clone_from(path);
        }
        if let Some(size) = self.max_message_size {
            settings.server.max_message_size = size;
            if settings.server.transport_max_frame_size < size {
                settings.server.transport_max_frame_size = size;
            }
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(relay_settings::settings_path);
    let mut settings = relay_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    args.apply(&mut settings);

    let level = settings.logging.level.as_filter_str();
    if settings.logging.json {
        relay_logging::init_json_subscriber(level);
    } else {
        relay_logging::init_subscriber(level);
    }

    let controller: Arc<OnceLock<ServerController>> = Arc::new(OnceLock::new());
    let host = Arc::new(RelayHost::new(args.echo, Arc::clone(&controller)));

    let mut builder = RelayServer::builder(ServerConfig::from_settings(&settings.server))
        .callbacks(HostCallbacks::from_host(host));
    match relay_server::metrics::install_recorder() {
        Ok(handle) => builder = builder.metrics(handle),
        Err(e) => warn!(error = %e, "metrics recorder unavailable, /metrics disabled"),
    }
    let server = builder.start().await.context("Failed to start relay server")?;
    let _ = controller.set(server.controller().clone());

    info!(
        addr = %server.local_addr(),
        path = %server.mount_path(),
        echo = args.echo,
        "relay ready"
    );

    let stdin_task = if args.no_stdin {
        None
    } else {
        Some(tokio::spawn(broadcast_stdin(server.controller().clone())))
    };

    shutdown_signal().await;
    info!("shutdown signal received");
    if let Some(task) = stdin_task {
        task.abort();
    }
    let outcome = server.dispose().await;
    info!(?outcome, "relay stopped");
    Ok(())
}

/// Broadcast each stdin line as a text message until EOF.
async fn broadcast_stdin(controller: ServerController) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match controller.broadcast_text(&line) {
                Ok(report) if report.is_complete() => info!(
                    recipients = report.recipients,
                    delivered = report.delivered,
                    "broadcast stdin line"
                ),
                Ok(report) => {
                    let failed: Vec<String> =
                        report.failed_ids().map(ToString::to_string).collect();
                    warn!(
                        recipients = report.recipients,
                        delivered = report.delivered,
                        ?failed,
                        "stdin line missed some clients"
                    );
                }
                Err(e) => warn!(error = %e, "stdin line not broadcast"),
            },
            Ok(None) => {
                info!("stdin closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "failed to read stdin");
                break;
            }
        }
    }
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                let _ = signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::try_parse_from([
            "relay",
            "--port",
            "9000",
            "--path",
            "/john",
            "--max-message-size",
            "10",
            "--echo",
            "--json-logs",
        ])
        .unwrap();
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.path.as_deref(), Some("/john"));
        assert_eq!(cli.max_message_size, Some(10));
        assert!(cli.echo);
        assert!(cli.json_logs);
        assert!(!cli.no_stdin);
    }

    #[test]
    fn cli_overrides_settings() {
        let cli = Cli::try_parse_from(["relay", "--port", "0", "--host", "127.0.0.1"]).unwrap();
        let mut settings = RelaySettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, 0);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.path, "/");
        assert!(!settings.logging.json);
    }

    #[test]
    fn max_message_size_raises_transport_ceiling() {
        let cli = Cli::try_parse_from(["relay", "--max-message-size", "33554432"]).unwrap();
        let mut settings = RelaySettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.max_message_size, 33_554_432);
        assert_eq!(settings.server.transport_max_frame_size, 33_554_432);
    }

    #[test]
    fn settings_file_then_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": 7000, "path": "/from-file"}}"#).unwrap();
        let mut settings = relay_settings::load_settings_from_path(&path).unwrap();
        let cli = Cli::try_parse_from(["relay", "--path", "/from-cli"]).unwrap();
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, 7000);
        assert_eq!(settings.server.path, "/from-cli");
    }
}
