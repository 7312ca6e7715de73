//! SkyRelay - air-traffic simulation coordinator
//!
//! CLI entry point for running the relay and talking to it.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use eyre::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use skyrelay::cli::{Cli, Command, SendCommand};
use skyrelay::client::{
    ClientConfig, ClientHandle, ClientRuntime, FallbackLog, MessageHandler, WatchHandler, follow_fallback,
};
use skyrelay::config::Config;
use skyrelay::coordinator::RelayServer;
use skyrelay::protocol::{Message, Role, unix_timestamp};

fn log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("skyrelay")
        .join("logs")
}

fn parse_level(level: Option<&str>) -> tracing::Level {
    match level.map(|s| s.to_uppercase()) {
        None => tracing::Level::INFO,
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
    }
}

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>, to_stderr: bool) -> Result<()> {
    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = parse_level(cli_log_level.or(config_log_level));
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    if to_stderr {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    } else {
        let log_dir = log_dir();
        fs::create_dir_all(&log_dir).context("Failed to create log directory")?;
        let log_file = fs::File::create(log_dir.join("sr.log")).context("Failed to create log file")?;

        tracing_subscriber::fmt()
            .with_writer(log_file)
            .with_ansi(false)
            .with_env_filter(filter)
            .init();
    }

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());

    // Setup logging with priority: CLI > config > INFO default
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref(), cli.log_stderr)
        .context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Serve { port } => cmd_serve(config, port).await,
        Command::Send { name, timeout, command } => {
            cmd_send(config, name, Duration::from_secs(timeout), command).await
        }
        Command::Watch {
            role,
            name,
            fallback_log,
        } => cmd_watch(config, role, name, fallback_log).await,
        Command::Config => cmd_config(&config),
    }
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_signal() -> Result<()> {
    debug!("wait_for_signal: setting up signal handlers");
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => warn!("SIGINT received"),
            _ = sigterm.recv() => warn!("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        warn!("Ctrl+C received");
    }
    Ok(())
}

async fn cmd_serve(config: Config, port: Option<u16>) -> Result<()> {
    let mut relay_config = config.relay;
    if let Some(port) = port {
        relay_config.port = port;
    }

    let server = RelayServer::bind(relay_config).await?;
    println!("Relay listening on {}", server.local_addr());
    info!("Relay running. Press Ctrl+C to stop.");

    wait_for_signal().await?;
    server.shutdown().await?;
    println!("Relay stopped");
    Ok(())
}

/// Forwards pongs to whoever is waiting for one
struct PongWaiter {
    tx: mpsc::UnboundedSender<f64>,
}

#[async_trait]
impl MessageHandler for PongWaiter {
    async fn handle(&self, message: Message, _client: &ClientHandle) {
        if let Message::Pong { timestamp } = message {
            let _ = self.tx.send(timestamp);
        }
    }
}

fn client_config(config: &Config, name: String, role: Role) -> ClientConfig {
    ClientConfig {
        name,
        role,
        ..config.client.clone()
    }
    .with_env_overrides()
}

async fn cmd_send(config: Config, name: String, timeout: Duration, command: SendCommand) -> Result<()> {
    let client_config = client_config(&config, name, Role::Control);
    let targets = client_config.targets();
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel();
    let (client, task) = ClientRuntime::new(client_config, Arc::new(PongWaiter { tx: pong_tx })).spawn();

    let result = async {
        client
            .wait_connected(timeout)
            .await
            .with_context(|| format!("Coordinator not reachable at {:?}", targets))?;

        let message = command.to_message();
        let kind = message.kind();
        let sent_at = unix_timestamp();
        client.send(message).context("Failed to send record")?;

        if command.expects_pong() {
            match tokio::time::timeout(timeout, pong_rx.recv()).await {
                Ok(Some(_)) => println!("pong in {:.1}ms", (unix_timestamp() - sent_at) * 1000.0),
                _ => eyre::bail!("No pong within {:?}", timeout),
            }
        } else {
            println!("Sent {}", kind);
        }
        Ok::<(), eyre::Report>(())
    }
    .await;

    client.shutdown();
    if let Err(e) = task.await {
        warn!(error = %e, "Client task ended abnormally");
    }
    result
}

async fn cmd_watch(config: Config, role: Role, name: String, fallback_log: Option<PathBuf>) -> Result<()> {
    let fallback_log = match (role, fallback_log) {
        (Role::Visualizer, Some(path)) => Some(FallbackLog::new(path)),
        (Role::Visualizer, None) => Some(FallbackLog::new(
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("skyrelay")
                .join("fallback")
                .join(format!("{}.jsonl", name)),
        )),
        _ => None,
    };
    if let Some(log) = &fallback_log {
        println!("Fallback log: {}", log.path().display());
    }

    let handler = Arc::new(WatchHandler::new(role, fallback_log));
    if role == Role::Visualizer {
        follow_fallback(handler.subscribe_fallback(), |active| {
            if active {
                println!("Local fallback: active (no simulator feed)");
            } else {
                println!("Local fallback: off (simulator feed live)");
            }
        });
    }
    let client_config = client_config(&config, name, role);
    println!("Watching {:?} as {} ({})", client_config.targets(), client_config.name, role);
    let (client, task) = ClientRuntime::new(client_config, handler).spawn();

    wait_for_signal().await?;
    client.shutdown();
    if let Err(e) = task.await {
        warn!(error = %e, "Client task ended abnormally");
    }
    Ok(())
}

fn cmd_config(config: &Config) -> Result<()> {
    print!("{}", config.to_yaml()?);
    Ok(())
}
