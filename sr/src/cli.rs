//! CLI command definitions and subcommands

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::debug;

use crate::protocol::{AtcAction, Message, OperatorAction, Role, unix_timestamp};

/// SkyRelay - air-traffic simulation coordinator
#[derive(Parser)]
#[command(
    name = "sr",
    about = "Coordinator relay for a distributed air-traffic simulation",
    version = env!("CARGO_PKG_VERSION"),
    after_help = "Logs are written to: ~/.local/share/skyrelay/logs/sr.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Log to stderr instead of the log file
    #[arg(long = "log-stderr", global = true)]
    pub log_stderr: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the coordinator relay in the foreground
    Serve {
        /// Override the listen port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send one operator record to the coordinator and exit
    Send {
        /// Name to register under
        #[arg(short, long, default_value = "control")]
        name: String,

        /// Seconds to wait for the coordinator
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,

        #[command(subcommand)]
        command: SendCommand,
    },

    /// Stay connected and log every record received
    Watch {
        /// Role to announce
        #[arg(short, long, default_value = "visualizer")]
        role: Role,

        /// Name to register under
        #[arg(short, long, default_value = "map")]
        name: String,

        /// Where a visualizer appends mirrored durability payloads
        #[arg(long = "fallback-log")]
        fallback_log: Option<PathBuf>,
    },

    /// Print the resolved configuration as YAML
    Config,
}

/// Records `sr send` can issue
#[derive(Debug, Clone, Subcommand)]
pub enum SendCommand {
    /// Pause flight generation
    Pause,

    /// Resume flight generation
    Resume,

    /// Set the simulator's concurrent flight limit
    Limit {
        /// Maximum active flights (defaults to 10 on the simulator)
        value: Option<u32>,
    },

    /// Issue an air-traffic directive for one flight
    Atc {
        flight_id: String,
        action: AtcArg,
        value: Option<i64>,
    },

    /// Liveness check; waits for the pong
    Ping,

    /// Ask persistence for statistics (the reply goes to the visualizer)
    Stats,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum AtcArg {
    ChangeAltitude,
    ChangeSpeed,
    Emergency,
}

impl From<AtcArg> for AtcAction {
    fn from(arg: AtcArg) -> Self {
        match arg {
            AtcArg::ChangeAltitude => AtcAction::ChangeAltitude,
            AtcArg::ChangeSpeed => AtcAction::ChangeSpeed,
            AtcArg::Emergency => AtcAction::Emergency,
        }
    }
}

impl SendCommand {
    /// The record this command puts on the wire
    pub fn to_message(&self) -> Message {
        debug!(command = ?self, "SendCommand::to_message: called");
        match self {
            SendCommand::Pause => Message::OperatorCommand {
                command: OperatorAction::Pause,
                value: None,
            },
            SendCommand::Resume => Message::OperatorCommand {
                command: OperatorAction::Resume,
                value: None,
            },
            SendCommand::Limit { value } => Message::OperatorCommand {
                command: OperatorAction::SetFlightLimit,
                value: *value,
            },
            SendCommand::Atc {
                flight_id,
                action,
                value,
            } => Message::AtcDirective {
                flight_id: flight_id.clone(),
                action: (*action).into(),
                value: *value,
                extra: Default::default(),
            },
            SendCommand::Ping => Message::Ping {
                timestamp: Some(unix_timestamp()),
            },
            SendCommand::Stats => Message::StatisticsRequest {},
        }
    }

    pub fn expects_pong(&self) -> bool {
        matches!(self, SendCommand::Ping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_watch_with_legacy_role() {
        let cli = Cli::parse_from(["sr", "watch", "--role", "visualizador", "--name", "mapa"]);
        match cli.command {
            Command::Watch { role, name, .. } => {
                assert_eq!(role, Role::Visualizer);
                assert_eq!(name, "mapa");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["sr", "serve", "-l", "debug", "--log-stderr", "--port", "7000"]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(cli.log_stderr);
        assert!(matches!(cli.command, Command::Serve { port: Some(7000) }));
    }

    #[test]
    fn test_send_limit_without_value() {
        let cli = Cli::parse_from(["sr", "send", "limit"]);
        let Command::Send { command, name, .. } = cli.command else {
            panic!("expected send");
        };
        assert_eq!(name, "control");
        assert_eq!(
            command.to_message(),
            Message::OperatorCommand {
                command: OperatorAction::SetFlightLimit,
                value: None
            }
        );
    }

    #[test]
    fn test_send_atc_directive() {
        let cli = Cli::parse_from(["sr", "send", "atc", "IB123", "change-altitude", "32000"]);
        let Command::Send { command, .. } = cli.command else {
            panic!("expected send");
        };
        assert_eq!(
            command.to_message(),
            Message::AtcDirective {
                flight_id: "IB123".to_string(),
                action: AtcAction::ChangeAltitude,
                value: Some(32000),
                extra: Default::default(),
            }
        );
        assert!(!command.expects_pong());
    }
}
