//! Wire records exchanged between the coordinator and its peers
//!
//! Every record is a compact JSON object on a single line. Post-handshake
//! records carry a `type` discriminator; the payload beyond it is opaque to
//! the coordinator except for the flight id (logging) and the active-flight
//! hint (telemetry). Records the coordinator forwards keep any top-level
//! fields it does not model in `extra`, so they reach the destination intact.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level fields of a forwarded record that have no typed slot
pub type Extra = serde_json::Map<String, Value>;

/// Declared function of a connected process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[serde(alias = "simulador")]
    Simulator,
    #[serde(alias = "base_datos")]
    Persistence,
    #[serde(alias = "visualizador")]
    Visualizer,
    #[serde(alias = "panel_control")]
    Control,
    #[default]
    #[serde(other)]
    Unknown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Simulator => "simulator",
            Role::Persistence => "persistence",
            Role::Visualizer => "visualizer",
            Role::Control => "control",
            Role::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simulator" | "simulador" => Ok(Role::Simulator),
            "persistence" | "base_datos" => Ok(Role::Persistence),
            "visualizer" | "visualizador" => Ok(Role::Visualizer),
            "control" | "panel_control" => Ok(Role::Control),
            "unknown" => Ok(Role::Unknown),
            other => Err(format!(
                "Unknown role '{}'. Expected simulator, persistence, visualizer or control",
                other
            )),
        }
    }
}

/// First record a client sends on a new connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(rename = "type", default)]
    pub role: Role,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Handshake {
    pub fn new(name: impl Into<String>, role: Role, version: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            role,
            version: Some(version.into()),
        }
    }
}

/// Coordinator reply to a successful handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub status: String,
    pub message: String,
    pub timestamp: f64,
}

impl HandshakeAck {
    pub const OK: &'static str = "OK";

    pub fn ok(name: &str) -> Self {
        Self {
            status: Self::OK.to_string(),
            message: format!("Welcome {}", name),
            timestamp: unix_timestamp(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Self::OK
    }
}

/// Air-traffic-control action applied to a single flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtcAction {
    ChangeAltitude,
    ChangeSpeed,
    Emergency,
}

/// Operator command issued from the control panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorAction {
    Pause,
    Resume,
    SetFlightLimit,
}

/// Directive the coordinator sends to the simulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveAction {
    Pause,
    Resume,
    Resync,
}

/// A post-handshake record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    FlightUpdate {
        flight: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        active_flights: Option<u64>,
        #[serde(flatten)]
        extra: Extra,
    },

    FlightCreated {
        flight: Value,
        #[serde(flatten)]
        extra: Extra,
    },

    FlightCompleted {
        flight: Value,
        #[serde(flatten)]
        extra: Extra,
    },

    /// Durability copy addressed to the persistence endpoint
    SaveFlight {
        flight: Value,
    },

    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<f64>,
    },

    Pong {
        timestamp: f64,
    },

    ManualFlightRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        origin: String,
        destination: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<u32>,
        #[serde(flatten)]
        extra: Extra,
    },

    AtcDirective {
        flight_id: String,
        action: AtcAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<i64>,
        #[serde(flatten)]
        extra: Extra,
    },

    OperatorCommand {
        command: OperatorAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<u32>,
    },

    Directive {
        action: DirectiveAction,
    },

    Configuration {
        max_flights: u32,
    },

    StatisticsRequest {},

    FetchStatistics {
        requester: String,
    },

    StatisticsReply {
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requester: Option<String>,
        #[serde(flatten)]
        extra: Extra,
    },

    ResetState {},

    BackupNotice {
        payload: Box<Message>,
    },

    SimulatorOnline {},

    SimulatorOffline {},

    /// Any kind this build does not know; routed nowhere
    #[serde(other)]
    Unknown,
}

impl Message {
    /// Wire name of this record's kind
    pub fn kind(&self) -> &'static str {
        match self {
            Message::FlightUpdate { .. } => "flight_update",
            Message::FlightCreated { .. } => "flight_created",
            Message::FlightCompleted { .. } => "flight_completed",
            Message::SaveFlight { .. } => "save_flight",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::ManualFlightRequest { .. } => "manual_flight_request",
            Message::AtcDirective { .. } => "atc_directive",
            Message::OperatorCommand { .. } => "operator_command",
            Message::Directive { .. } => "directive",
            Message::Configuration { .. } => "configuration",
            Message::StatisticsRequest {} => "statistics_request",
            Message::FetchStatistics { .. } => "fetch_statistics",
            Message::StatisticsReply { .. } => "statistics_reply",
            Message::ResetState {} => "reset_state",
            Message::BackupNotice { .. } => "backup_notice",
            Message::SimulatorOnline {} => "simulator_online",
            Message::SimulatorOffline {} => "simulator_offline",
            Message::Unknown => "unknown",
        }
    }

    /// Flight identifier carried by flight records, used only for logging
    pub fn flight_id(&self) -> Option<&str> {
        match self {
            Message::FlightUpdate { flight, .. }
            | Message::FlightCreated { flight, .. }
            | Message::FlightCompleted { flight, .. }
            | Message::SaveFlight { flight } => flight.get("id").and_then(Value::as_str),
            Message::AtcDirective { flight_id, .. } => Some(flight_id),
            Message::BackupNotice { payload } => payload.flight_id(),
            _ => None,
        }
    }
}

/// Seconds since the Unix epoch with sub-second precision
pub fn unix_timestamp() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}
