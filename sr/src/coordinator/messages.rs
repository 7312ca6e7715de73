//! Requests to the relay task and the metrics it reports

use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::RelayError;
use crate::protocol::{Message, Role};

/// Internal requests to the relay task
#[derive(Debug)]
pub enum RelayRequest {
    /// A connection completed its handshake and was registered
    Connected { name: String, role: Role },

    /// A decoded record from a registered connection
    Inbound { origin: String, message: Message },

    /// A connection's read loop ended
    ///
    /// `deregistered` is false when a newer connection had already taken the name.
    Disconnected { name: String, deregistered: bool },

    /// An endpoint's writer stopped on a failed write or an eviction
    ///
    /// `undelivered` holds the records it never wrote, in queue order.
    WriterFailed {
        name: String,
        connection_id: Uuid,
        undelivered: Vec<Message>,
        error: RelayError,
    },

    /// Health monitor tick
    Tick,

    /// Get current metrics
    GetMetrics { reply_tx: oneshot::Sender<RelayMetrics> },

    /// Shutdown the relay
    Shutdown,
}

/// Simulation state set by operator commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SimulationControl {
    pub paused: bool,
    pub flight_limit: Option<u32>,
}

/// Relay metrics for observability
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayMetrics {
    pub registered_endpoints: usize,
    pub backlog_len: usize,
    /// Since the last health tick
    pub messages_sent: u64,
    /// Since the last health tick
    pub messages_received: u64,
    pub total_sent: u64,
    pub total_received: u64,
    /// Last active-flight hint seen on a flight update
    pub active_flights: u64,
    pub ticks: u64,
    pub control: SimulationControl,
}
