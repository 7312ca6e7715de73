//! ClientHandle - write path and state view of a running client

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::RelayError;
use crate::protocol::Message;

/// Where the client is in its connect cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Between sessions, or sleeping before the next pass over the host list
    Disconnected,

    /// Trying each host in order
    Connecting { cycle: u64 },

    /// Handshake acknowledged by `target` during connect cycle `cycle`
    Connected { target: String, cycle: u64 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}

/// A record queued for the session that was current when it was sent
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Outbound {
    pub cycle: u64,
    pub message: Message,
}

/// Process-local reaction to coordinator traffic
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Called for every decoded record, in arrival order
    async fn handle(&self, message: Message, client: &ClientHandle);

    async fn on_connected(&self, _client: &ClientHandle) {}

    /// Called once per lost session; not called for failed connect cycles
    async fn on_disconnected(&self, _client: &ClientHandle) {}
}

/// Cloneable handle to a client runtime
#[derive(Debug, Clone)]
pub struct ClientHandle {
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    cycles: Arc<AtomicU64>,
}

impl ClientHandle {
    pub(crate) fn new(
        outbound_tx: mpsc::UnboundedSender<Outbound>,
        state_rx: watch::Receiver<ConnectionState>,
        shutdown_tx: Arc<watch::Sender<bool>>,
        cycles: Arc<AtomicU64>,
    ) -> Self {
        Self {
            outbound_tx,
            state_rx,
            shutdown_tx,
            cycles,
        }
    }

    /// Queue a record for the coordinator
    ///
    /// Records are not kept across sessions: sending while disconnected
    /// fails with `NotConnected`, and a record that races a lost session is
    /// dropped rather than written to the next one.
    pub fn send(&self, message: Message) -> Result<(), RelayError> {
        let cycle = match &*self.state_rx.borrow() {
            ConnectionState::Connected { cycle, .. } => *cycle,
            _ => {
                debug!(kind = message.kind(), "ClientHandle::send: not connected, dropping");
                return Err(RelayError::NotConnected);
            }
        };
        self.enqueue(cycle, message)
    }

    pub(crate) fn enqueue(&self, cycle: u64, message: Message) -> Result<(), RelayError> {
        self.outbound_tx
            .send(Outbound { cycle, message })
            .map_err(|_| RelayError::ChannelClosed)
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state_rx.borrow().is_connected()
    }

    /// Connect cycles started so far, counting the first one
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until a session is established
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), RelayError> {
        let mut state_rx = self.state_rx.clone();
        match tokio::time::timeout(timeout, state_rx.wait_for(ConnectionState::is_connected)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(RelayError::ChannelClosed),
            Err(_) => Err(RelayError::NotConnected),
        }
    }

    /// Stop the runtime at its next loop boundary
    pub fn shutdown(&self) {
        debug!("ClientHandle::shutdown: called");
        let _ = self.shutdown_tx.send(true);
    }
}
