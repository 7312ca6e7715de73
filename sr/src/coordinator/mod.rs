//! Coordinator relay
//!
//! The relay sits at the center of the star: every simulation process connects
//! here, names itself in a handshake, and exchanges records that the relay
//! forwards by logical name:
//! - **Broadcast:** flight traffic to every endpoint except its origin
//! - **Unicast:** commands to the simulator, durability writes to persistence
//! - **Backlog:** durability writes parked while persistence is away
//!
//! Each endpoint has its own bounded queue and writer task, so a peer that
//! stops reading is evicted instead of holding up the rest.

mod acceptor;
mod backlog;
mod config;
mod core;
mod dispatch;
mod handle;
mod messages;
mod monitor;
mod outbox;
mod registry;
mod router;
mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use eyre::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use acceptor::{ConnectionContext, Listener, placeholder_name};
pub use backlog::Backlog;
pub use config::{RelayConfig, WellKnownNames};
pub use self::core::Relay;
pub use dispatch::{Dispatcher, FlushOutcome};
pub use handle::RelayHandle;
pub use messages::{RelayMetrics, RelayRequest, SimulationControl};
pub use monitor::{HealthReport, spawn_health_monitor};
pub use outbox::{EnqueueError, Inbox, Outbox, Writer};
pub use registry::{Endpoint, EndpointInfo, Registry};
pub use router::{Action, ControlChange, DEFAULT_FLIGHT_LIMIT, Destination, Router};
pub use transport::{TcpTransport, Transport};

/// A running relay: acceptor, relay task and health monitor
pub struct RelayServer {
    local_addr: SocketAddr,
    handle: RelayHandle,
    registry: Registry,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayServer {
    /// Bind the listener and spawn all relay tasks
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let addr = config.listen_addr();
        debug!(%addr, "RelayServer::bind: called");

        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind relay listener on {}", addr))?;
        let local_addr = listener.local_addr().context("Failed to read listener address")?;

        let registry = Registry::new();
        let relay = Relay::new(&config, registry.clone());
        let handle = relay.handle();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let monitor = spawn_health_monitor(handle.clone(), config.health_interval(), shutdown_rx.clone());
        let ctx = ConnectionContext {
            config: Arc::new(config),
            registry: registry.clone(),
            relay: handle.clone(),
        };
        let relay_task = tokio::spawn(relay.run());
        let acceptor_task = tokio::spawn(acceptor::serve(listener, ctx, shutdown_rx));

        info!(%local_addr, "Relay listening");
        Ok(Self {
            local_addr,
            handle,
            registry,
            shutdown_tx,
            tasks: vec![relay_task, acceptor_task, monitor],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Signal shutdown and wait for the acceptor, monitor and relay to stop
    ///
    /// Connections blocked in a read end when their peer sends or closes.
    pub async fn shutdown(self) -> Result<()> {
        info!("Relay server shutting down");
        let _ = self.shutdown_tx.send(true);
        if self.handle.shutdown().await.is_err() {
            debug!("RelayServer::shutdown: relay already stopped");
        }

        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Relay task ended abnormally");
            }
        }
        Ok(())
    }
}
