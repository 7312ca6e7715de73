//! Main relay task implementation

use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::RelayConfig;
use super::dispatch::Dispatcher;
use super::handle::RelayHandle;
use super::messages::{RelayMetrics, RelayRequest, SimulationControl};
use super::monitor::HealthReport;
use super::registry::Registry;
use super::router::{Action, ControlChange, Router};
use crate::error::RelayError;
use crate::protocol::{DirectiveAction, Message, Role};

/// The relay routes every record between connected processes
///
/// Connection tasks talk to it only through [`RelayHandle`]; it owns the
/// router, the dispatcher and the backlog, and shares only the registry.
/// It never waits on a peer: records are handed to per-endpoint queues.
pub struct Relay {
    router: Router,
    dispatcher: Dispatcher,
    tx: mpsc::Sender<RelayRequest>,
    rx: mpsc::Receiver<RelayRequest>,
    control: SimulationControl,
    metrics: RelayMetrics,
    last_tick: Instant,
}

impl Relay {
    /// Create a new relay over a shared registry
    pub fn new(config: &RelayConfig, registry: Registry) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_buffer);
        Self {
            router: Router::new(config.names.clone()),
            dispatcher: Dispatcher::new(registry, config.names.clone()),
            tx,
            rx,
            control: SimulationControl::default(),
            metrics: RelayMetrics::default(),
            last_tick: Instant::now(),
        }
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle::new(self.tx.clone())
    }

    /// Run the relay task
    ///
    /// This consumes the relay and runs until shutdown is requested or every
    /// handle is dropped.
    pub async fn run(mut self) {
        // Drop our own sender so the loop ends once all handles are gone
        let (closed_tx, _) = mpsc::channel(1);
        drop(std::mem::replace(&mut self.tx, closed_tx));

        info!("Relay started");

        while let Some(req) = self.rx.recv().await {
            match req {
                RelayRequest::Connected { name, role } => self.on_connected(&name, role),

                RelayRequest::Inbound { origin, message } => {
                    self.metrics.messages_received += 1;
                    self.metrics.total_received += 1;
                    self.on_inbound(&origin, message);
                }

                RelayRequest::Disconnected { name, deregistered } => self.on_disconnected(&name, deregistered),

                RelayRequest::WriterFailed {
                    name,
                    connection_id,
                    undelivered,
                    error,
                } => self.on_writer_failed(&name, connection_id, undelivered, error),

                RelayRequest::Tick => self.on_tick(),

                RelayRequest::GetMetrics { reply_tx } => {
                    let _ = reply_tx.send(self.snapshot_metrics());
                }

                RelayRequest::Shutdown => {
                    info!("Relay shutting down");
                    break;
                }
            }

            self.announce_dropped();
        }

        if !self.dispatcher.backlog().is_empty() {
            warn!(
                backlog = self.dispatcher.backlog().len(),
                "Relay stopping with undelivered durability messages"
            );
        }
        info!("Relay stopped");
    }

    fn snapshot_metrics(&mut self) -> RelayMetrics {
        self.collect_sent();
        RelayMetrics {
            registered_endpoints: self.dispatcher.registry().len(),
            backlog_len: self.dispatcher.backlog().len(),
            control: self.control,
            ..self.metrics.clone()
        }
    }

    fn collect_sent(&mut self) {
        let sent = self.dispatcher.take_sent();
        self.metrics.messages_sent += sent;
        self.metrics.total_sent += sent;
    }

    fn on_connected(&mut self, name: &str, role: Role) {
        info!(%name, %role, "Endpoint registered");
        let names = self.router.names().clone();

        match role {
            Role::Simulator => {
                self.dispatcher.broadcast(name, &Message::SimulatorOnline {});
            }
            Role::Visualizer => {
                let resync = Message::Directive {
                    action: DirectiveAction::Resync,
                };
                if !self.dispatcher.deliver(&names.simulator, resync) {
                    debug!(%name, "Relay::on_connected: no simulator to resync");
                }
            }
            _ => {}
        }
    }

    fn on_inbound(&mut self, origin: &str, message: Message) {
        let kind = message.kind();
        for action in self.router.route(origin, message) {
            match action {
                Action::Deliver { to, message } => self.dispatcher.dispatch(to, message),
                Action::Control(change) => self.apply_control(origin, change),
                Action::ActiveFlights(count) => self.metrics.active_flights = count,
            }
        }
        debug!(%origin, %kind, "Relay::on_inbound: routed");
    }

    fn apply_control(&mut self, origin: &str, change: ControlChange) {
        info!(%origin, ?change, "Executing operator command");
        match change {
            ControlChange::Pause => self.control.paused = true,
            ControlChange::Resume => self.control.paused = false,
            ControlChange::SetFlightLimit(limit) => self.control.flight_limit = Some(limit),
        }
    }

    fn on_disconnected(&mut self, name: &str, deregistered: bool) {
        info!(%name, deregistered, "Endpoint disconnected");
        if deregistered && name == self.router.names().simulator {
            self.dispatcher.broadcast(name, &Message::SimulatorOffline {});
        }
    }

    fn on_writer_failed(&mut self, name: &str, connection_id: Uuid, undelivered: Vec<Message>, error: RelayError) {
        warn!(%name, %connection_id, error = %error, undelivered = undelivered.len(), "Endpoint writer failed");
        self.dispatcher.drop_endpoint(name, connection_id);
        for message in undelivered {
            self.dispatcher.fall_back(name, message);
        }
    }

    /// Tell everyone the simulator is gone if a failed delivery removed it
    ///
    /// Its connection task then finds the name already released and stays
    /// silent, so each removal yields one notice.
    fn announce_dropped(&mut self) {
        loop {
            let dropped = self.dispatcher.take_dropped();
            if dropped.is_empty() {
                break;
            }
            let simulator = self.router.names().simulator.clone();
            for name in dropped.iter().filter(|n| **n == simulator) {
                info!(%name, "Simulator dropped after a failed delivery");
                self.dispatcher.broadcast(name, &Message::SimulatorOffline {});
            }
        }
    }

    fn on_tick(&mut self) {
        self.collect_sent();
        let now = Instant::now();
        let report = HealthReport {
            elapsed: now.duration_since(self.last_tick),
            messages_sent: self.metrics.messages_sent,
            messages_received: self.metrics.messages_received,
            active_flights: self.metrics.active_flights,
            backlog_len: self.dispatcher.backlog().len(),
            control: self.control,
            endpoints: self.dispatcher.registry().snapshot(),
        };
        report.log();

        self.metrics.ticks += 1;
        self.metrics.messages_sent = 0;
        self.metrics.messages_received = 0;
        self.last_tick = now;

        // Flush writes count toward the next window
        let outcome = self.dispatcher.flush_backlog();
        debug!(?outcome, "Relay::on_tick: backlog flush");
        self.collect_sent();
    }
}
