//! Health monitor
//!
//! A timer task nudges the relay on a fixed interval; the relay then logs a
//! throughput snapshot with the registered endpoints and flushes the backlog.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::handle::RelayHandle;
use super::messages::SimulationControl;
use super::registry::EndpointInfo;

/// Throughput and registry snapshot for one tick
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub elapsed: Duration,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub active_flights: u64,
    pub backlog_len: usize,
    pub control: SimulationControl,
    pub endpoints: Vec<EndpointInfo>,
}

impl HealthReport {
    /// Messages sent plus received per second over the tick
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.messages_sent + self.messages_received) as f64 / secs
        } else {
            0.0
        }
    }

    pub fn log(&self) {
        info!(
            endpoints = self.endpoints.len(),
            active_flights = self.active_flights,
            sent = self.messages_sent,
            received = self.messages_received,
            rate = %format!("{:.2}", self.rate()),
            backlog = self.backlog_len,
            paused = self.control.paused,
            flight_limit = ?self.control.flight_limit,
            "System status"
        );
        for endpoint in &self.endpoints {
            info!(
                name = %endpoint.name,
                role = %endpoint.role,
                peer = %endpoint.peer,
                since = %endpoint.connected_at.to_rfc3339(),
                "Connected endpoint"
            );
        }
    }
}

/// Spawn the timer that drives health ticks until shutdown
pub fn spawn_health_monitor(
    relay: RelayHandle,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    debug!(?interval, "spawn_health_monitor: called");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if relay.tick().await.is_err() {
                        debug!("spawn_health_monitor: relay gone, stopping");
                        break;
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("spawn_health_monitor: shutdown observed");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::messages::RelayRequest;
    use tokio::sync::mpsc;

    fn report(elapsed: Duration, sent: u64, received: u64) -> HealthReport {
        HealthReport {
            elapsed,
            messages_sent: sent,
            messages_received: received,
            active_flights: 0,
            backlog_len: 0,
            control: SimulationControl::default(),
            endpoints: Vec::new(),
        }
    }

    #[test]
    fn test_rate() {
        assert_eq!(report(Duration::from_secs(30), 40, 20).rate(), 2.0);
        assert_eq!(report(Duration::ZERO, 40, 20).rate(), 0.0);
    }

    #[tokio::test]
    async fn test_monitor_ticks_then_stops_on_shutdown() {
        let (tx, mut rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = spawn_health_monitor(RelayHandle::new(tx), Duration::from_millis(20), shutdown_rx);

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert!(matches!(first, Some(RelayRequest::Tick)));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
