//! Delivery of routed messages to named endpoints
//!
//! Names are resolved under the registry lock and records are handed to the
//! endpoint's queue without waiting. A refused record deregisters the
//! endpoint; for the durability endpoint the record is parked in the backlog
//! with a mirrored backup notice sent to the visualizer. Every endpoint
//! removed here is reported through [`Dispatcher::take_dropped`].

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backlog::Backlog;
use super::config::WellKnownNames;
use super::outbox::EnqueueError;
use super::registry::Registry;
use super::router::Destination;
use crate::error::DeliveryError;
use crate::protocol::Message;

/// Result of one backlog flush attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub flushed: usize,
    pub remaining: usize,
}

pub struct Dispatcher {
    registry: Registry,
    names: WellKnownNames,
    backlog: Backlog,
    sent: u64,
    dropped: Vec<String>,
}

impl Dispatcher {
    pub fn new(registry: Registry, names: WellKnownNames) -> Self {
        let backlog = Backlog::new(names.persistence.clone());
        Self {
            registry,
            names,
            backlog,
            sent: 0,
            dropped: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn backlog(&self) -> &Backlog {
        &self.backlog
    }

    /// Messages queued since the last call
    pub fn take_sent(&mut self) -> u64 {
        std::mem::take(&mut self.sent)
    }

    /// Names removed from the registry since the last call
    pub fn take_dropped(&mut self) -> Vec<String> {
        std::mem::take(&mut self.dropped)
    }

    /// Deregister `name` if it still belongs to `connection_id`
    pub fn drop_endpoint(&mut self, name: &str, connection_id: Uuid) -> bool {
        if self.registry.deregister_connection(name, connection_id).is_some() {
            info!(%name, %connection_id, "Endpoint dropped");
            self.dropped.push(name.to_string());
            true
        } else {
            false
        }
    }

    /// Queue `message` for `name` with no fallback
    ///
    /// A full queue evicts the endpoint; a closed one means its writer is
    /// gone. Either way the endpoint is deregistered.
    pub fn send_to(&mut self, name: &str, message: &Message) -> Result<(), DeliveryError> {
        let Some((connection_id, outbox)) = self.registry.resolve(name) else {
            return Err(DeliveryError::NotRegistered(name.to_string()));
        };

        match outbox.try_send(message.clone()) {
            Ok(()) => {
                self.sent += 1;
                Ok(())
            }
            Err(EnqueueError::Full) => {
                warn!(%name, kind = message.kind(), "Endpoint is not draining its queue, evicting");
                outbox.evict();
                self.drop_endpoint(name, connection_id);
                Err(DeliveryError::Stalled(name.to_string()))
            }
            Err(EnqueueError::Closed) => {
                warn!(%name, kind = message.kind(), "Endpoint writer has stopped, dropping endpoint");
                self.drop_endpoint(name, connection_id);
                Err(DeliveryError::Closed(name.to_string()))
            }
        }
    }

    /// Deliver with the durability fallback
    ///
    /// Returns whether the endpoint accepted the record.
    pub fn deliver(&mut self, name: &str, message: Message) -> bool {
        match self.send_to(name, &message) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, kind = message.kind(), "Dispatcher::deliver: failed");
                self.fall_back(name, message);
                false
            }
        }
    }

    /// Handle a record `name` will never get
    ///
    /// Durability records go to the backlog and are mirrored to the
    /// visualizer; anything else is dropped.
    pub fn fall_back(&mut self, name: &str, message: Message) {
        if name != self.backlog.destination() {
            debug!(%name, kind = message.kind(), "Dispatcher::fall_back: dropped");
            return;
        }

        info!(
            %name,
            kind = message.kind(),
            flight_id = ?message.flight_id(),
            backlog = self.backlog.len() + 1,
            "Durability endpoint unreachable, queuing message"
        );
        let notice = Message::BackupNotice {
            payload: Box::new(message.clone()),
        };
        self.backlog.push(message);

        let visualizer = self.names.visualizer.clone();
        if let Err(e) = self.send_to(&visualizer, &notice) {
            debug!(error = %e, "Dispatcher::fall_back: backup notice not delivered");
        }
    }

    /// Deliver to every registered endpoint except `except`
    ///
    /// Iterates a snapshot of the broadcast order taken before any enqueue.
    pub fn broadcast(&mut self, except: &str, message: &Message) -> usize {
        let names = self.registry.names();
        debug!(%except, kind = message.kind(), targets = names.len(), "Dispatcher::broadcast: called");

        let mut delivered = 0;
        for name in names.iter().filter(|n| n.as_str() != except) {
            if self.deliver(name, message.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn dispatch(&mut self, to: Destination, message: Message) {
        match to {
            Destination::AllExcept(origin) => {
                self.broadcast(&origin, &message);
            }
            Destination::Endpoint(name) => {
                self.deliver(&name, message);
            }
        }
    }

    /// Drain the backlog head-first, stopping at the first failure
    ///
    /// Does nothing unless the durability endpoint is registered. Stops
    /// without penalty when the endpoint's queue has no room left; the rest
    /// waits for the next attempt. A refused item stays at the head.
    pub fn flush_backlog(&mut self) -> FlushOutcome {
        let destination = self.backlog.destination().to_string();
        let resolved = match self.registry.resolve(&destination) {
            Some(resolved) if !self.backlog.is_empty() => resolved,
            _ => {
                return FlushOutcome {
                    flushed: 0,
                    remaining: self.backlog.len(),
                };
            }
        };
        let (connection_id, outbox) = resolved;

        let mut flushed = 0;
        while let Some(message) = self.backlog.front() {
            if outbox.room() == 0 {
                debug!(%destination, remaining = self.backlog.len(), "Dispatcher::flush_backlog: queue full");
                break;
            }
            match outbox.try_send(message.clone()) {
                Ok(()) => {
                    self.backlog.pop_front();
                    self.sent += 1;
                    flushed += 1;
                }
                Err(e) => {
                    warn!(%destination, error = ?e, remaining = self.backlog.len(), "Backlog flush interrupted");
                    self.drop_endpoint(&destination, connection_id);
                    break;
                }
            }
        }

        if flushed > 0 {
            info!(%destination, flushed, remaining = self.backlog.len(), "Backlog flushed");
        }
        FlushOutcome {
            flushed,
            remaining: self.backlog.len(),
        }
    }
}
