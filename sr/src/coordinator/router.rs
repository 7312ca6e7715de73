//! Message routing rules
//!
//! Routing is a pure decision over (origin, message): it names destinations
//! by logical name and never touches the registry or the network.

use tracing::debug;

use super::config::WellKnownNames;
use crate::protocol::{DirectiveAction, Message, OperatorAction, unix_timestamp};

/// Flight limit applied when a set-limit command carries no value
pub const DEFAULT_FLIGHT_LIMIT: u32 = 10;

/// Where a routed message goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Every registered endpoint except the named one
    AllExcept(String),
    /// Exactly one endpoint, resolved by name at delivery time
    Endpoint(String),
}

/// Local state change requested by an operator command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlChange {
    Pause,
    Resume,
    SetFlightLimit(u32),
}

/// One routing decision
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Deliver { to: Destination, message: Message },
    Control(ControlChange),
    /// Active-flight hint for telemetry only
    ActiveFlights(u64),
}

impl Action {
    fn broadcast(origin: &str, message: Message) -> Self {
        Action::Deliver {
            to: Destination::AllExcept(origin.to_string()),
            message,
        }
    }

    fn unicast(to: &str, message: Message) -> Self {
        Action::Deliver {
            to: Destination::Endpoint(to.to_string()),
            message,
        }
    }
}

/// Routing table keyed on message kind
#[derive(Debug, Clone, Default)]
pub struct Router {
    names: WellKnownNames,
}

impl Router {
    pub fn new(names: WellKnownNames) -> Self {
        Self { names }
    }

    pub fn names(&self) -> &WellKnownNames {
        &self.names
    }

    /// Decide what to do with `message` received from `origin`
    pub fn route(&self, origin: &str, message: Message) -> Vec<Action> {
        debug!(%origin, kind = message.kind(), flight_id = ?message.flight_id(), "Router::route: called");
        let names = &self.names;

        match message {
            Message::FlightUpdate { ref active_flights, .. } => {
                let mut actions = Vec::with_capacity(2);
                if let Some(count) = *active_flights {
                    actions.push(Action::ActiveFlights(count));
                }
                actions.push(Action::broadcast(origin, message));
                actions
            }

            Message::FlightCreated { ref flight, .. } => {
                let copy = Message::SaveFlight { flight: flight.clone() };
                vec![
                    Action::broadcast(origin, message),
                    Action::unicast(&names.persistence, copy),
                ]
            }

            Message::FlightCompleted { .. } => vec![
                Action::unicast(&names.persistence, message.clone()),
                Action::broadcast(origin, message),
            ],

            Message::SaveFlight { .. } => vec![Action::unicast(&names.persistence, message)],

            Message::Ping { .. } => vec![Action::unicast(
                origin,
                Message::Pong {
                    timestamp: unix_timestamp(),
                },
            )],

            Message::AtcDirective { .. } | Message::ManualFlightRequest { .. } => {
                vec![Action::unicast(&names.simulator, message)]
            }

            Message::OperatorCommand { command, value } => {
                let (change, directive) = match command {
                    OperatorAction::Pause => (
                        ControlChange::Pause,
                        Message::Directive {
                            action: DirectiveAction::Pause,
                        },
                    ),
                    OperatorAction::Resume => (
                        ControlChange::Resume,
                        Message::Directive {
                            action: DirectiveAction::Resume,
                        },
                    ),
                    OperatorAction::SetFlightLimit => {
                        let limit = value.unwrap_or(DEFAULT_FLIGHT_LIMIT);
                        (
                            ControlChange::SetFlightLimit(limit),
                            Message::Configuration { max_flights: limit },
                        )
                    }
                };
                vec![Action::Control(change), Action::unicast(&names.simulator, directive)]
            }

            Message::StatisticsRequest {} => vec![Action::unicast(
                &names.persistence,
                Message::FetchStatistics {
                    requester: origin.to_string(),
                },
            )],

            Message::StatisticsReply { .. } => vec![Action::unicast(&names.visualizer, message)],

            other => {
                debug!(%origin, kind = other.kind(), "Router::route: no route for kind");
                Vec::new()
            }
        }
    }
}
