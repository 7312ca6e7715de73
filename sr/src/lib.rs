//! SkyRelay - coordinator relay for a distributed air-traffic simulation
//!
//! Every simulation process (flight generator, persistence store, map
//! renderer, control panel) talks only to the coordinator. The coordinator
//! registers each connection under a logical name and forwards records by
//! name; durability writes that cannot be delivered wait in a backlog until
//! the persistence endpoint returns.
//!
//! # Modules
//!
//! - [`protocol`] - Wire records and newline-delimited JSON framing
//! - [`coordinator`] - Registry, router, backlog, acceptor and health monitor
//! - [`client`] - Reconnecting client runtime used by every other process
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod protocol;

pub use client::{ClientConfig, ClientHandle, ClientRuntime, ConnectionState, MessageHandler};
pub use config::Config;
pub use coordinator::{RelayConfig, RelayHandle, RelayMetrics, RelayServer};
pub use error::{DeliveryError, RelayError};
pub use protocol::{Message, Role};
