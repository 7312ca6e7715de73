//! Client protocol runtime shared by every non-coordinator process
//!
//! A process supplies its identity in [`ClientConfig`] and its reactions in a
//! [`MessageHandler`]; the runtime handles failover, handshake, framing and
//! reconnection, and hands back a [`ClientHandle`] for writes.

mod config;
mod handle;
mod runtime;
mod watch;

pub use config::{ClientConfig, ENV_HOST, ENV_HOSTS, ENV_PORT};
pub use handle::{ClientHandle, ConnectionState, MessageHandler};
pub use runtime::ClientRuntime;
pub use watch::{FallbackLog, WatchHandler, follow_fallback};
