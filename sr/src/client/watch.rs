//! Long-lived observer client
//!
//! Logs every record it receives. In the visualizer role it also keeps the
//! local fallback: a flag raised while no simulator feed is available (the
//! coordinator is unreachable or has reported the simulator offline), and an
//! append-only file of durability payloads mirrored through backup notices.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::handle::{ClientHandle, MessageHandler};
use crate::error::RelayError;
use crate::protocol::{Message, Role, encode_frame};

/// Append-only JSON-lines file of mirrored durability payloads
#[derive(Debug, Clone)]
pub struct FallbackLog {
    path: PathBuf,
}

impl FallbackLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, payload: &Message) -> Result<(), RelayError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let frame = encode_frame(payload)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path).await?;
        file.write_all(&frame).await?;
        file.flush().await?;
        Ok(())
    }
}

pub struct WatchHandler {
    role: Role,
    fallback_log: Option<FallbackLog>,
    fallback_tx: watch::Sender<bool>,
}

impl WatchHandler {
    pub fn new(role: Role, fallback_log: Option<FallbackLog>) -> Self {
        // A visualizer starts out with no feed
        let (fallback_tx, _) = watch::channel(role == Role::Visualizer);
        Self {
            role,
            fallback_log,
            fallback_tx,
        }
    }

    /// True while a visualizer has no simulator feed
    pub fn fallback_active(&self) -> bool {
        *self.fallback_tx.borrow()
    }

    /// Observe the fallback flag, e.g. to drive a local simulation loop
    pub fn subscribe_fallback(&self) -> watch::Receiver<bool> {
        self.fallback_tx.subscribe()
    }

    fn set_fallback(&self, active: bool) {
        if self.role != Role::Visualizer {
            return;
        }
        let changed = self.fallback_tx.send_if_modified(|current| {
            let changed = *current != active;
            *current = active;
            changed
        });
        if changed {
            if active {
                info!("Simulator feed lost, local fallback active");
            } else {
                info!("Simulator feed restored, local fallback ended");
            }
        }
    }
}

/// Call `report` with the current fallback state and on every change
///
/// The task ends once the handler owning the flag is dropped.
pub fn follow_fallback<F>(mut rx: watch::Receiver<bool>, report: F) -> JoinHandle<()>
where
    F: Fn(bool) + Send + 'static,
{
    tokio::spawn(async move {
        report(*rx.borrow_and_update());
        while rx.changed().await.is_ok() {
            report(*rx.borrow_and_update());
        }
        debug!("follow_fallback: flag dropped");
    })
}

#[async_trait]
impl MessageHandler for WatchHandler {
    async fn handle(&self, message: Message, _client: &ClientHandle) {
        match &message {
            Message::BackupNotice { payload } => {
                info!(kind = payload.kind(), flight_id = ?payload.flight_id(), "Backup notice");
                if self.role == Role::Visualizer
                    && let Some(log) = &self.fallback_log
                    && let Err(e) = log.append(payload).await
                {
                    warn!(path = %log.path().display(), error = %e, "Failed to write fallback log");
                }
            }
            Message::ResetState {} => info!("State reset requested"),
            Message::SimulatorOnline {} => {
                info!("Simulator online");
                self.set_fallback(false);
            }
            Message::SimulatorOffline {} => {
                info!("Simulator offline");
                self.set_fallback(true);
            }
            Message::Unknown => debug!("WatchHandler::handle: unknown record kind"),
            other => match serde_json::to_string(other) {
                Ok(json) => info!(kind = other.kind(), record = %json, "Received"),
                Err(_) => info!(kind = other.kind(), "Received"),
            },
        }
    }

    async fn on_connected(&self, _client: &ClientHandle) {
        self.set_fallback(false);
    }

    async fn on_disconnected(&self, _client: &ClientHandle) {
        self.set_fallback(true);
    }
}
