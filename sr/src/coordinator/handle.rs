//! RelayHandle - sending side of the relay task

use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use super::messages::{RelayMetrics, RelayRequest};
use crate::error::RelayError;
use crate::protocol::{Message, Role};

/// Cloneable handle that connection tasks and the monitor use to reach the relay
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayRequest>,
}

impl RelayHandle {
    pub(crate) fn new(tx: mpsc::Sender<RelayRequest>) -> Self {
        Self { tx }
    }

    async fn request(&self, req: RelayRequest) -> Result<(), RelayError> {
        self.tx.send(req).await.map_err(|_| RelayError::ChannelClosed)
    }

    pub async fn connected(&self, name: &str, role: Role) -> Result<(), RelayError> {
        debug!(%name, %role, "RelayHandle::connected: called");
        self.request(RelayRequest::Connected {
            name: name.to_string(),
            role,
        })
        .await
    }

    pub async fn inbound(&self, origin: &str, message: Message) -> Result<(), RelayError> {
        self.request(RelayRequest::Inbound {
            origin: origin.to_string(),
            message,
        })
        .await
    }

    pub async fn disconnected(&self, name: &str, deregistered: bool) -> Result<(), RelayError> {
        debug!(%name, deregistered, "RelayHandle::disconnected: called");
        self.request(RelayRequest::Disconnected {
            name: name.to_string(),
            deregistered,
        })
        .await
    }

    pub async fn writer_failed(
        &self,
        name: &str,
        connection_id: Uuid,
        undelivered: Vec<Message>,
        error: RelayError,
    ) -> Result<(), RelayError> {
        debug!(%name, %connection_id, undelivered = undelivered.len(), "RelayHandle::writer_failed: called");
        self.request(RelayRequest::WriterFailed {
            name: name.to_string(),
            connection_id,
            undelivered,
            error,
        })
        .await
    }

    /// Run the health duties now instead of waiting for the next interval
    pub async fn tick(&self) -> Result<(), RelayError> {
        self.request(RelayRequest::Tick).await
    }

    pub async fn metrics(&self) -> Result<RelayMetrics, RelayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(RelayRequest::GetMetrics { reply_tx }).await?;
        reply_rx.await.map_err(|_| RelayError::ChannelClosed)
    }

    pub async fn shutdown(&self) -> Result<(), RelayError> {
        debug!("RelayHandle::shutdown: called");
        self.request(RelayRequest::Shutdown).await
    }
}
