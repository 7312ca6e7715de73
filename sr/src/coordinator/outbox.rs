//! Per-endpoint outbound queue and writer task
//!
//! The relay never waits on a peer socket. Every registered endpoint owns a
//! bounded queue drained by its own writer task, and the relay only enqueues.
//! A full queue means the peer stopped reading: the relay evicts it, and the
//! writer abandons its in-flight write and hands the unsent records back.

use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::handle::RelayHandle;
use super::transport::Transport;
use crate::error::RelayError;
use crate::protocol::{Message, encode_frame};

/// Why a record could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The peer is not draining its queue
    Full,
    /// The writer has stopped
    Closed,
}

/// Sending side of an endpoint's queue
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Message>,
    evict: Arc<Notify>,
}

impl Outbox {
    pub fn channel(capacity: usize) -> (Outbox, Inbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let evict = Arc::new(Notify::new());
        (
            Outbox {
                tx,
                evict: Arc::clone(&evict),
            },
            Inbox { rx, evict },
        )
    }

    /// Queue `message` without waiting
    pub fn try_send(&self, message: Message) -> Result<(), EnqueueError> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Free slots left in the queue
    pub fn room(&self) -> usize {
        self.tx.capacity()
    }

    /// Tell the writer to stop, abandoning any write in progress
    pub fn evict(&self) {
        self.evict.notify_one();
    }
}

/// Receiving side of an endpoint's queue
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::Receiver<Message>,
    evict: Arc<Notify>,
}

impl Inbox {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Resolves once the relay has evicted this endpoint
    pub async fn evicted(&self) {
        self.evict.notified().await
    }
}

/// Drains one endpoint's queue onto its transport
pub struct Writer {
    name: String,
    connection_id: Uuid,
    transport: Arc<dyn Transport>,
    rx: mpsc::Receiver<Message>,
    evict: Arc<Notify>,
    relay: RelayHandle,
}

impl Writer {
    pub fn new(
        name: impl Into<String>,
        connection_id: Uuid,
        transport: Arc<dyn Transport>,
        inbox: Inbox,
        relay: RelayHandle,
    ) -> Self {
        let Inbox { rx, evict } = inbox;
        Self {
            name: name.into(),
            connection_id,
            transport,
            rx,
            evict,
            relay,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Write queued records in order until the queue closes or a write fails
    ///
    /// A clean close leaves the transport open; its connection task owns it.
    /// On failure or eviction the transport is shut down and the unsent
    /// records, in-flight one first, are reported to the relay.
    pub async fn run(mut self) {
        debug!(name = %self.name, connection_id = %self.connection_id, "Writer::run: called");

        let (in_flight, error) = loop {
            let message = tokio::select! {
                biased;
                _ = self.evict.notified() => break (None, RelayError::Evicted),
                message = self.rx.recv() => match message {
                    Some(message) => message,
                    None => {
                        debug!(name = %self.name, "Writer::run: queue closed");
                        return;
                    }
                },
            };

            let frame = match encode_frame(&message) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(name = %self.name, kind = message.kind(), error = %e, "Dropping unencodable record");
                    continue;
                }
            };

            let sent = tokio::select! {
                biased;
                _ = self.evict.notified() => Err(RelayError::Evicted),
                result = self.transport.send(&frame) => result,
            };
            if let Err(e) = sent {
                break (Some(message), e);
            }
        };

        // Nothing can be queued behind the drain
        self.rx.close();
        let mut undelivered: Vec<Message> = in_flight.into_iter().collect();
        while let Ok(message) = self.rx.try_recv() {
            undelivered.push(message);
        }
        warn!(
            name = %self.name,
            peer = %self.transport.peer(),
            error = %error,
            undelivered = undelivered.len(),
            "Endpoint writer stopped"
        );
        self.transport.shutdown().await;

        if self
            .relay
            .writer_failed(&self.name, self.connection_id, undelivered, error)
            .await
            .is_err()
        {
            debug!(name = %self.name, "Writer::run: relay gone");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::coordinator::messages::RelayRequest;
    use crate::protocol::decode_segment;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Transport that records delivered messages and can fail on the Nth attempt
    pub(crate) struct RecordingTransport {
        received: Mutex<Vec<Message>>,
        attempts: AtomicUsize,
        fail_on_attempt: Option<usize>,
        shut: AtomicBool,
    }

    impl RecordingTransport {
        pub(crate) fn new() -> Arc<Self> {
            Self::build(None)
        }

        pub(crate) fn failing_on(attempt: usize) -> Arc<Self> {
            Self::build(Some(attempt))
        }

        fn build(fail_on_attempt: Option<usize>) -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
                fail_on_attempt,
                shut: AtomicBool::new(false),
            })
        }

        pub(crate) fn received(&self) -> Vec<Message> {
            self.received.lock().unwrap().clone()
        }

        pub(crate) fn is_shut(&self) -> bool {
            self.shut.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, frame: &[u8]) -> Result<(), RelayError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on_attempt == Some(attempt) {
                return Err(RelayError::PeerClosed);
            }
            let msg: Message = decode_segment(&frame[..frame.len() - 1]).unwrap();
            self.received.lock().unwrap().push(msg);
            Ok(())
        }

        async fn shutdown(&self) {
            self.shut.store(true, Ordering::SeqCst);
        }

        fn peer(&self) -> String {
            "recording".to_string()
        }
    }

    /// Transport whose writes never complete, like a peer that stopped reading
    pub(crate) struct StalledTransport {
        entered: Notify,
        shut: AtomicBool,
    }

    impl StalledTransport {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                entered: Notify::new(),
                shut: AtomicBool::new(false),
            })
        }

        /// Wait until a write is blocked
        pub(crate) async fn entered(&self) {
            self.entered.notified().await
        }

        pub(crate) fn is_shut(&self) -> bool {
            self.shut.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for StalledTransport {
        async fn send(&self, _frame: &[u8]) -> Result<(), RelayError> {
            self.entered.notify_one();
            std::future::pending().await
        }

        async fn shutdown(&self) {
            self.shut.store(true, Ordering::SeqCst);
        }

        fn peer(&self) -> String {
            "stalled".to_string()
        }
    }

    fn save(id: &str) -> Message {
        Message::SaveFlight { flight: json!({"id": id}) }
    }

    fn writer(transport: Arc<dyn Transport>, capacity: usize) -> (Outbox, Uuid, mpsc::Receiver<RelayRequest>, JoinHandle<()>) {
        let (outbox, inbox) = Outbox::channel(capacity);
        let (relay_tx, relay_rx) = mpsc::channel(8);
        let connection_id = Uuid::now_v7();
        let task = Writer::new("db", connection_id, transport, inbox, RelayHandle::new(relay_tx)).spawn();
        (outbox, connection_id, relay_rx, task)
    }

    #[tokio::test]
    async fn test_writer_delivers_in_order_and_stops_quietly() {
        let transport = RecordingTransport::new();
        let (outbox, _, mut relay_rx, task) = writer(transport.clone(), 8);

        for id in ["A", "B", "C"] {
            outbox.try_send(save(id)).unwrap();
        }
        drop(outbox);
        task.await.unwrap();

        assert_eq!(transport.received(), vec![save("A"), save("B"), save("C")]);
        assert!(!transport.is_shut());
        assert!(relay_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_write_reports_unsent_records() {
        let transport = RecordingTransport::failing_on(2);
        let (outbox, connection_id, mut relay_rx, task) = writer(transport.clone(), 8);

        for id in ["A", "B", "C"] {
            outbox.try_send(save(id)).unwrap();
        }
        let report = tokio::time::timeout(Duration::from_secs(2), relay_rx.recv()).await.unwrap();

        match report {
            Some(RelayRequest::WriterFailed {
                name,
                connection_id: id,
                undelivered,
                error,
            }) => {
                assert_eq!(name, "db");
                assert_eq!(id, connection_id);
                assert_eq!(undelivered, vec![save("B"), save("C")]);
                assert!(matches!(error, RelayError::PeerClosed));
            }
            other => panic!("Unexpected request: {:?}", other),
        }
        task.await.unwrap();
        assert_eq!(transport.received(), vec![save("A")]);
        assert!(transport.is_shut());
        assert_eq!(outbox.try_send(save("D")), Err(EnqueueError::Closed));
    }

    #[tokio::test]
    async fn test_eviction_abandons_blocked_write() {
        let transport = StalledTransport::new();
        let (outbox, _, mut relay_rx, task) = writer(transport.clone(), 1);

        outbox.try_send(save("A")).unwrap();
        transport.entered().await;
        outbox.try_send(save("B")).unwrap();
        assert_eq!(outbox.room(), 0);
        assert_eq!(outbox.try_send(save("C")), Err(EnqueueError::Full));

        outbox.evict();
        let report = tokio::time::timeout(Duration::from_secs(2), relay_rx.recv()).await.unwrap();
        let Some(RelayRequest::WriterFailed { undelivered, error, .. }) = report else {
            panic!("expected a writer failure report");
        };
        assert_eq!(undelivered, vec![save("A"), save("B")]);
        assert!(matches!(error, RelayError::Evicted));
        task.await.unwrap();
        assert!(transport.is_shut());
    }
}
