//! Client protocol runtime
//!
//! Connects to the first coordinator host that acknowledges a handshake,
//! runs one session until it breaks, then starts over. A pass over the
//! whole host list that finds nobody is followed by a fixed delay; there is
//! no limit on the number of passes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::ClientConfig;
use super::handle::{ClientHandle, ConnectionState, MessageHandler, Outbound};
use crate::error::RelayError;
use crate::protocol::{FramedReader, Handshake, HandshakeAck, Message, write_frame};

/// An established, acknowledged connection
struct Session {
    target: String,
    reader: FramedReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Why a session ended
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Lost(RelayError),
}

pub struct ClientRuntime {
    config: ClientConfig,
    handler: Arc<dyn MessageHandler>,
    handle: ClientHandle,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    cycles: Arc<AtomicU64>,
}

impl ClientRuntime {
    pub fn new(config: ClientConfig, handler: Arc<dyn MessageHandler>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cycles = Arc::new(AtomicU64::new(0));
        let handle = ClientHandle::new(outbound_tx, state_rx, Arc::new(shutdown_tx), cycles.clone());

        Self {
            config,
            handler,
            handle,
            outbound_rx,
            state_tx,
            shutdown_rx,
            cycles,
        }
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Spawn the runtime on the current tokio runtime
    pub fn spawn(self) -> (ClientHandle, JoinHandle<()>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    fn stopping(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(?state, "ClientRuntime::set_state: called");
        self.state_tx.send_replace(state);
    }

    /// Run connect cycles and sessions until shutdown
    pub async fn run(mut self) {
        info!(name = %self.config.name, role = %self.config.role, targets = ?self.config.targets(), "Client runtime started");

        while !self.stopping() {
            let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
            self.set_state(ConnectionState::Connecting { cycle });

            let Some(session) = self.connect_any().await else {
                self.set_state(ConnectionState::Disconnected);
                let delay = self.config.retry_delay();
                info!(cycle, ?delay, "No coordinator reachable, retrying");
                let mut shutdown_rx = self.shutdown_rx.clone();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => {}
                }
                continue;
            };

            info!(coordinator = %session.target, name = %self.config.name, "Connected to coordinator");
            self.set_state(ConnectionState::Connected {
                target: session.target.clone(),
                cycle,
            });
            self.handler.on_connected(&self.handle).await;

            let end = self.run_session(session, cycle).await;

            self.set_state(ConnectionState::Disconnected);
            self.discard_unsent();
            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(e) => {
                    warn!(error = %e, "Lost coordinator connection");
                    self.handler.on_disconnected(&self.handle).await;
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Client runtime stopped");
    }

    /// Try every host once, in order
    async fn connect_any(&self) -> Option<Session> {
        for addr in self.config.targets() {
            if self.stopping() {
                return None;
            }
            match tokio::time::timeout(self.config.connect_timeout(), self.connect(&addr)).await {
                Ok(Ok(session)) => return Some(session),
                Ok(Err(e)) => debug!(%addr, error = %e, "ClientRuntime::connect_any: host failed"),
                Err(_) => debug!(%addr, "ClientRuntime::connect_any: host timed out"),
            }
        }
        None
    }

    /// Dial, send our identity and wait for an OK acknowledgement
    async fn connect(&self, addr: &str) -> Result<Session, RelayError> {
        debug!(%addr, "ClientRuntime::connect: called");
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, mut writer) = stream.into_split();

        let handshake = Handshake::new(self.config.name.clone(), self.config.role, self.config.version.clone());
        write_frame(&mut writer, &handshake).await?;

        let mut reader = FramedReader::new(read_half, self.config.max_frame_bytes);
        let ack: HandshakeAck = reader
            .next_record()
            .await?
            .map_err(|e| RelayError::Handshake(e.to_string()))?;
        if !ack.is_ok() {
            return Err(RelayError::Handshake(format!("{}: {}", ack.status, ack.message)));
        }

        debug!(%addr, message = %ack.message, "ClientRuntime::connect: acknowledged");
        Ok(Session {
            target: addr.to_string(),
            reader,
            writer,
        })
    }

    /// Pump records both ways until the session breaks
    ///
    /// Records queued during an earlier session are dropped here.
    async fn run_session(&mut self, mut session: Session, cycle: u64) -> SessionEnd {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                biased;

                Some(outbound) = self.outbound_rx.recv() => {
                    if outbound.cycle != cycle {
                        debug!(kind = outbound.message.kind(), queued_in = outbound.cycle, cycle, "ClientRuntime::run_session: dropping stale record");
                        continue;
                    }
                    if let Err(e) = write_frame(&mut session.writer, &outbound.message).await {
                        return SessionEnd::Lost(e);
                    }
                }

                record = session.reader.next_record::<Message>() => match record {
                    Ok(Ok(message)) => self.handler.handle(message, &self.handle).await,
                    Ok(Err(e)) => warn!(error = %e, "Skipping undecodable record"),
                    Err(e) => return SessionEnd::Lost(e),
                },

                _ = shutdown_rx.changed() => return SessionEnd::Shutdown,
            }
        }
    }

    fn discard_unsent(&mut self) {
        let mut dropped = 0;
        while self.outbound_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, "Discarded records queued for a closed session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DEFAULT_MAX_FRAME_BYTES, Role, encode_frame};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Collect {
        messages: Mutex<Vec<Message>>,
        disconnects: AtomicU64,
    }

    #[async_trait]
    impl MessageHandler for Collect {
        async fn handle(&self, message: Message, _client: &ClientHandle) {
            self.messages.lock().unwrap().push(message);
        }

        async fn on_disconnected(&self, _client: &ClientHandle) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(hosts: Vec<String>, port: u16) -> ClientConfig {
        ClientConfig {
            hosts,
            port,
            retry_delay_secs: 0,
            connect_timeout_ms: 500,
            ..ClientConfig::new("sim", Role::Simulator)
        }
    }

    /// Accept one connection, read the handshake and acknowledge it
    async fn accept_and_ack(listener: &TcpListener) -> (FramedReader<OwnedReadHalf>, OwnedWriteHalf, Handshake) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = FramedReader::new(read, DEFAULT_MAX_FRAME_BYTES);
        let handshake: Handshake = reader.next_record().await.unwrap().unwrap();
        let mut frames = encode_frame(&HandshakeAck::ok("sim")).unwrap();
        frames.extend(encode_frame(&Message::ResetState {}).unwrap());
        write.write_all(&frames).await.unwrap();
        (reader, write, handshake)
    }

    #[tokio::test]
    async fn test_failover_to_second_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // First host refuses or times out
        let hosts = vec!["127.0.0.2".to_string(), "127.0.0.1".to_string()];

        let handler = Arc::new(Collect::default());
        let (client, task) = ClientRuntime::new(config(hosts, port), handler.clone()).spawn();

        let (_reader, _write, handshake) = accept_and_ack(&listener).await;
        assert_eq!(handshake.name.as_deref(), Some("sim"));
        assert_eq!(handshake.role, Role::Simulator);

        client.wait_connected(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(
            client.state(),
            ConnectionState::Connected { target, .. } if target == format!("127.0.0.1:{port}")
        ));

        client.shutdown();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_session_reads_and_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handler = Arc::new(Collect::default());
        let (client, task) = ClientRuntime::new(config(vec!["127.0.0.1".to_string()], port), handler.clone()).spawn();

        let (mut reader, mut write, _) = accept_and_ack(&listener).await;
        client.wait_connected(Duration::from_secs(2)).await.unwrap();

        client.send(Message::Ping { timestamp: Some(1.0) }).unwrap();
        let ping: Message = reader.next_record().await.unwrap().unwrap();
        assert_eq!(ping, Message::Ping { timestamp: Some(1.0) });

        write.write_all(b"garbage\n").await.unwrap();
        write_frame(&mut write, &Message::Pong { timestamp: 2.0 }).await.unwrap();

        for _ in 0..100 {
            if handler.messages.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            *handler.messages.lock().unwrap(),
            vec![Message::ResetState {}, Message::Pong { timestamp: 2.0 }]
        );

        client.shutdown();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_lost_session_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handler = Arc::new(Collect::default());
        let (client, task) = ClientRuntime::new(config(vec!["127.0.0.1".to_string()], port), handler.clone()).spawn();

        let (reader, write, _) = accept_and_ack(&listener).await;
        client.wait_connected(Duration::from_secs(2)).await.unwrap();
        drop(reader);
        drop(write);

        let (_reader, _write, _) = accept_and_ack(&listener).await;
        let mut state_rx = client.subscribe();
        tokio::time::timeout(Duration::from_secs(2), state_rx.wait_for(|s| s.is_connected()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handler.disconnects.load(Ordering::SeqCst), 1);
        assert!(client.cycles() >= 2);

        client.shutdown();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_record_from_lost_session_is_not_replayed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handler = Arc::new(Collect::default());
        let (client, task) = ClientRuntime::new(config(vec!["127.0.0.1".to_string()], port), handler).spawn();

        let (reader, write, _) = accept_and_ack(&listener).await;
        client.wait_connected(Duration::from_secs(2)).await.unwrap();
        let ConnectionState::Connected { cycle: first, .. } = client.state() else {
            panic!("expected a session");
        };
        drop(reader);
        drop(write);

        let (mut reader, _write, _) = accept_and_ack(&listener).await;
        let mut state_rx = client.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            state_rx.wait_for(|s| matches!(s, ConnectionState::Connected { cycle, .. } if *cycle != first)),
        )
        .await
        .unwrap()
        .unwrap();

        // A send that read the old session's state just before it was lost
        client.enqueue(first, Message::Ping { timestamp: Some(1.0) }).unwrap();
        client.send(Message::Ping { timestamp: Some(2.0) }).unwrap();

        let record: Message = reader.next_record().await.unwrap().unwrap();
        assert_eq!(record, Message::Ping { timestamp: Some(2.0) });

        client.shutdown();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pass_waits_fixed_delay() {
        // Nothing listens on this port once the listener is dropped
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = ClientConfig {
            retry_delay_secs: 5,
            connect_timeout_ms: 200,
            ..config(vec!["127.0.0.1".to_string()], port)
        };
        let (client, task) = ClientRuntime::new(config, Arc::new(Collect::default())).spawn();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(client.cycles(), 1);
        assert!(!client.is_connected());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(client.cycles(), 2);

        tokio::time::sleep(Duration::from_secs(15)).await;
        let cycles = client.cycles();
        assert!((4..=5).contains(&cycles), "{cycles} cycles after 21s");

        client.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rejected_ack_is_a_failed_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handler = Arc::new(Collect::default());
        let (client, task) = ClientRuntime::new(config(vec!["127.0.0.1".to_string()], port), handler).spawn();

        let (stream, _) = listener.accept().await.unwrap();
        let (_read, mut write) = stream.into_split();
        write.write_all(b"{\"status\":\"ERROR\",\"message\":\"no\",\"timestamp\":0}\n").await.unwrap();

        // Rejection is followed by another cycle against the same host
        let (_again, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert!(!client.is_connected());
        assert!(client.cycles() >= 2);

        client.shutdown();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
