//! WebSocket listener: one [`Session`] per accepted connection.
//!
//! The listener binds once and keeps running until stopped. Each connection
//! gets its own session task; the connection loop shuttles decoded frames to
//! the session and the session's outbound frames back to the socket.

use super::{Outbound, SocketCommand, SocketTx};
use crate::client::Connector;
use crate::features::default_listeners;
use crate::session::{Session, SessionConfig};
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, info_span, warn};

/// How long a closing connection waits for its session to release the client.
const SESSION_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Monotonic connection id used to correlate logs for a single socket.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// RAII guard that decrements the connection counter when dropped.
/// Ensures cleanup even if the connection handler panics or returns early.
struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        Self { counter }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        info!(active = prev - 1, "Connection closed");
    }
}

/// The bridge's WebSocket server.
pub struct BridgeServer<C> {
    connector: C,
    config: SessionConfig,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    /// Active connection counter (for diagnostics/logging)
    active_connections: Arc<AtomicUsize>,
}

impl<C: Connector + Clone + 'static> BridgeServer<C> {
    /// Every accepted connection gets a clone of `connector` and `config`.
    pub fn new(connector: C, config: SessionConfig) -> Self {
        Self {
            connector,
            config,
            local_addr: None,
            task: None,
            shutdown_tx: None,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bind `addr` and accept connections in the background. Returns the
    /// bound address (useful with port 0).
    pub async fn start(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        if self.local_addr.is_some() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "Server already running"));
        }

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        info!(addr = %local_addr, "WebSocket server listening");

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let active_connections = self.active_connections.clone();
        let connector = self.connector.clone();
        let config = self.config.clone();
        let task = tokio::spawn(async move {
            let mut shutdown_rx = shutdown_tx.subscribe();

            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            info!(addr = %addr, "New WebSocket connection");
                            let shutdown = shutdown_tx.subscribe();
                            let counter = active_connections.clone();
                            let connector = connector.clone();
                            let config = config.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, connector, config, shutdown, counter).await {
                                    error!(error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    },
                    _ = shutdown_rx.recv() => {
                        info!("Shutting down");
                        break;
                    }
                }
            }
        });

        self.task = Some(task);
        Ok(local_addr)
    }

    /// Stop accepting and close every open connection.
    pub fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.local_addr = None;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }
}

/// Serve one WebSocket connection until either side closes it.
async fn handle_connection<C: Connector + 'static>(
    stream: TcpStream,
    connector: C,
    config: SessionConfig,
    mut shutdown: broadcast::Receiver<()>,
    active_connections: Arc<AtomicUsize>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let connection_started = Instant::now();

    active_connections.fetch_add(1, Ordering::SeqCst);
    let _guard = ConnectionGuard::new(active_connections.clone());

    let ws = accept_async(stream).await?;
    info!(conn_id, "WebSocket connection established");
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (socket, mut outbound) = SocketTx::channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let session = Session::new(connector, socket.clone(), config, default_listeners())
        .with_span(info_span!("session", conn_id));
    let mut session_task = tokio::spawn(session.run(commands_rx));
    let mut session_finished = false;

    loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => match SocketCommand::parse(&text, &socket) {
                    Ok(command) => {
                        debug!(conn_id, event = %command.event, "Socket event");
                        if commands_tx.send(command).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(conn_id, error = %e, "Ignoring malformed frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!(conn_id, "WebSocket closed by client");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    info!(conn_id, error = %e, "WebSocket read error");
                    break;
                }
            },
            out = outbound.recv() => match out {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = ws_tx.send(Message::Text(frame.to_string())).await {
                        info!(conn_id, error = %e, "WebSocket write error");
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    info!(conn_id, "WebSocket closed by session");
                    break;
                }
            },
            result = &mut session_task, if !session_finished => {
                session_finished = true;
                if let Err(e) = result {
                    error!(conn_id, error = %e, "Session task failed");
                }
                break;
            }
            _ = shutdown.recv() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }

    // Closing the command channel ends the session loop, which ends the client.
    drop(commands_tx);
    if !session_finished
        && tokio::time::timeout(SESSION_SHUTDOWN_TIMEOUT, session_task).await.is_err()
    {
        warn!(conn_id, "Session did not shut down in time");
    }
    info!(
        conn_id,
        total_ms = connection_started.elapsed().as_millis() as u64,
        "Connection handling finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryConnector;
    use serde_json::{json, Value};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    // --- ConnectionGuard tests ---

    #[test]
    fn test_connection_guard_decrements_on_drop() {
        let counter = Arc::new(AtomicUsize::new(1));
        {
            let _guard = ConnectionGuard::new(counter.clone());
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_connection_guard_tracks_multiple_connections() {
        let counter = Arc::new(AtomicUsize::new(0));

        counter.fetch_add(1, Ordering::SeqCst);
        let guard1 = ConnectionGuard::new(counter.clone());
        counter.fetch_add(1, Ordering::SeqCst);
        let guard2 = ConnectionGuard::new(counter.clone());
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        drop(guard1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        drop(guard2);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    // --- End-to-end over a real WebSocket ---

    async fn start(connector: &MemoryConnector) -> (BridgeServer<MemoryConnector>, Client) {
        let mut server = BridgeServer::new(connector.clone(), SessionConfig::default());
        let addr = server
            .start("127.0.0.1:0".parse().unwrap())
            .await
            .expect("bind bridge server");
        let (client, _) = connect_async(format!("ws://{}", addr))
            .await
            .expect("connect ws client");
        (server, client)
    }

    async fn send(client: &mut Client, frame: Value) {
        client
            .send(Message::Text(frame.to_string()))
            .await
            .expect("send frame");
    }

    async fn next_message(client: &mut Client) -> Message {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("frame within timeout")
                .expect("socket open")
                .expect("valid frame");
            match msg {
                Message::Ping(_) | Message::Pong(_) => continue,
                other => return other,
            }
        }
    }

    async fn next_json(client: &mut Client) -> Value {
        match next_message(client).await {
            Message::Text(text) => serde_json::from_str(&text).expect("json frame"),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    async fn wait_for_attempts(connector: &MemoryConnector, attempts: usize) {
        for _ in 0..200 {
            if connector.attempts() >= attempts {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} connection attempts", attempts);
    }

    #[tokio::test]
    async fn test_login_online_and_logout_with_ack() {
        let connector = MemoryConnector::new();
        let (mut server, mut client) = start(&connector).await;

        send(
            &mut client,
            json!({"event": "xmpp.login", "data": {"jid": "bob@example.com", "password": "x"}}),
        )
        .await;
        wait_for_attempts(&connector, 1).await;
        connector.clients()[0].online("bob", "example.com", "laptop");

        assert_eq!(
            next_json(&mut client).await,
            json!({"event": "xmpp.connection", "data": {"status": "online", "jid": "bob@example.com/laptop"}})
        );

        send(&mut client, json!({"event": "xmpp.logout", "ack": 1})).await;
        assert_eq!(next_json(&mut client).await, json!({"ack": 1, "data": [null, true]}));
        assert!(connector.clients()[0].is_ended());

        server.stop();
    }

    #[tokio::test]
    async fn test_logout_without_ack_closes_socket() {
        let connector = MemoryConnector::new();
        let (mut server, mut client) = start(&connector).await;

        send(
            &mut client,
            json!({"event": "xmpp.login", "data": {"jid": "bob@example.com", "password": "x"}}),
        )
        .await;
        wait_for_attempts(&connector, 1).await;
        send(&mut client, json!({"event": "xmpp.logout"})).await;
        assert!(matches!(next_message(&mut client).await, Message::Close(_)));

        server.stop();
    }

    #[tokio::test]
    async fn test_malformed_frames_are_ignored() {
        let connector = MemoryConnector::new();
        let (mut server, mut client) = start(&connector).await;

        client
            .send(Message::Text("not json".to_string()))
            .await
            .unwrap();
        send(&mut client, json!({"event": "xmpp.login", "data": {"password": "x"}})).await;
        let frame = next_json(&mut client).await;
        assert_eq!(frame["event"], json!("xmpp.error"));
        assert_eq!(frame["data"]["condition"], json!("client-error"));
        assert_eq!(connector.attempts(), 0);

        server.stop();
    }

    #[tokio::test]
    async fn test_closing_socket_ends_client() {
        let connector = MemoryConnector::new();
        let (mut server, mut client) = start(&connector).await;

        send(
            &mut client,
            json!({"event": "xmpp.login", "data": {"jid": "bob@example.com", "password": "x"}}),
        )
        .await;
        wait_for_attempts(&connector, 1).await;
        client.close(None).await.unwrap();

        for _ in 0..200 {
            if connector.clients()[0].is_ended() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(connector.clients()[0].is_ended());

        server.stop();
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let mut server = BridgeServer::new(MemoryConnector::new(), SessionConfig::default());
        server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(server.start("127.0.0.1:0".parse().unwrap()).await.is_err());
        server.stop();
        assert!(server.local_addr().is_none());
    }
}
