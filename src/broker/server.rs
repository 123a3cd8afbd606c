//! TCP Messaging Broker — the server side. Semaphore-bounded accept
//! loop, per-connection message dispatch, and idle-session eviction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::frame::{read_frame, validate_message, write_frame};
use crate::error::BrokerError;
use crate::types::{now_epoch_secs, new_id, BrokerMessage, BrokerSessionInfo, MessageType, SessionStatus};

#[derive(Debug, Clone)]
pub struct BrokerServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub client_timeout: Duration,
    pub keep_message_history: bool,
    pub max_history_size: usize,
}

impl Default for BrokerServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            max_connections: 1000,
            client_timeout: Duration::from_secs_f64(300.0),
            keep_message_history: true,
            max_history_size: 1000,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BrokerServerStats {
    pub total_connections: u64,
    pub current_connections: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub uptime_s: f64,
}

impl BrokerServerStats {
    pub fn messages_per_second(&self) -> f64 {
        if self.uptime_s <= 0.0 {
            0.0
        } else {
            self.messages_received as f64 / self.uptime_s
        }
    }

    pub fn bytes_per_second(&self) -> f64 {
        if self.uptime_s <= 0.0 {
            0.0
        } else {
            self.bytes_received as f64 / self.uptime_s
        }
    }
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    current_connections: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    errors: AtomicU64,
}

struct Session {
    info: BrokerSessionInfo,
    outbox: mpsc::Sender<BrokerMessage>,
}

pub struct BrokerServer {
    config: BrokerServerConfig,
    sessions: RwLock<HashMap<String, Session>>,
    history: RwLock<Vec<BrokerMessage>>,
    counters: Counters,
    shutdown: CancellationToken,
    started_at: Instant,
}

impl BrokerServer {
    pub fn new(config: BrokerServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            counters: Counters::default(),
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        })
    }

    /// Bind and start serving. Returns the bound port (useful when
    /// `config.port == 0`) once the listener is up; the accept loop and
    /// idle-eviction task keep running in the background until `stop`.
    pub async fn serve(self: &Arc<Self>) -> Result<u16, BrokerError> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(BrokerError::Io)?;
        let actual_port = listener.local_addr().map_err(BrokerError::Io)?.port();

        let this = self.clone();
        tokio::spawn(async move { this.accept_loop(listener).await });

        let this = self.clone();
        tokio::spawn(async move { this.evict_idle_loop().await });

        Ok(actual_port)
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub async fn stats(&self) -> BrokerServerStats {
        BrokerServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            current_connections: self.counters.current_connections.load(Ordering::Relaxed),
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            uptime_s: self.started_at.elapsed().as_secs_f64(),
        }
    }

    pub async fn list_sessions(&self) -> Vec<BrokerSessionInfo> {
        self.sessions.read().await.values().map(|s| s.info.clone()).collect()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut backoff = Duration::from_secs(1);
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let current = self.counters.current_connections.load(Ordering::Relaxed) as usize;
            if current >= self.config.max_connections {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }

            let accepted = tokio::select! {
                r = listener.accept() => r,
                _ = self.shutdown.cancelled() => break,
            };

            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(64));
                    continue;
                }
            };
            backoff = Duration::from_secs(1);

            self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
            self.counters.current_connections.fetch_add(1, Ordering::Relaxed);

            let this = self.clone();
            tokio::spawn(async move {
                let conn_this = this.clone();
                conn_this.handle_connection(stream, peer_addr.to_string()).await;
                this.counters.current_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
        self.disconnect_all().await;
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer_addr: String) {
        let client_id = new_id();
        let (outbox_tx, mut outbox_rx) = mpsc::channel::<BrokerMessage>(64);
        let (mut reader, mut writer) = tokio::io::split(stream);

        let info = BrokerSessionInfo {
            client_id: client_id.clone(),
            peer_addr: peer_addr.clone(),
            connected_at: now_epoch_secs(),
            last_activity: now_epoch_secs(),
            status: SessionStatus::Connected,
            username: None,
        };
        self.sessions.write().await.insert(
            client_id.clone(),
            Session {
                info,
                outbox: outbox_tx.clone(),
            },
        );
        info!(client_id = %client_id, peer_addr = %peer_addr, "client connected");

        let welcome = BrokerMessage::system("connected").with_target(client_id.clone());
        let _ = write_frame(&mut writer, &welcome).await;

        let shutdown = self.shutdown.clone();
        let writer_this = self.clone();
        let write_task = tokio::spawn(async move {
            while let Some(msg) = outbox_rx.recv().await {
                if write_frame(&mut writer, &msg).await.is_err() {
                    break;
                }
                writer_this.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            let _ = writer.shutdown().await;
        });

        loop {
            let frame = tokio::select! {
                f = read_frame(&mut reader) => f,
                _ = shutdown.cancelled() => break,
            };

            match frame {
                Ok(Some(message)) => {
                    self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
                    self.touch(&client_id).await;
                    if let Err(e) = validate_message(&message) {
                        self.counters.errors.fetch_add(1, Ordering::Relaxed);
                        let _ = outbox_tx
                            .send(BrokerMessage::new(MessageType::Error, e.to_string()))
                            .await;
                        continue;
                    }
                    self.dispatch(&client_id, message).await;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(client_id = %client_id, error = %e, "frame read error");
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
        }

        drop(outbox_tx);
        let _ = write_task.await;
        self.sessions.write().await.remove(&client_id);
        info!(client_id = %client_id, "client disconnected");
    }

    async fn touch(&self, client_id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(client_id) {
            session.info.last_activity = now_epoch_secs();
        }
    }

    async fn dispatch(&self, sender_id: &str, message: BrokerMessage) {
        if self.config.keep_message_history {
            let mut history = self.history.write().await;
            history.push(message.clone());
            let cap = self.config.max_history_size;
            if history.len() > cap {
                let excess = history.len() - cap;
                history.drain(0..excess);
            }
        }

        match message.kind {
            MessageType::Heartbeat => {
                let sessions = self.sessions.read().await;
                if let Some(s) = sessions.get(sender_id) {
                    let _ = s.outbox.send(BrokerMessage::heartbeat()).await;
                }
            }
            MessageType::Private => {
                let Some(target) = message.target.clone() else {
                    return;
                };
                let sessions = self.sessions.read().await;
                if let Some(s) = sessions.get(&target) {
                    let _ = s.outbox.send(message.with_sender(sender_id.to_string())).await;
                }
            }
            MessageType::Broadcast | MessageType::Chat => {
                let sessions = self.sessions.read().await;
                let outgoing = message.with_sender(sender_id.to_string());
                for s in sessions.values() {
                    let _ = s.outbox.send(outgoing.clone()).await;
                }
            }
            MessageType::Connect | MessageType::Disconnect | MessageType::System | MessageType::Error => {
                // Client-originated control messages are acknowledged by
                // the dispatch above (history) and otherwise dropped.
            }
        }
    }

    async fn evict_idle_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.shutdown.cancelled() => return,
            }
            let now = now_epoch_secs();
            let stale: Vec<String> = self
                .sessions
                .read()
                .await
                .iter()
                .filter(|(_, s)| now - s.info.last_activity > self.config.client_timeout.as_secs_f64())
                .map(|(id, _)| id.clone())
                .collect();
            for id in stale {
                if let Some(session) = self.sessions.write().await.remove(&id) {
                    warn!(client_id = %id, "evicting idle session");
                    drop(session);
                }
            }
        }
    }

    async fn disconnect_all(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, session) in sessions.drain() {
            drop(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::client::{BrokerClient, ConnectionConfig};
    use crate::types::MessageType;

    #[tokio::test]
    async fn accepts_connection_and_sends_welcome() {
        let server = BrokerServer::new(BrokerServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..BrokerServerConfig::default()
        });
        let port = server.serve().await.unwrap();

        let client = BrokerClient::new(ConnectionConfig {
            server_host: "127.0.0.1".to_string(),
            server_port: port,
            ..ConnectionConfig::default()
        });
        client.connect().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 1);
        server.stop();
    }

    #[tokio::test]
    async fn broadcast_reaches_sender_and_other_clients() {
        let server = BrokerServer::new(BrokerServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..BrokerServerConfig::default()
        });
        let port = server.serve().await.unwrap();

        let a = BrokerClient::new(ConnectionConfig {
            server_host: "127.0.0.1".to_string(),
            server_port: port,
            ..ConnectionConfig::default()
        });
        let b = BrokerClient::new(ConnectionConfig {
            server_host: "127.0.0.1".to_string(),
            server_port: port,
            ..ConnectionConfig::default()
        });
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        // drain each client's connection-welcome frame first
        tokio::time::timeout(Duration::from_secs(2), a.recv()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), b.recv()).await.unwrap();

        a.send(BrokerMessage::new(MessageType::Broadcast, "hello all"))
            .await
            .unwrap();

        let a_received = tokio::time::timeout(Duration::from_secs(2), a.recv())
            .await
            .unwrap()
            .unwrap();
        let b_received = tokio::time::timeout(Duration::from_secs(2), b.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(a_received.content, "hello all");
        assert_eq!(b_received.content, "hello all");
        server.stop();
    }
}
