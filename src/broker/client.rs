//! TCP Messaging Broker — the client side. Connect/reconnect lifecycle,
//! a priority-ordered outbound buffer, and a heartbeat loop. Ported from
//! `TCPClient` / `ConnectionConfig` / `ClientMessage` in the original
//! `tcp_client.py`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::WriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::frame::{read_frame, write_frame};
use crate::error::BrokerError;
use crate::types::{BufferedClientMessage, BrokerMessage, MessagePriority};

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub server_host: String,
    pub server_port: u16,
    pub connect_timeout: Duration,
    pub auto_reconnect: bool,
    pub reconnect_interval: Duration,
    /// `<= 0` means unlimited, matching the original's `-1` sentinel.
    pub max_reconnect_attempts: i64,
    pub heartbeat_interval: Duration,
    pub enable_message_buffering: bool,
    pub max_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            connect_timeout: Duration::from_secs_f64(10.0),
            auto_reconnect: true,
            reconnect_interval: Duration::from_secs_f64(5.0),
            max_reconnect_attempts: -1,
            heartbeat_interval: Duration::from_secs_f64(30.0),
            enable_message_buffering: true,
            max_buffer_size: 1000,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BrokerClientStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub reconnect_attempts: u64,
    pub messages_dropped: u64,
}

struct Counters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    reconnect_attempts: AtomicU64,
    messages_dropped: AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

struct Connection {
    writer: WriteHalf<TcpStream>,
    reader_task: tokio::task::JoinHandle<()>,
}

pub struct BrokerClient {
    config: ConnectionConfig,
    connection: Mutex<Option<Connection>>,
    buffer: Mutex<VecDeque<BufferedClientMessage>>,
    inbox: (mpsc::Sender<BrokerMessage>, Mutex<mpsc::Receiver<BrokerMessage>>),
    counters: Counters,
    insertion_counter: AtomicU64,
    shutdown: CancellationToken,
}

impl BrokerClient {
    pub fn new(config: ConnectionConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(256);
        Arc::new(Self {
            config,
            connection: Mutex::new(None),
            buffer: Mutex::new(VecDeque::new()),
            inbox: (tx, Mutex::new(rx)),
            counters: Counters::default(),
            insertion_counter: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    pub async fn connect(self: &Arc<Self>) -> Result<(), BrokerError> {
        let addr = format!("{}:{}", self.config.server_host, self.config.server_port);
        let stream = time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| BrokerError::ConnectTimeout)?
            .map_err(BrokerError::Io)?;

        let (mut reader, writer) = tokio::io::split(stream);
        let inbox_tx = self.inbox.0.clone();
        let this = self.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(msg)) => {
                        this.counters.messages_received.fetch_add(1, Ordering::Relaxed);
                        if inbox_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "broker client read error");
                        break;
                    }
                }
            }
        });

        *self.connection.lock().await = Some(Connection { writer, reader_task });

        let this = self.clone();
        tokio::spawn(async move { this.heartbeat_loop().await });
        if self.config.enable_message_buffering {
            let this = self.clone();
            tokio::spawn(async move { this.drain_buffer_loop().await });
        }

        Ok(())
    }

    pub async fn disconnect(&self) {
        self.shutdown.cancel();
        if let Some(conn) = self.connection.lock().await.take() {
            conn.reader_task.abort();
        }
    }

    /// Send immediately if connected; otherwise buffer (priority desc,
    /// insertion order asc) up to `max_buffer_size`, dropping the oldest
    /// low-priority entry when full.
    pub async fn send(&self, message: BrokerMessage) -> Result<(), BrokerError> {
        self.send_with_priority(message, MessagePriority::Normal).await
    }

    pub async fn send_with_priority(
        &self,
        message: BrokerMessage,
        priority: MessagePriority,
    ) -> Result<(), BrokerError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_mut() {
            if write_frame(&mut conn.writer, &message).await.is_ok() {
                self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            *guard = None;
        }
        drop(guard);

        if !self.config.enable_message_buffering {
            return Err(BrokerError::NotConnected);
        }
        self.buffer_message(message, priority).await
    }

    async fn buffer_message(
        &self,
        message: BrokerMessage,
        priority: MessagePriority,
    ) -> Result<(), BrokerError> {
        let order = self.insertion_counter.fetch_add(1, Ordering::Relaxed);
        let mut buffer = self.buffer.lock().await;
        if buffer.len() >= self.config.max_buffer_size {
            buffer.pop_front();
            self.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
        }
        buffer.push_back(BufferedClientMessage::new(message, priority, order));
        sort_buffer(&mut buffer);
        Ok(())
    }

    async fn drain_buffer_loop(self: Arc<Self>) {
        let mut interval = time::interval(Duration::from_millis(200));
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.shutdown.cancelled() => return,
            }
            loop {
                let next = {
                    let mut buffer = self.buffer.lock().await;
                    buffer.pop_front()
                };
                let Some(mut buffered) = next else { break };

                let mut guard = self.connection.lock().await;
                let Some(conn) = guard.as_mut() else {
                    drop(guard);
                    self.buffer.lock().await.push_front(buffered);
                    break;
                };

                if write_frame(&mut conn.writer, &buffered.message).await.is_ok() {
                    self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                } else {
                    drop(guard);
                    buffered.retry_count += 1;
                    if buffered.retry_count < buffered.max_retries {
                        self.buffer.lock().await.push_front(buffered);
                    } else {
                        self.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    break;
                }
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.shutdown.cancelled() => return,
            }
            let _ = self.send(BrokerMessage::heartbeat()).await;
        }
    }

    /// Reconnect loop, bounded by `max_reconnect_attempts` unless it's
    /// `<= 0` (unlimited). Intended to be driven explicitly by a caller
    /// that noticed a dropped connection.
    pub async fn reconnect_until_bound(self: &Arc<Self>) -> Result<(), BrokerError> {
        let mut attempts: i64 = 0;
        loop {
            if self.config.max_reconnect_attempts > 0 && attempts >= self.config.max_reconnect_attempts {
                return Err(BrokerError::NotConnected);
            }
            attempts += 1;
            self.counters.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(_) => time::sleep(self.config.reconnect_interval).await,
            }
        }
    }

    /// Await the next inbound message.
    pub async fn recv(&self) -> Option<BrokerMessage> {
        self.inbox.1.lock().await.recv().await
    }

    pub fn stats(&self) -> BrokerClientStats {
        BrokerClientStats {
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            reconnect_attempts: self.counters.reconnect_attempts.load(Ordering::Relaxed),
            messages_dropped: self.counters.messages_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Stable sort by priority descending, preserving insertion order for
/// ties — mirrors `self.message_buffer.sort(key=..., reverse=True)` in
/// the original, which is also a stable sort.
fn sort_buffer(buffer: &mut VecDeque<BufferedClientMessage>) {
    let mut items: Vec<BufferedClientMessage> = buffer.drain(..).collect();
    items.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.insertion_order.cmp(&b.insertion_order))
    });
    buffer.extend(items);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BrokerMessage, MessageType};

    fn msg(content: &str) -> BrokerMessage {
        BrokerMessage::new(MessageType::Chat, content)
    }

    #[test]
    fn buffer_orders_by_priority_then_insertion() {
        let mut buffer = VecDeque::new();
        buffer.push_back(BufferedClientMessage::new(msg("low"), MessagePriority::Low, 0));
        buffer.push_back(BufferedClientMessage::new(msg("urgent"), MessagePriority::Urgent, 1));
        buffer.push_back(BufferedClientMessage::new(msg("normal-a"), MessagePriority::Normal, 2));
        buffer.push_back(BufferedClientMessage::new(msg("normal-b"), MessagePriority::Normal, 3));
        sort_buffer(&mut buffer);

        let order: Vec<&str> = buffer.iter().map(|m| m.message.content.as_str()).collect();
        assert_eq!(order, vec!["urgent", "normal-a", "normal-b", "low"]);
    }
}
