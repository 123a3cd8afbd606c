//! Stream Bridge — pushes live scan/ping progress to subscribers over an
//! `mpsc` channel, with a per-subscriber stop signal a caller can fire
//! independently of the underlying task's own cancellation, plus inbound
//! control messages (`ping`, `stop_ping`, `broadcast`, `private`) a caller
//! forwards in from whatever transport (websocket, broker session, ...) it
//! is bridging.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::ping::PingEngine;
use crate::registry::SessionRegistry;
use crate::scanner::PortScanner;
use crate::types::{new_id, now_epoch_secs, PingErrorKind, PingSample, ProbeResult, Protocol};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ConnectionEstablished { client_id: String, message: String },
    MonitorConnected { client_id: String, message: String },
    PingMonitorConnected { client_id: String, message: String },
    PingResult {
        target: String,
        sequence: u64,
        success: bool,
        status: String,
        response_time: Option<f64>,
        ttl: Option<u8>,
        packet_size: usize,
        timestamp: f64,
        error: Option<String>,
        error_message: Option<String>,
        error_type: String,
    },
    PingError { target: String, error: String, timestamp: f64 },
    Pong { timestamp: f64 },
    ScanStarted {
        task_id: String,
        target: String,
        total_ports: u64,
        scan_type: String,
        timestamp: f64,
    },
    ScanPortFound {
        task_id: String,
        target: String,
        port: u16,
        result: ProbeResult,
        timestamp: f64,
    },
    ScanProgress {
        task_id: String,
        progress: f64,
        current_target: String,
        ports_scanned: u64,
        open_ports_found: u64,
        total_ports: u64,
        total_targets: u64,
        scan_type: String,
        timestamp: f64,
    },
    ScanTargetError { task_id: String, target: String, error: String, timestamp: f64 },
    ScanCompleted {
        task_id: String,
        total_targets: u64,
        total_open_ports: u64,
        scan_type: String,
        timestamp: f64,
    },
    Broadcast { from: String, message: String, timestamp: f64 },
    Private { from: String, message: String, timestamp: f64 },
    Error { message: String },
}

/// Inbound control vocabulary a caller forwards from its transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Ping,
    StopPing,
    Broadcast { content: String },
    Private { target: String, content: String },
}

fn protocol_label(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Tcp => "tcp",
        Protocol::Udp => "udp",
        Protocol::Syn => "syn",
    }
}

/// Maps a ping result onto the coarse status vocabulary subscribers see,
/// defaulting unmapped error kinds to `"timeout"`.
fn ping_status(sample: &PingSample) -> &'static str {
    if sample.success {
        return "success";
    }
    match sample.error_kind {
        PingErrorKind::Timeout | PingErrorKind::Unreachable => "timeout",
        PingErrorKind::NameResolution | PingErrorKind::PermissionDenied => "error",
        PingErrorKind::Error | PingErrorKind::None => "timeout",
    }
}

fn error_kind_label(kind: PingErrorKind) -> &'static str {
    match kind {
        PingErrorKind::Timeout => "timeout",
        PingErrorKind::Unreachable => "unreachable",
        PingErrorKind::NameResolution => "name_resolution",
        PingErrorKind::PermissionDenied => "permission_denied",
        PingErrorKind::Error => "error",
        PingErrorKind::None => "none",
    }
}

pub struct StreamBridge {
    subscribers: RwLock<HashMap<String, mpsc::Sender<StreamEvent>>>,
    stop_signals: RwLock<HashMap<String, CancellationToken>>,
}

impl StreamBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            stop_signals: RwLock::new(HashMap::new()),
        })
    }

    /// Register a new subscriber and return its id plus the receiving end
    /// of its event channel.
    pub async fn subscribe(&self) -> (String, mpsc::Receiver<StreamEvent>) {
        let id = new_id();
        let (tx, rx) = mpsc::channel(256);
        self.subscribers.write().await.insert(id.clone(), tx.clone());
        self.stop_signals
            .write()
            .await
            .insert(id.clone(), CancellationToken::new());
        let _ = tx
            .send(StreamEvent::ConnectionEstablished {
                client_id: id.clone(),
                message: "connection established".to_string(),
            })
            .await;
        (id, rx)
    }

    pub async fn unsubscribe(&self, subscriber_id: &str) {
        if let Some(token) = self.stop_signals.write().await.remove(subscriber_id) {
            token.cancel();
        }
        self.subscribers.write().await.remove(subscriber_id);
    }

    /// Stop a subscriber's active stream without removing its channel, so
    /// it can start a new one.
    pub async fn stop(&self, subscriber_id: &str) {
        if let Some(token) = self.stop_signals.read().await.get(subscriber_id) {
            token.cancel();
        }
        let fresh = CancellationToken::new();
        self.stop_signals.write().await.insert(subscriber_id.to_string(), fresh);
    }

    /// Handle one inbound control message from `subscriber_id`'s transport.
    pub async fn handle_control(&self, subscriber_id: &str, message: ControlMessage) {
        match message {
            ControlMessage::Ping => {
                self.send(subscriber_id, StreamEvent::Pong { timestamp: now_epoch_secs() })
                    .await;
            }
            ControlMessage::StopPing => {
                self.stop(subscriber_id).await;
            }
            ControlMessage::Broadcast { content } => {
                let targets: Vec<String> = self.subscribers.read().await.keys().cloned().collect();
                for target in targets {
                    self.send(
                        &target,
                        StreamEvent::Broadcast {
                            from: subscriber_id.to_string(),
                            message: content.clone(),
                            timestamp: now_epoch_secs(),
                        },
                    )
                    .await;
                }
            }
            ControlMessage::Private { target, content } => {
                let exists = self.subscribers.read().await.contains_key(&target);
                if exists {
                    self.send(
                        &target,
                        StreamEvent::Private {
                            from: subscriber_id.to_string(),
                            message: content,
                            timestamp: now_epoch_secs(),
                        },
                    )
                    .await;
                } else {
                    self.send(
                        subscriber_id,
                        StreamEvent::Error {
                            message: "target client does not exist or is disconnected".to_string(),
                        },
                    )
                    .await;
                }
            }
        }
    }

    async fn token_for(&self, subscriber_id: &str) -> CancellationToken {
        self.stop_signals
            .read()
            .await
            .get(subscriber_id)
            .cloned()
            .unwrap_or_else(CancellationToken::new)
    }

    async fn send(&self, subscriber_id: &str, event: StreamEvent) {
        if let Some(tx) = self.subscribers.read().await.get(subscriber_id) {
            let _ = tx.send(event).await;
        }
    }

    /// Stream ping results to `subscriber_id` until the subscriber's stop
    /// signal fires or `duration` elapses. Every sample, success or
    /// failure, is reported as a `ping_result`; `ping_error` is reserved
    /// for failures of the monitoring loop itself.
    pub async fn stream_ping(
        self: &Arc<Self>,
        subscriber_id: &str,
        registry: &Arc<SessionRegistry>,
        engine: &Arc<PingEngine>,
        target: String,
        duration: Option<Duration>,
    ) {
        let task = crate::types::PingTask::new(target.clone(), engine_interval_secs());
        let task_id = task.id.clone();
        registry.register_ping(task).await;
        let cancel = self.token_for(subscriber_id).await;

        self.send(
            subscriber_id,
            StreamEvent::PingMonitorConnected {
                client_id: subscriber_id.to_string(),
                message: format!("ping monitor connected, target: {target}"),
            },
        )
        .await;

        let this = self.clone();
        let subscriber = subscriber_id.to_string();
        let target_for_cb = target.clone();
        engine
            .continuous_ping(&target, duration, cancel, move |sample: PingSample| {
                let this = this.clone();
                let subscriber = subscriber.clone();
                let target = target_for_cb.clone();
                tokio::spawn(async move {
                    this.send(
                        &subscriber,
                        StreamEvent::PingResult {
                            target,
                            sequence: sample.sequence,
                            success: sample.success,
                            status: ping_status(&sample).to_string(),
                            response_time: sample.response_time_ms,
                            ttl: sample.ttl,
                            packet_size: sample.packet_size,
                            timestamp: sample.timestamp,
                            error: sample.error_message.clone(),
                            error_message: sample.error_message.clone(),
                            error_type: error_kind_label(sample.error_kind).to_string(),
                        },
                    )
                    .await;
                });
            })
            .await;

        registry.remove_ping(&task_id).await;
    }

    /// Stream a scan of `targets` × `ports` to `subscriber_id`, one target
    /// at a time, in batches of at most `max_threads` ports each. Every
    /// batch emits any `scan_port_found` events immediately, followed by
    /// one `scan_progress` event and a 1ms yield before the next batch,
    /// mirroring a synchronous thread-pool scanner driven from an async
    /// event loop.
    pub async fn stream_scan(
        self: &Arc<Self>,
        subscriber_id: &str,
        registry: &Arc<SessionRegistry>,
        scanner: &Arc<PortScanner>,
        targets: Vec<String>,
        ports: Vec<u16>,
        protocol: Protocol,
        max_threads: usize,
    ) {
        let task = crate::types::ScanTask::new(targets.clone(), ports.clone(), protocol);
        let task_id = task.id.clone();
        let cancel = registry.register_scan(task).await;

        self.send(
            subscriber_id,
            StreamEvent::MonitorConnected {
                client_id: subscriber_id.to_string(),
                message: "scan monitor connected".to_string(),
            },
        )
        .await;
        registry.set_scan_status(&task_id, crate::types::TaskStatus::Running).await;

        let scan_type = protocol_label(protocol).to_string();
        let total_targets = targets.len().max(1) as f64;
        let total_ports = ports.len();
        let batch_size = max_threads.max(1).min(total_ports.max(1));
        let mut total_open_ports: u64 = 0;

        for (target_idx, target) in targets.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }

            self.send(
                subscriber_id,
                StreamEvent::ScanStarted {
                    task_id: task_id.clone(),
                    target: target.clone(),
                    total_ports: total_ports as u64,
                    scan_type: scan_type.clone(),
                    timestamp: now_epoch_secs(),
                },
            )
            .await;

            let mut ports_scanned: u64 = 0;
            let mut open_ports_found: u64 = 0;

            for chunk in ports.chunks(batch_size) {
                if cancel.is_cancelled() {
                    break;
                }

                let results = scanner
                    .scan_batch(&[target.clone()], chunk, protocol, cancel.clone(), None)
                    .await;

                for result in &results {
                    registry.push_scan_result(&task_id, result.clone()).await;
                    ports_scanned += 1;
                    match result.status {
                        crate::types::ScanStatus::Open => {
                            open_ports_found += 1;
                            total_open_ports += 1;
                            self.send(
                                subscriber_id,
                                StreamEvent::ScanPortFound {
                                    task_id: task_id.clone(),
                                    target: target.clone(),
                                    port: result.port,
                                    result: result.clone(),
                                    timestamp: now_epoch_secs(),
                                },
                            )
                            .await;
                        }
                        crate::types::ScanStatus::Error => {
                            if let Some(msg) = &result.error_message {
                                self.send(
                                    subscriber_id,
                                    StreamEvent::ScanTargetError {
                                        task_id: task_id.clone(),
                                        target: target.clone(),
                                        error: msg.clone(),
                                        timestamp: now_epoch_secs(),
                                    },
                                )
                                .await;
                            }
                        }
                        _ => {}
                    }
                }

                let target_progress = ports_scanned as f64 / total_ports.max(1) as f64;
                let overall_progress = ((target_idx as f64 + target_progress) / total_targets) * 100.0;
                self.send(
                    subscriber_id,
                    StreamEvent::ScanProgress {
                        task_id: task_id.clone(),
                        progress: overall_progress,
                        current_target: target.clone(),
                        ports_scanned,
                        open_ports_found,
                        total_ports: total_ports as u64,
                        total_targets: targets.len() as u64,
                        scan_type: scan_type.clone(),
                        timestamp: now_epoch_secs(),
                    },
                )
                .await;

                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        registry.set_scan_status(&task_id, crate::types::TaskStatus::Completed).await;
        self.send(
            subscriber_id,
            StreamEvent::ScanCompleted {
                task_id,
                total_targets: targets.len() as u64,
                total_open_ports,
                scan_type,
                timestamp: now_epoch_secs(),
            },
        )
        .await;
    }
}

fn engine_interval_secs() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ping::PingEngineConfig;
    use crate::scanner::ScannerConfig;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn subscribe_sends_connection_established() {
        let bridge = StreamBridge::new();
        let (_id, mut rx) = bridge.subscribe().await;
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, StreamEvent::ConnectionEstablished { .. }));
    }

    #[tokio::test]
    async fn scan_stream_emits_started_and_completed() {
        let bridge = StreamBridge::new();
        let registry = SessionRegistry::new();
        let scanner = Arc::new(PortScanner::new(ScannerConfig {
            timeout: StdDuration::from_millis(200),
            ..ScannerConfig::default()
        }));
        let (id, mut rx) = bridge.subscribe().await;

        bridge
            .stream_scan(
                &id,
                &registry,
                &scanner,
                vec!["127.0.0.1".to_string()],
                vec![1],
                Protocol::Tcp,
                20,
            )
            .await;

        let mut saw_started = false;
        let mut saw_completed = false;
        let mut progress_values = Vec::new();
        while let Ok(event) = tokio::time::timeout(StdDuration::from_millis(500), rx.recv()).await {
            match event {
                Some(StreamEvent::ScanStarted { .. }) => saw_started = true,
                Some(StreamEvent::ScanProgress { progress, .. }) => progress_values.push(progress),
                Some(StreamEvent::ScanCompleted { .. }) => {
                    saw_completed = true;
                    break;
                }
                None => break,
                _ => {}
            }
        }
        assert!(saw_started);
        assert!(saw_completed);
        assert!(progress_values.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress_values.last().copied(), Some(100.0));
    }

    #[tokio::test]
    async fn ping_stream_can_be_stopped_via_bridge() {
        let bridge = StreamBridge::new();
        let registry = SessionRegistry::new();
        let engine = Arc::new(PingEngine::new(PingEngineConfig {
            interval: StdDuration::from_millis(50),
            use_raw_socket: false,
            use_library_fallback: false,
            ..PingEngineConfig::default()
        }));
        let (id, _rx) = bridge.subscribe().await;

        let bridge_clone = bridge.clone();
        let id_clone = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(120)).await;
            bridge_clone.stop(&id_clone).await;
        });

        bridge
            .stream_ping(&id, &registry, &engine, "127.0.0.1".to_string(), None)
            .await;
    }

    #[tokio::test]
    async fn control_ping_replies_with_pong() {
        let bridge = StreamBridge::new();
        let (id, mut rx) = bridge.subscribe().await;
        let _ = rx.recv().await; // drain connection_established

        bridge.handle_control(&id, ControlMessage::Ping).await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, StreamEvent::Pong { .. }));
    }

    #[tokio::test]
    async fn control_broadcast_reaches_every_subscriber_including_sender() {
        let bridge = StreamBridge::new();
        let (a, mut a_rx) = bridge.subscribe().await;
        let (_b, mut b_rx) = bridge.subscribe().await;
        let _ = a_rx.recv().await;
        let _ = b_rx.recv().await;

        bridge
            .handle_control(&a, ControlMessage::Broadcast { content: "hi all".to_string() })
            .await;

        let a_event = a_rx.recv().await.unwrap();
        let b_event = b_rx.recv().await.unwrap();
        assert!(matches!(a_event, StreamEvent::Broadcast { ref message, .. } if message == "hi all"));
        assert!(matches!(b_event, StreamEvent::Broadcast { ref message, .. } if message == "hi all"));
    }

    #[tokio::test]
    async fn control_private_to_unknown_target_reports_error() {
        let bridge = StreamBridge::new();
        let (a, mut a_rx) = bridge.subscribe().await;
        let _ = a_rx.recv().await;

        bridge
            .handle_control(
                &a,
                ControlMessage::Private { target: "no-such-client".to_string(), content: "hi".to_string() },
            )
            .await;

        let event = a_rx.recv().await.unwrap();
        assert!(matches!(event, StreamEvent::Error { .. }));
    }
}
