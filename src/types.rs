//! Shared data model for the scanner, ping, and broker engines.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current epoch-seconds timestamp, used for every wire-facing field that
/// mirrors the original `time.time()` floats.
pub fn now_epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Generate a fresh opaque id (client id, message id, task id).
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------
// Port Scanner
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
    /// Degraded to a short-timeout TCP connect probe when raw sockets are
    /// unavailable.
    Syn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Open,
    Closed,
    Filtered,
    Timeout,
    Error,
}

/// Outcome of probing a single host:port pair.
///
/// Invariant: `response_time_ms` is present iff `status == Open`; `banner`
/// being present implies `status == Open`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub status: ScanStatus,
    pub response_time_ms: Option<f64>,
    pub service_name: Option<String>,
    pub banner: Option<String>,
    pub error_message: Option<String>,
    pub timestamp: f64,
}

impl ProbeResult {
    pub fn open(
        host: impl Into<String>,
        port: u16,
        protocol: Protocol,
        response_time_ms: f64,
        service_name: Option<String>,
        banner: Option<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
            status: ScanStatus::Open,
            response_time_ms: Some(response_time_ms),
            service_name,
            banner,
            error_message: None,
            timestamp: now_epoch_secs(),
        }
    }

    pub fn non_open(
        host: impl Into<String>,
        port: u16,
        protocol: Protocol,
        status: ScanStatus,
        error_message: Option<String>,
    ) -> Self {
        debug_assert!(status != ScanStatus::Open);
        Self {
            host: host.into(),
            port,
            protocol,
            status,
            response_time_ms: None,
            service_name: None,
            banner: None,
            error_message,
            timestamp: now_epoch_secs(),
        }
    }
}

/// Truncate a banner to `max_bytes`, on a char boundary.
pub fn truncate_banner(mut banner: String, max_bytes: usize) -> String {
    if banner.len() <= max_bytes {
        return banner;
    }
    let mut end = max_bytes;
    while end > 0 && !banner.is_char_boundary(end) {
        end -= 1;
    }
    banner.truncate(end);
    banner
}

// ---------------------------------------------------------------------
// Ping Engine
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PingErrorKind {
    Timeout,
    Unreachable,
    NameResolution,
    PermissionDenied,
    Error,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PingMethod {
    RawSocket,
    LibraryFallback,
    SystemCommand,
    AllFailed,
}

/// Outcome of one ICMP probe.
///
/// Invariant: `success == true` implies `response_time_ms` is present and
/// `error_kind == PingErrorKind::None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingSample {
    pub host: String,
    pub resolved_ip: Option<String>,
    pub success: bool,
    pub response_time_ms: Option<f64>,
    pub ttl: Option<u8>,
    pub packet_size: usize,
    pub sequence: u64,
    pub timestamp: f64,
    pub error_kind: PingErrorKind,
    pub error_message: Option<String>,
    pub method: PingMethod,
}

impl PingSample {
    pub fn success(
        host: impl Into<String>,
        resolved_ip: Option<String>,
        response_time_ms: f64,
        ttl: Option<u8>,
        packet_size: usize,
        sequence: u64,
        method: PingMethod,
    ) -> Self {
        Self {
            host: host.into(),
            resolved_ip,
            success: true,
            response_time_ms: Some(response_time_ms),
            ttl,
            packet_size,
            sequence,
            timestamp: now_epoch_secs(),
            error_kind: PingErrorKind::None,
            error_message: None,
            method,
        }
    }

    pub fn failure(
        host: impl Into<String>,
        resolved_ip: Option<String>,
        packet_size: usize,
        sequence: u64,
        error_kind: PingErrorKind,
        error_message: impl Into<String>,
        method: PingMethod,
    ) -> Self {
        Self {
            host: host.into(),
            resolved_ip,
            success: false,
            response_time_ms: None,
            ttl: None,
            packet_size,
            sequence,
            timestamp: now_epoch_secs(),
            error_kind,
            error_message: Some(error_message.into()),
            method,
        }
    }
}

/// Derived statistics over a batch of `PingSample`s.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct PingStatistics {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packet_loss_pct: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub std_dev_ms: f64,
    pub jitter_ms: f64,
    pub duration_s: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityRating {
    Excellent,
    Good,
    Fair,
    Poor,
    Bad,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConnectionQuality {
    pub rating: QualityRating,
    pub score: f64,
    pub packet_loss_pct: f64,
    pub avg_response_time_ms: f64,
    pub jitter_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStability {
    Unknown,
    Stable,
    MinorVariations,
    Unstable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkPathAnalysis {
    pub route_stability: RouteStability,
    pub ttl_variations: Vec<u8>,
    pub potential_routing_changes: bool,
}

// ---------------------------------------------------------------------
// Task bookkeeping (owned by the Session Registry)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanTask {
    pub id: String,
    pub targets: Vec<String>,
    pub ports: Vec<u16>,
    pub protocol: Protocol,
    pub status: TaskStatus,
    pub progress: f64,
    pub scanned: u64,
    pub found: u64,
    pub started_at: f64,
    pub completed_at: Option<f64>,
    pub error: Option<String>,
    #[serde(skip)]
    pub results: Vec<ProbeResult>,
}

impl ScanTask {
    pub fn new(targets: Vec<String>, ports: Vec<u16>, protocol: Protocol) -> Self {
        Self {
            id: new_id(),
            targets,
            ports,
            protocol,
            status: TaskStatus::Pending,
            progress: 0.0,
            scanned: 0,
            found: 0,
            started_at: now_epoch_secs(),
            completed_at: None,
            error: None,
            results: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingTask {
    pub id: String,
    pub target: String,
    pub status: TaskStatus,
    pub interval_s: f64,
    pub last_ping_at: Option<f64>,
    pub total: u64,
    pub success: u64,
    pub quality: Option<ConnectionQuality>,
}

impl PingTask {
    pub fn new(target: impl Into<String>, interval_s: f64) -> Self {
        Self {
            id: new_id(),
            target: target.into(),
            status: TaskStatus::Pending,
            interval_s,
            last_ping_at: None,
            total: 0,
            success: 0,
            quality: None,
        }
    }
}

// ---------------------------------------------------------------------
// TCP Broker
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSessionInfo {
    pub client_id: String,
    pub peer_addr: String,
    pub connected_at: f64,
    pub last_activity: f64,
    pub status: SessionStatus,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Chat,
    Broadcast,
    Private,
    System,
    Heartbeat,
    Connect,
    Disconnect,
    Error,
}

/// Wire message: `u32` big-endian length prefix + UTF-8 JSON body.
///
/// Invariant: `Private` requires `target`; `Broadcast` ignores `target`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default = "now_epoch_secs")]
    pub timestamp: f64,
    #[serde(default = "new_id")]
    pub message_id: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl BrokerMessage {
    pub fn new(kind: MessageType, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            sender: None,
            target: None,
            timestamp: now_epoch_secs(),
            message_id: new_id(),
            metadata: HashMap::new(),
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageType::Heartbeat, "ping")
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageType::System, content)
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Urgent = 4,
}

/// Client-side outbound message awaiting delivery.
///
/// Ordered by `(priority desc, insertion_order asc)`.
#[derive(Debug, Clone)]
pub struct BufferedClientMessage {
    pub message: BrokerMessage,
    pub priority: MessagePriority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub insertion_order: u64,
}

impl BufferedClientMessage {
    pub fn new(message: BrokerMessage, priority: MessagePriority, insertion_order: u64) -> Self {
        Self {
            message,
            priority,
            retry_count: 0,
            max_retries: 3,
            insertion_order,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_result_open_invariant() {
        let r = ProbeResult::open("127.0.0.1", 80, Protocol::Tcp, 1.5, None, None);
        assert_eq!(r.status, ScanStatus::Open);
        assert!(r.response_time_ms.is_some());
    }

    #[test]
    fn probe_result_non_open_has_no_timing() {
        let r = ProbeResult::non_open("127.0.0.1", 80, Protocol::Tcp, ScanStatus::Closed, None);
        assert!(r.response_time_ms.is_none());
        assert!(r.banner.is_none());
    }

    #[test]
    fn truncate_banner_respects_char_boundaries() {
        let banner = "a".repeat(2000);
        let truncated = truncate_banner(banner, 1024);
        assert_eq!(truncated.len(), 1024);
    }

    #[test]
    fn broker_message_round_trips_through_json() {
        let msg = BrokerMessage::new(MessageType::Chat, "hello").with_sender("alice");
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: BrokerMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.kind, MessageType::Chat);
        assert_eq!(decoded.content, "hello");
        assert_eq!(decoded.sender.as_deref(), Some("alice"));
    }
}
