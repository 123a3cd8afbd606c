//! Typed domain error kinds, one enum per engine.
//!
//! None of these ever abort a batch or a continuous stream on their own —
//! callers fold them into the domain result types (`ProbeResult::status`,
//! `PingSample::error_kind`). They exist so the *kind* of failure is
//! nameable and so the broker's connection-level failures have a single
//! place to live.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid target: {0}")]
    Validation(String),
    #[error("probe timed out")]
    Timeout,
    #[error("connection refused")]
    Refused,
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PingError {
    #[error("invalid target: {0}")]
    Validation(String),
    #[error("name resolution failed: {0}")]
    NameResolution(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("probe timed out")]
    Timeout,
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("all probe strategies failed")]
    AllFailed,
    #[error("ping error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("frame decode error: {0}")]
    FrameDecode(String),
    #[error("connection closed by peer")]
    IncompleteRead,
    #[error("client buffer overflow, message dropped")]
    BufferOverflow,
    #[error("not connected")]
    NotConnected,
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("max connections reached")]
    MaxConnectionsReached,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
