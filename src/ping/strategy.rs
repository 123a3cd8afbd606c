//! Ordered ping strategy list: system command first (for TTL), then an
//! unprivileged "library" fallback, then a raw socket last. Mirrors the
//! original's `_ping_once` ordering in `ping_tool.py`.

use std::time::Duration;

use crate::types::PingMethod;

/// One probe attempt's outcome, independent of how it was produced.
pub struct StrategyOutcome {
    pub response_time_ms: f64,
    pub ttl: Option<u8>,
    pub method: PingMethod,
}

/// Distinguishes "this strategy isn't usable in this environment" (skip,
/// try the next one) from "this strategy ran and got no reply" (a real
/// failure worth recording if every strategy exhausts).
pub enum StrategyError {
    Unavailable(String),
    Failed(String),
}

pub struct StrategyAttempt {
    pub method: PingMethod,
}

/// The fixed precedence: system command, then library fallback, then raw
/// socket. Raw sockets need elevated privileges on most platforms, so they
/// sort last even though they're the most informative when available.
pub fn ordered_strategies(use_raw_socket: bool, use_library_fallback: bool) -> Vec<StrategyAttempt> {
    let mut v = vec![StrategyAttempt {
        method: PingMethod::SystemCommand,
    }];
    if use_library_fallback {
        v.push(StrategyAttempt {
            method: PingMethod::LibraryFallback,
        });
    }
    if use_raw_socket {
        v.push(StrategyAttempt {
            method: PingMethod::RawSocket,
        });
    }
    v
}

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
