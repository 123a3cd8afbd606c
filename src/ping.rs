//! Ping Engine — ordered-strategy ICMP probing, statistics, and
//! connection-quality assessment, built on `tokio::time::timeout` and
//! `tokio_util::sync::CancellationToken` for every timeout/cancellation
//! need.

pub mod icmp;
pub mod strategy;
pub mod system;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::{
    ConnectionQuality, NetworkPathAnalysis, PingErrorKind, PingMethod, PingSample,
    PingStatistics, QualityRating, RouteStability,
};
use strategy::{ordered_strategies, StrategyError};

/// `(completed, total)` progress callback for a counted `ping_host` run.
pub type ProgressCallback = std::sync::Arc<dyn Fn(usize, usize) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PingEngineConfig {
    pub packet_size: usize,
    pub timeout: Duration,
    pub interval: Duration,
    pub use_raw_socket: bool,
    pub use_library_fallback: bool,
    /// Keep a per-host ring of recent samples for `get_ping_history`.
    pub keep_history: bool,
    pub max_history_per_host: usize,
}

impl Default for PingEngineConfig {
    fn default() -> Self {
        Self {
            packet_size: 64,
            timeout: Duration::from_secs_f64(5.0),
            interval: Duration::from_secs_f64(1.0),
            use_raw_socket: false,
            use_library_fallback: true,
            keep_history: false,
            max_history_per_host: 100,
        }
    }
}

/// Hostnames whose continuous-ping timeout is bumped to 8s, matching the
/// original's special-casing of a few high-latency-prone destinations.
const SLOW_HOST_HINTS: &[&str] = &["google", "youtube", "facebook", "twitter"];
const CONTINUOUS_SLICE: Duration = Duration::from_millis(100);

pub struct PingEngine {
    config: PingEngineConfig,
    history: Mutex<HashMap<String, Vec<PingSample>>>,
    sequence: AtomicU64,
}

impl PingEngine {
    pub fn new(config: PingEngineConfig) -> Self {
        Self {
            config,
            history: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Ping `host` once, or `count` times if given, waiting `interval`
    /// between attempts. Never raises: validation and name-resolution
    /// failures are folded into a single failure sample instead of
    /// aborting the batch, matching `continuous_ping`.
    pub async fn ping_host(
        &self,
        host: &str,
        count: Option<u32>,
        progress: Option<ProgressCallback>,
    ) -> Vec<PingSample> {
        let total = count.unwrap_or(1).max(1) as usize;

        if host.trim().is_empty() {
            let sample = PingSample::failure(
                host,
                None,
                self.config.packet_size,
                self.next_sequence(),
                PingErrorKind::Error,
                "host must not be empty".to_string(),
                PingMethod::AllFailed,
            );
            self.record_history(host, sample.clone()).await;
            if let Some(cb) = progress.as_ref() {
                cb(1, total);
            }
            return vec![sample];
        }

        let resolved = match resolve_host(host).await {
            Ok(ip) => ip,
            Err(msg) => {
                let sample = PingSample::failure(
                    host,
                    None,
                    self.config.packet_size,
                    self.next_sequence(),
                    PingErrorKind::NameResolution,
                    msg,
                    PingMethod::AllFailed,
                );
                self.record_history(host, sample.clone()).await;
                if let Some(cb) = progress.as_ref() {
                    cb(1, total);
                }
                return vec![sample];
            }
        };

        let mut samples = Vec::with_capacity(total);

        for i in 0..total {
            if i > 0 {
                time::sleep(self.config.interval).await;
            }
            let sample = self.probe_once(host, resolved, self.config.timeout).await;
            self.record_history(host, sample.clone()).await;
            samples.push(sample);
            if let Some(cb) = progress.as_ref() {
                cb(i + 1, total);
            }
        }

        samples
    }

    /// Ping `host` repeatedly until `duration` elapses or `cancel` fires,
    /// invoking `on_sample` for each result. Stops after one error sample
    /// if name resolution fails outright.
    pub async fn continuous_ping<F: FnMut(PingSample)>(
        &self,
        host: &str,
        duration: Option<Duration>,
        cancel: CancellationToken,
        mut on_sample: F,
    ) {
        let effective_timeout = if SLOW_HOST_HINTS.iter().any(|h| host.to_lowercase().contains(h))
        {
            Duration::from_secs_f64(8.0)
        } else {
            self.config.timeout
        };

        let resolved = match resolve_host(host).await {
            Ok(ip) => ip,
            Err(msg) => {
                let sample = PingSample::failure(
                    host,
                    None,
                    self.config.packet_size,
                    self.next_sequence(),
                    PingErrorKind::NameResolution,
                    msg,
                    PingMethod::AllFailed,
                );
                self.record_history(host, sample.clone()).await;
                on_sample(sample);
                return;
            }
        };

        let deadline = duration.map(|d| time::Instant::now() + d);

        loop {
            if cancel.is_cancelled() {
                return;
            }
            if let Some(d) = deadline {
                if time::Instant::now() >= d {
                    return;
                }
            }

            let sample = self.probe_once(host, resolved, effective_timeout).await;
            self.record_history(host, sample.clone()).await;
            on_sample(sample);

            let mut waited = Duration::ZERO;
            while waited < self.config.interval {
                if cancel.is_cancelled() {
                    return;
                }
                if let Some(d) = deadline {
                    if time::Instant::now() >= d {
                        return;
                    }
                }
                let slice = CONTINUOUS_SLICE.min(self.config.interval - waited);
                time::sleep(slice).await;
                waited += slice;
            }
        }
    }

    async fn probe_once(&self, host: &str, resolved: IpAddr, timeout: Duration) -> PingSample {
        let sequence = self.next_sequence();
        let strategies = ordered_strategies(self.config.use_raw_socket, self.config.use_library_fallback);
        let mut last_error = String::new();

        for attempt in strategies {
            let outcome = match attempt.method {
                PingMethod::SystemCommand => system::ping_once_system(host, timeout).await,
                PingMethod::LibraryFallback => {
                    icmp::ping_once_dgram(resolved, sequence as u16, self.config.packet_size, timeout)
                        .await
                }
                PingMethod::RawSocket => {
                    icmp::ping_once_raw(resolved, sequence as u16, self.config.packet_size, timeout)
                        .await
                }
                PingMethod::AllFailed => unreachable!("AllFailed is never a strategy choice"),
            };

            match outcome {
                Ok(o) => {
                    return PingSample::success(
                        host,
                        Some(resolved.to_string()),
                        o.response_time_ms,
                        o.ttl,
                        self.config.packet_size,
                        sequence,
                        o.method,
                    )
                }
                Err(StrategyError::Unavailable(msg)) => {
                    debug!(strategy = ?attempt.method, %msg, "ping strategy unavailable, trying next");
                    last_error = msg;
                }
                Err(StrategyError::Failed(msg)) => {
                    last_error = msg;
                }
            }
        }

        warn!(host, %last_error, "all ping strategies failed");
        PingSample::failure(
            host,
            Some(resolved.to_string()),
            self.config.packet_size,
            sequence,
            PingErrorKind::Error,
            last_error,
            PingMethod::AllFailed,
        )
    }

    async fn record_history(&self, host: &str, sample: PingSample) {
        if !self.config.keep_history {
            return;
        }
        let mut history = self.history.lock().await;
        let entry = history.entry(host.to_string()).or_default();
        entry.push(sample);
        let cap = self.config.max_history_per_host;
        if entry.len() > cap {
            let excess = entry.len() - cap;
            entry.drain(0..excess);
        }
    }

    /// Snapshot of recent samples for `host`, empty unless `keep_history`
    /// is enabled.
    pub async fn get_ping_history(&self, host: &str) -> Vec<PingSample> {
        self.history
            .lock()
            .await
            .get(host)
            .cloned()
            .unwrap_or_default()
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }
}

async fn resolve_host(host: &str) -> Result<IpAddr, String> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let addr = format!("{host}:0");
    let result = match tokio::net::lookup_host(&addr).await {
        Ok(mut it) => it
            .next()
            .map(|sa| sa.ip())
            .ok_or_else(|| format!("no addresses found for {host}")),
        Err(e) => Err(e.to_string()),
    };
    result
}

/// Aggregate statistics over one batch of samples. Every field defaults
/// to zero when there are no successful samples, matching
/// `PingStatistics.get_statistics()` in the original.
pub fn calculate_statistics(samples: &[PingSample], duration_s: f64) -> PingStatistics {
    let sent = samples.len() as u64;
    let successes: Vec<f64> = samples
        .iter()
        .filter(|s| s.success)
        .filter_map(|s| s.response_time_ms)
        .collect();
    let received = successes.len() as u64;

    let packet_loss_pct = if sent == 0 {
        0.0
    } else {
        (sent - received) as f64 / sent as f64 * 100.0
    };

    if successes.is_empty() {
        return PingStatistics {
            packets_sent: sent,
            packets_received: received,
            packet_loss_pct,
            duration_s,
            ..PingStatistics::default()
        };
    }

    let min_ms = successes.iter().cloned().fold(f64::INFINITY, f64::min);
    let max_ms = successes.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let avg_ms = successes.iter().sum::<f64>() / successes.len() as f64;
    let variance =
        successes.iter().map(|v| (v - avg_ms).powi(2)).sum::<f64>() / successes.len() as f64;
    let std_dev_ms = variance.sqrt();
    let jitter_ms = calculate_jitter(&successes);

    PingStatistics {
        packets_sent: sent,
        packets_received: received,
        packet_loss_pct,
        min_ms,
        max_ms,
        avg_ms,
        std_dev_ms,
        jitter_ms,
        duration_s,
    }
}

/// Mean of the absolute differences between consecutive response times.
/// Zero when fewer than two samples are present.
pub fn calculate_jitter(response_times_ms: &[f64]) -> f64 {
    if response_times_ms.len() < 2 {
        return 0.0;
    }
    let diffs: Vec<f64> = response_times_ms
        .windows(2)
        .map(|w| (w[1] - w[0]).abs())
        .collect();
    diffs.iter().sum::<f64>() / diffs.len() as f64
}

/// Score-then-bucket connection quality. Starts at 100 and is penalized
/// by packet loss, high average latency, and jitter; clamped to `[0,100]`.
pub fn assess_connection_quality(stats: &PingStatistics) -> ConnectionQuality {
    let mut score = 100.0_f64;
    score -= stats.packet_loss_pct * 2.0;
    if stats.avg_ms > 100.0 {
        score -= (stats.avg_ms - 100.0) / 10.0;
    }
    score -= stats.jitter_ms / 5.0;
    let score = score.clamp(0.0, 100.0);

    let rating = if score >= 90.0 {
        QualityRating::Excellent
    } else if score >= 75.0 {
        QualityRating::Good
    } else if score >= 60.0 {
        QualityRating::Fair
    } else if score >= 30.0 {
        QualityRating::Poor
    } else {
        QualityRating::Bad
    };

    ConnectionQuality {
        rating,
        score,
        packet_loss_pct: stats.packet_loss_pct,
        avg_response_time_ms: stats.avg_ms,
        jitter_ms: stats.jitter_ms,
    }
}

/// Summarize TTL behavior across a batch of samples: one TTL seen means a
/// stable route, up to three distinct TTLs means minor variation, more
/// than that is flagged unstable.
pub fn analyze_network_path(samples: &[PingSample]) -> NetworkPathAnalysis {
    let mut distinct: Vec<u8> = Vec::new();
    for s in samples.iter().filter(|s| s.success) {
        if let Some(ttl) = s.ttl {
            if !distinct.contains(&ttl) {
                distinct.push(ttl);
            }
        }
    }

    let route_stability = match distinct.len() {
        0 => RouteStability::Unknown,
        1 => RouteStability::Stable,
        2..=3 => RouteStability::MinorVariations,
        _ => RouteStability::Unstable,
    };

    NetworkPathAnalysis {
        potential_routing_changes: distinct.len() > 1,
        ttl_variations: distinct,
        route_stability,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ms: f64, ttl: Option<u8>) -> PingSample {
        PingSample::success("h", None, ms, ttl, 64, 0, PingMethod::SystemCommand)
    }

    fn failed() -> PingSample {
        PingSample::failure(
            "h",
            None,
            64,
            0,
            PingErrorKind::Timeout,
            "timed out",
            PingMethod::AllFailed,
        )
    }

    #[test]
    fn statistics_zero_default_with_no_successes() {
        let stats = calculate_statistics(&[failed(), failed()], 2.0);
        assert_eq!(stats.packets_sent, 2);
        assert_eq!(stats.packets_received, 0);
        assert_eq!(stats.packet_loss_pct, 100.0);
        assert_eq!(stats.avg_ms, 0.0);
        assert_eq!(stats.jitter_ms, 0.0);
    }

    #[test]
    fn statistics_compute_min_max_avg() {
        let samples = vec![sample(10.0, Some(64)), sample(20.0, Some(64)), sample(30.0, Some(64))];
        let stats = calculate_statistics(&samples, 3.0);
        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.packet_loss_pct, 0.0);
        assert_eq!(stats.min_ms, 10.0);
        assert_eq!(stats.max_ms, 30.0);
        assert_eq!(stats.avg_ms, 20.0);
    }

    #[test]
    fn jitter_needs_at_least_two_samples() {
        assert_eq!(calculate_jitter(&[5.0]), 0.0);
        assert_eq!(calculate_jitter(&[]), 0.0);
        assert_eq!(calculate_jitter(&[10.0, 20.0, 15.0]), ((10.0_f64 + 5.0) / 2.0));
    }

    #[test]
    fn quality_excellent_with_no_loss_low_latency() {
        let stats = PingStatistics {
            packets_sent: 10,
            packets_received: 10,
            packet_loss_pct: 0.0,
            avg_ms: 20.0,
            jitter_ms: 1.0,
            ..PingStatistics::default()
        };
        let q = assess_connection_quality(&stats);
        assert_eq!(q.rating, QualityRating::Excellent);
    }

    #[test]
    fn quality_bad_with_high_loss() {
        let stats = PingStatistics {
            packets_sent: 10,
            packets_received: 2,
            packet_loss_pct: 80.0,
            avg_ms: 20.0,
            jitter_ms: 1.0,
            ..PingStatistics::default()
        };
        let q = assess_connection_quality(&stats);
        assert_eq!(q.rating, QualityRating::Bad);
    }

    #[test]
    fn network_path_stable_with_single_ttl() {
        let samples = vec![sample(1.0, Some(64)), sample(1.0, Some(64))];
        let analysis = analyze_network_path(&samples);
        assert_eq!(analysis.route_stability, RouteStability::Stable);
        assert!(!analysis.potential_routing_changes);
    }

    #[test]
    fn network_path_unstable_with_many_ttls() {
        let samples = vec![
            sample(1.0, Some(60)),
            sample(1.0, Some(61)),
            sample(1.0, Some(62)),
            sample(1.0, Some(63)),
        ];
        let analysis = analyze_network_path(&samples);
        assert_eq!(analysis.route_stability, RouteStability::Unstable);
        assert!(analysis.potential_routing_changes);
    }

    #[tokio::test]
    async fn ping_localhost_succeeds() {
        let engine = PingEngine::new(PingEngineConfig {
            interval: Duration::from_millis(10),
            use_raw_socket: false,
            use_library_fallback: false,
            ..PingEngineConfig::default()
        });
        let samples = engine.ping_host("127.0.0.1", Some(3), None).await;
        assert_eq!(samples.len(), 3);
        assert_eq!(
            samples.iter().map(|s| s.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(samples.iter().all(|s| s.success));
        let stats = calculate_statistics(&samples, 0.03);
        assert_eq!(stats.packets_sent, 3);
        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.packet_loss_pct, 0.0);
    }

    #[tokio::test]
    async fn invalid_hostname_reports_name_resolution_error() {
        let engine = PingEngine::new(PingEngineConfig::default());
        let samples = engine
            .ping_host("this.host.does.not.exist.invalid", Some(1), None)
            .await;
        assert_eq!(samples.len(), 1);
        assert!(!samples[0].success);
        assert_eq!(samples[0].error_kind, PingErrorKind::NameResolution);
    }

    #[tokio::test]
    async fn continuous_ping_stops_on_cancellation() {
        let engine = PingEngine::new(PingEngineConfig {
            interval: Duration::from_millis(50),
            use_raw_socket: false,
            use_library_fallback: false,
            ..PingEngineConfig::default()
        });
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(120)).await;
            cancel_clone.cancel();
        });

        let mut count = 0;
        engine
            .continuous_ping("127.0.0.1", None, cancel, |_sample| {
                count += 1;
            })
            .await;
        assert!(count >= 1);
    }
}
