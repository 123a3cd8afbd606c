//! System `ping` command strategy: shells out to the OS ping, decodes its
//! (possibly localized, possibly non-UTF-8) output, and extracts RTT/TTL
//! via regex. Ported from `_ping_system_command` in `ping_tool.py`.

use std::time::{Duration, Instant};

use encoding_rs::{GBK, UTF_8};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tokio::time;

use super::strategy::{StrategyError, StrategyOutcome};
use crate::types::PingMethod;

/// Run the platform `ping` binary once and parse its stdout.
pub async fn ping_once_system(
    host: &str,
    timeout: Duration,
) -> Result<StrategyOutcome, StrategyError> {
    let cmd = build_command(host, timeout);
    let start = Instant::now();

    let output = time::timeout(timeout + Duration::from_secs(1), async move {
        let mut command = cmd;
        command.output().await
    })
    .await
    .map_err(|_| StrategyError::Failed("system ping timed out".to_string()))?
    .map_err(|e| StrategyError::Unavailable(format!("ping command unavailable: {e}")))?;

    let text = decode_output(&output.stdout);
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    let rtt_ms = extract_rtt_ms(&text).unwrap_or(elapsed_ms);
    let ttl = extract_ttl(&text);

    if rtt_ms > 0.0 || has_success_indicator(&text) {
        Ok(StrategyOutcome {
            response_time_ms: rtt_ms,
            ttl,
            method: PingMethod::SystemCommand,
        })
    } else {
        Err(StrategyError::Failed(
            "no success indicator in ping output".to_string(),
        ))
    }
}

fn build_command(host: &str, timeout: Duration) -> Command {
    let mut cmd = if cfg!(target_os = "windows") {
        let mut c = Command::new("ping");
        c.args(["-n", "1", "-w", &(timeout.as_millis() as u64).to_string()]);
        c
    } else {
        let mut c = Command::new("ping");
        let secs = timeout.as_secs().max(1);
        c.args(["-c", "1", "-W", &secs.to_string()]);
        c
    };
    cmd.arg(host);
    cmd
}

fn decode_output(bytes: &[u8]) -> String {
    for encoding in [UTF_8, GBK] {
        let (text, _, had_errors) = encoding.decode(bytes);
        if !had_errors {
            return text.into_owned();
        }
    }
    String::from_utf8_lossy(bytes).into_owned()
}

static RTT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"time[=<]([0-9]+\.?[0-9]*)\s*ms",
        r"时间[=<]([0-9]+\.?[0-9]*)\s*ms",
        r"([0-9]+\.?[0-9]*)\s*ms",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

static TTL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"ttl[=:]?\s*([0-9]+)",
        r"生存时间[=:]?\s*([0-9]+)",
        r"跃点数[=:]?\s*([0-9]+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

static SUCCESS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"bytes from", r"来自.*的回复", r"reply from", r"64 bytes"]
        .iter()
        .map(|p| Regex::new(p).expect("static regex"))
        .collect()
});

fn extract_rtt_ms(text: &str) -> Option<f64> {
    for pattern in RTT_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(text) {
            if let Some(m) = caps.get(1) {
                if let Ok(v) = m.as_str().parse::<f64>() {
                    return Some(v);
                }
            }
        }
    }
    None
}

fn extract_ttl(text: &str) -> Option<u8> {
    for pattern in TTL_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(&text.to_lowercase()) {
            if let Some(m) = caps.get(1) {
                if let Ok(v) = m.as_str().parse::<u8>() {
                    return Some(v);
                }
            }
        }
    }
    None
}

fn has_success_indicator(text: &str) -> bool {
    SUCCESS_PATTERNS.iter().any(|p| p.is_match(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_rtt_from_linux_output() {
        let sample = "64 bytes from 127.0.0.1: icmp_seq=1 ttl=64 time=0.045 ms";
        assert_eq!(extract_rtt_ms(sample), Some(0.045));
        assert_eq!(extract_ttl(sample), Some(64));
        assert!(has_success_indicator(sample));
    }

    #[test]
    fn extracts_rtt_from_windows_style_output() {
        let sample = "Reply from 127.0.0.1: bytes=32 time<1ms TTL=128";
        assert!(extract_rtt_ms(sample).is_some());
        assert_eq!(extract_ttl(sample), Some(128));
    }

    #[test]
    fn no_success_indicator_means_failure() {
        let sample = "Request timed out.";
        assert!(extract_rtt_ms(sample).is_none());
        assert!(!has_success_indicator(sample));
    }
}
