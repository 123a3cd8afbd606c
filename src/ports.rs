//! Port-range string parsing, shared by the CLI and by scan subscriptions
//! that accept a `ports` spec such as `"1-100"` or `"22,80,8000-8010"`.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;

/// Parse a port specification into a deduplicated, first-seen-order list of
/// ports (`1..=65535`).
///
/// Entries are separated by commas and/or newlines. Each entry is either a
/// single port number (`80`) or an inclusive range (`8000-8010`); trailing
/// `#` comments and surrounding whitespace are ignored.
pub fn parse_port_spec(spec: &str) -> Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw_entry) in spec.split(['\n', ',']).enumerate() {
        let entry_no = idx + 1;
        let entry = raw_entry.split('#').next().map(str::trim).unwrap_or("");
        if entry.is_empty() {
            continue;
        }

        if let Some((a, b)) = entry.split_once('-') {
            let start = parse_port_str(a.trim())
                .with_context(|| format!("entry {entry_no}: invalid start in range: {a}"))?;
            let end = parse_port_str(b.trim())
                .with_context(|| format!("entry {entry_no}: invalid end in range: {b}"))?;
            if start > end {
                bail!("entry {entry_no}: invalid range {start}-{end} (start > end)");
            }
            for p in start..=end {
                if seen.insert(p) {
                    out.push(p);
                }
            }
            continue;
        }

        let p = parse_port_str(entry)
            .with_context(|| format!("entry {entry_no}: invalid port value: {entry}"))?;
        if seen.insert(p) {
            out.push(p);
        }
    }

    Ok(out)
}

/// A conservative default list of commonly probed TCP ports, used by the CLI
/// when no explicit port spec is given.
pub fn default_ports() -> Vec<u16> {
    const DEFAULT: &[u16] = &[
        21, 22, 23, 25, 53, 80, 110, 111, 123, 135, 139, 143, 161, 389, 443, 445, 465, 500, 587,
        631, 636, 873, 993, 995, 1433, 1521, 1723, 1883, 2049, 2375, 2376, 3000, 3128, 3260, 3306,
        3389, 5000, 5432, 5672, 5900, 5985, 5986, 6379, 7001, 7002, 8000, 8008, 8080, 8081, 8088,
        8443, 8888, 9000, 9092, 9200, 9300, 11211, 27017,
    ];
    DEFAULT.to_vec()
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_ports() {
        let ports = parse_port_spec("80,22,443").unwrap();
        assert_eq!(ports, vec![80, 22, 443]);
    }

    #[test]
    fn parse_ranges_and_dedup() {
        let ports = parse_port_spec("8000-8002,80,8001").unwrap();
        assert_eq!(ports, vec![8000, 8001, 8002, 80]);
    }

    #[test]
    fn parse_range_only_spec() {
        let ports = parse_port_spec("1-5").unwrap();
        assert_eq!(ports, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn parse_with_comments_and_whitespace() {
        let input = "80  # http\n443 # https\n8000-8002   # dev servers\n\n";
        let ports = parse_port_spec(input).unwrap();
        assert_eq!(ports, vec![80, 443, 8000, 8001, 8002]);
    }

    #[test]
    fn invalid_values_error() {
        assert!(parse_port_spec("70000").is_err());
    }

    #[test]
    fn default_has_common_ports() {
        let d = default_ports();
        assert!(!d.is_empty());
        assert!(d.contains(&80) && d.contains(&443));
    }
}
