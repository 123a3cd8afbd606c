//! Well-known port → service name table, consulted after banner hints.

/// Guess a service name for an open port. Banner text (if any) is checked
/// first since it's authoritative when present; the port table is the
/// fallback.
pub fn guess_service(port: u16, banner: Option<&str>) -> Option<String> {
    if let Some(b) = banner {
        let lb = b.to_ascii_lowercase();
        let hints: &[(&str, &str)] = &[
            ("ssh-", "ssh"),
            ("smtp", "smtp"),
            ("redis", "redis"),
            ("mysql", "mysql"),
            ("postgres", "postgresql"),
            ("mongodb", "mongodb"),
            ("mqtt", "mqtt"),
        ];
        for (needle, service) in hints {
            if lb.contains(needle) {
                return Some((*service).to_string());
            }
        }
        if lb.starts_with("http/") || lb.contains("http/1.") || lb.contains("server:") {
            return Some("http".to_string());
        }
    }

    well_known_port_name(port).map(str::to_string)
}

/// True for ports commonly serving plain HTTP, used to decide whether a
/// failed banner read is worth a follow-up HTTP probe.
pub fn looks_like_http(port: u16) -> bool {
    well_known_port_name(port) == Some("http")
}

fn well_known_port_name(port: u16) -> Option<&'static str> {
    match port {
        21 => Some("ftp"),
        22 => Some("ssh"),
        23 => Some("telnet"),
        25 => Some("smtp"),
        53 => Some("dns"),
        80 | 81 | 82 | 591 | 3000 | 5000 | 7001 | 7002 | 8000 | 8001 | 8008 | 8080 | 8081
        | 8088 | 8888 | 9000 => Some("http"),
        110 => Some("pop3"),
        111 => Some("rpcbind"),
        123 => Some("ntp"),
        135 => Some("msrpc"),
        139 | 445 => Some("smb"),
        143 => Some("imap"),
        161 => Some("snmp"),
        179 => Some("bgp"),
        389 => Some("ldap"),
        443 | 8443 => Some("https"),
        465 | 587 => Some("smtps"),
        631 => Some("ipp"),
        636 => Some("ldaps"),
        873 => Some("rsync"),
        993 => Some("imaps"),
        995 => Some("pop3s"),
        1433 => Some("mssql"),
        1521 => Some("oracle"),
        1723 => Some("pptp"),
        1883 => Some("mqtt"),
        2049 => Some("nfs"),
        2375 | 2376 => Some("docker"),
        2380 => Some("etcd"),
        3128 => Some("http-proxy"),
        3260 => Some("iscsi"),
        3306 => Some("mysql"),
        3389 => Some("rdp"),
        4369 => Some("epmd"),
        5432 => Some("postgresql"),
        5672 => Some("amqp"),
        5900 => Some("vnc"),
        5985 | 5986 => Some("winrm"),
        6379 => Some("redis"),
        9092 => Some("kafka"),
        9200 | 9300 => Some("elasticsearch"),
        11211 => Some("memcached"),
        27017 | 27018 | 27019 => Some("mongodb"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_hint_wins_over_port_table() {
        assert_eq!(
            guess_service(2222, Some("SSH-2.0-OpenSSH_9.1")),
            Some("ssh".to_string())
        );
    }

    #[test]
    fn falls_back_to_port_table() {
        assert_eq!(guess_service(6379, None), Some("redis".to_string()));
    }

    #[test]
    fn unknown_port_without_banner_is_none() {
        assert_eq!(guess_service(40000, None), None);
    }
}
