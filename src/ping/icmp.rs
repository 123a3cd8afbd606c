//! ICMP Echo Request/Reply packet construction and the raw-socket ping
//! strategy. Packet layout and checksum are a direct port of
//! `ICMPPacket` / `_ping_raw_socket` from the original `ping_tool.py`.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use rand::Rng;
use socket2::{Domain, Protocol as SockProtocol, SockAddr, Socket, Type};

use super::strategy::{StrategyError, StrategyOutcome};
use crate::types::PingMethod;

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;

/// Build an ICMPv4 echo-request packet: 8-byte header + `payload_size`
/// bytes of filler, checksum computed over the whole packet with the
/// checksum field zeroed first.
pub fn build_echo_request(identifier: u16, sequence: u16, payload_size: usize) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + payload_size);
    packet.push(ICMP_ECHO_REQUEST);
    packet.push(0); // code
    packet.extend_from_slice(&[0, 0]); // checksum placeholder
    packet.extend_from_slice(&identifier.to_be_bytes());
    packet.extend_from_slice(&sequence.to_be_bytes());
    packet.extend(std::iter::repeat(b'Q').take(payload_size));

    let checksum = rfc1071_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// RFC 1071 one's-complement checksum over 16-bit words, with end-around
/// carry folding.
pub fn rfc1071_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// A parsed echo reply, after skipping the surrounding IPv4 header.
pub struct EchoReply {
    pub identifier: u16,
    pub sequence: u16,
    pub ttl: u8,
}

/// Parse an echo reply out of a raw IPv4 datagram. Returns `None` if the
/// packet is too short or isn't an echo reply.
pub fn parse_echo_reply(data: &[u8]) -> Option<EchoReply> {
    if data.is_empty() {
        return None;
    }
    let ihl = ((data[0] & 0x0F) as usize) * 4;
    if data.len() < ihl + 8 {
        return None;
    }
    let ttl = *data.get(8)?;
    parse_icmp_payload(&data[ihl..]).map(|mut r| {
        r.ttl = ttl;
        r
    })
}

/// Parse a bare ICMP message with no leading IPv4 header, as delivered by
/// `SOCK_DGRAM` ICMP sockets (the kernel strips the IP header there). TTL
/// isn't observable at this layer, so it's left at 0.
pub fn parse_icmp_payload(icmp: &[u8]) -> Option<EchoReply> {
    if icmp.len() < 8 || icmp[0] != ICMP_ECHO_REPLY {
        return None;
    }
    let identifier = u16::from_be_bytes([icmp[4], icmp[5]]);
    let sequence = u16::from_be_bytes([icmp[6], icmp[7]]);
    Some(EchoReply {
        identifier,
        sequence,
        ttl: 0,
    })
}

/// Send one echo request over a raw ICMP socket and wait for the matching
/// reply. Requires `CAP_NET_RAW` / administrator privileges; callers
/// should treat a socket-creation failure as "strategy unavailable", not
/// as a ping failure.
pub async fn ping_once_raw(
    target: IpAddr,
    sequence: u16,
    payload_size: usize,
    timeout: Duration,
) -> Result<StrategyOutcome, StrategyError> {
    ping_once_icmp(target, sequence, payload_size, timeout, Type::RAW, PingMethod::RawSocket).await
}

/// Unprivileged ICMP strategy via `SOCK_DGRAM`, available on Linux when
/// `net.ipv4.ping_group_range` permits it. No elevated privileges needed,
/// but the kernel may simply refuse to create the socket, which is
/// reported as `Unavailable` so the caller moves on to the next strategy.
pub async fn ping_once_dgram(
    target: IpAddr,
    sequence: u16,
    payload_size: usize,
    timeout: Duration,
) -> Result<StrategyOutcome, StrategyError> {
    ping_once_icmp(
        target,
        sequence,
        payload_size,
        timeout,
        Type::DGRAM,
        PingMethod::LibraryFallback,
    )
    .await
}

async fn ping_once_icmp(
    target: IpAddr,
    sequence: u16,
    payload_size: usize,
    timeout: Duration,
    sock_type: Type,
    method: PingMethod,
) -> Result<StrategyOutcome, StrategyError> {
    let domain = if target.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, sock_type, Some(SockProtocol::ICMPV4))
        .map_err(|e| StrategyError::Unavailable(format!("icmp socket unavailable: {e}")))?;
    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| StrategyError::Unavailable(e.to_string()))?;
    socket
        .set_nonblocking(false)
        .map_err(|e| StrategyError::Unavailable(e.to_string()))?;

    let identifier: u16 = rand::thread_rng().gen();
    let packet = build_echo_request(identifier, sequence, payload_size);
    let dest = SockAddr::from(SocketAddr::new(target, 0));

    let is_dgram = sock_type == Type::DGRAM;
    let start = Instant::now();
    // socket2's blocking send/recv run on a dedicated thread so the async
    // runtime isn't stalled by the syscalls.
    let result = tokio::task::spawn_blocking(move || -> Result<EchoReply, String> {
        socket.send_to(&packet, &dest).map_err(|e| e.to_string())?;
        let mut buf = [std::mem::MaybeUninit::uninit(); 1024];
        let deadline = Instant::now() + timeout;
        loop {
            if Instant::now() >= deadline {
                return Err("timed out".to_string());
            }
            let (n, _from) = socket.recv_from(&mut buf).map_err(|e| e.to_string())?;
            let bytes: Vec<u8> = buf[..n]
                .iter()
                .map(|b| unsafe { b.assume_init() })
                .collect();
            // The kernel strips the IP header (and rewrites the identifier
            // to the bound port) for SOCK_DGRAM ICMP, so match on sequence
            // alone there; RAW sockets see the real identifier.
            let reply = if is_dgram {
                parse_icmp_payload(&bytes)
            } else {
                parse_echo_reply(&bytes)
            };
            if let Some(reply) = reply {
                if is_dgram || reply.identifier == identifier {
                    if reply.sequence == sequence {
                        return Ok(reply);
                    }
                }
            }
        }
    })
    .await
    .map_err(|e| StrategyError::Failed(e.to_string()))?;

    let is_dgram = sock_type == Type::DGRAM;
    match result {
        Ok(reply) => Ok(StrategyOutcome {
            response_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            ttl: if is_dgram { None } else { Some(reply.ttl) },
            method,
        }),
        Err(msg) => Err(StrategyError::Failed(msg)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_empty_packet_is_all_ones_complement() {
        assert_eq!(rfc1071_checksum(&[]), 0xFFFF);
    }

    #[test]
    fn echo_request_round_trips_through_checksum() {
        let packet = build_echo_request(1234, 1, 56);
        assert_eq!(packet.len(), 8 + 56);
        // Checksum over the complete packet (with checksum bytes included)
        // must sum to zero under ones-complement arithmetic.
        let mut sum: u32 = 0;
        let mut chunks = packet.chunks_exact(2);
        for chunk in &mut chunks {
            sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        assert_eq!(sum as u16, 0xFFFF);
    }

    #[test]
    fn parse_reply_skips_ipv4_header() {
        let mut datagram = vec![0x45, 0, 0, 0, 0, 0, 0, 0, 64, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let icmp = build_echo_request(99, 7, 0);
        let mut reply = icmp.clone();
        reply[0] = ICMP_ECHO_REPLY;
        datagram.extend_from_slice(&reply);
        let parsed = parse_echo_reply(&datagram).unwrap();
        assert_eq!(parsed.identifier, 99);
        assert_eq!(parsed.sequence, 7);
        assert_eq!(parsed.ttl, 64);
    }
}
