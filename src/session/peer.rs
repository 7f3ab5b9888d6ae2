//! Peer records and address parsing

use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::error::SessionError;

/// Process-unique peer identifier. Never reused after removal.
pub type PeerId = u32;

static NEXT_PEER_ID: AtomicU32 = AtomicU32::new(1);

/// Allocate the next peer id
pub(crate) fn next_peer_id() -> PeerId {
    NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed)
}

/// One remote participant
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub ip: IpAddr,
    /// Port the peer receives media datagrams on
    pub audio_port: u16,
    /// Remote end of the membership connection
    pub control_addr: SocketAddr,
    pub connected: bool,
    #[serde(skip)]
    pub last_heartbeat: Instant,
}

impl PeerInfo {
    pub(crate) fn new(ip: IpAddr, audio_port: u16, control_addr: SocketAddr) -> Self {
        Self {
            id: next_peer_id(),
            ip,
            audio_port,
            control_addr,
            connected: true,
            last_heartbeat: Instant::now(),
        }
    }

    /// Where media for this peer is sent, and where its media comes from
    pub fn media_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.audio_port)
    }

    /// Time since the last heartbeat as seen at `now`
    pub fn heartbeat_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        self.heartbeat_age(now) > timeout
    }
}

/// Parse `ip[:port]` as typed by a user, with `default_port` when omitted.
///
/// Only IPv4 literals are accepted.
pub fn parse_host_port(input: &str, default_port: u16) -> Result<SocketAddr, SessionError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(SessionError::InvalidAddress("empty address".into()));
    }

    let (host, port) = match input.split_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| SessionError::InvalidAddress(format!("bad port in '{}'", input)))?;
            if port == 0 {
                return Err(SessionError::InvalidAddress(format!("bad port in '{}'", input)));
            }
            (host, port)
        }
        None => (input, default_port),
    };

    let ip: Ipv4Addr = host
        .parse()
        .map_err(|_| SessionError::InvalidAddress(format!("bad IPv4 address '{}'", host)))?;

    Ok(SocketAddr::new(IpAddr::V4(ip), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("192.168.1.20:6000", 5000).unwrap(),
            "192.168.1.20:6000".parse().unwrap()
        );
        assert_eq!(
            parse_host_port(" 10.0.0.1 ", 5000).unwrap(),
            "10.0.0.1:5000".parse().unwrap()
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let bad = [
            "",
            "   ",
            "host:5000",
            "10.0.0.1:",
            "10.0.0.1:abc",
            "10.0.0.1:0",
            "10.0.0.1:70000",
            "::1",
        ];
        for input in bad {
            assert!(
                matches!(parse_host_port(input, 5000), Err(SessionError::InvalidAddress(_))),
                "accepted {:?}",
                input
            );
        }
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let a = next_peer_id();
        let b = next_peer_id();
        assert!(b > a);
    }

    #[test]
    fn test_heartbeat_age() {
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let peer = PeerInfo::new(addr.ip(), 5000, addr);
        let later = peer.last_heartbeat + Duration::from_millis(10_001);

        assert!(peer.connected);
        assert_eq!(peer.media_addr(), "127.0.0.1:5000".parse().unwrap());
        assert!(peer.is_timed_out(later, Duration::from_millis(10_000)));
        assert!(!peer.is_timed_out(peer.last_heartbeat, Duration::from_millis(10_000)));
    }
}
