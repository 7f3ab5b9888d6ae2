//! Peer membership for one call

pub mod manager;
pub mod peer;

pub use manager::{clamp_participants, PeerDirectory, PeerSessionManager, SessionConfig};
pub use peer::{parse_host_port, PeerId, PeerInfo};
