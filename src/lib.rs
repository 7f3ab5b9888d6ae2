//! # LAN Voice Room
//!
//! Small peer-to-peer voice rooms: raw PCM captured locally, sent to every
//! peer in the room as RTP-style datagrams, rendered locally on arrival.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          ONE PARTICIPANT                              │
//! │                                                                      │
//! │  ┌──────────────┐  frames  ┌──────────────────┐   peers   ┌────────┐ │
//! │  │ Capture Loop ├─────────►│  AudioTransport  │◄──────────┤  Peer  │ │
//! │  │ (audio::     │          │  (network::      │ snapshot  │Session │ │
//! │  │  capture)    │          │   transport)     │           │Manager │ │
//! │  └──────────────┘          │                  │           │(accept │ │
//! │                            │  send: header +  │           │ loop)  │ │
//! │                            │  PCM to each peer│           └───┬────┘ │
//! │                            │                  │               │TCP   │
//! │                            │  recv loop: demux│               │      │
//! │                            │  by (ip, port)   │               │      │
//! │                            └────────┬─────────┘               │      │
//! │                                     │ per-peer queues         │      │
//! │                                     ▼                         │      │
//! │                            ┌──────────────────┐               │      │
//! │                            │   Call Loop      │               │      │
//! │                            │   (call)         │               │      │
//! │                            └────────┬─────────┘               │      │
//! │                                     ▼                         │      │
//! │                            ┌──────────────────┐               │      │
//! │                            │  Render Loop     │               │      │
//! │                            │  (audio::        │               │      │
//! │                            │   playback)      │               │      │
//! │                            └──────────────────┘               │      │
//! └─────────────────────────────────────┬─────────────────────────┼──────┘
//!                                       │ UDP :5000 (media)       │ TCP :5000
//!                                       ▼                         ▼ (membership)
//!                                  other peers               other peers
//! ```

pub mod audio;
pub mod call;
pub mod config;
pub mod error;
pub mod logging;
pub mod network;
pub mod session;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Sample rate for capture, transport and render
    pub const SAMPLE_RATE: u32 = 48000;

    /// Channel count (mono)
    pub const CHANNELS: u16 = 1;


    /// Samples per channel in one frame (10 ms at 48 kHz)
    pub const FRAME_SAMPLES: usize = 480;

    /// Frame duration in milliseconds
    pub const FRAME_DURATION_MS: u64 = 10;

    /// Newest frames per peer kept for one call cycle; older ones are dropped
    pub const PEER_BACKLOG_FRAMES: usize = 4;

    /// RTP payload type used for raw PCM
    pub const PAYLOAD_TYPE: u8 = 111;

    /// Default port for media datagrams and the membership listener
    pub const DEFAULT_AUDIO_PORT: u16 = 5000;

    /// Smallest room (local participant plus one peer)
    pub const MIN_PARTICIPANTS: usize = 2;

    /// Largest room
    pub const MAX_PARTICIPANTS: usize = 4;

    /// Maximum time to establish a membership connection
    pub const CONNECTION_TIMEOUT: Duration = Duration::from_millis(5000);

    /// Maximum silence from a peer before it is evicted
    pub const PEER_TIMEOUT: Duration = Duration::from_millis(10_000);

    /// OS send/receive buffer size for the media socket
    pub const SOCKET_BUFFER_SIZE: usize = 128 * 1024;

    /// Largest datagram the receive loop accepts (header + four frames)
    pub const MAX_PACKET_SIZE: usize =
        crate::network::packet::HEADER_SIZE + FRAME_SAMPLES * 2 * 4;
}
