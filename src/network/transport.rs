//! Media transport
//!
//! One datagram socket for the whole call. Outgoing frames are stamped by
//! a single [`RtpSequencer`] and sent to every live peer; incoming
//! datagrams are matched to a peer by source address and queued per peer.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::AudioFrame;
use crate::config::AppConfig;
use crate::constants::MAX_PACKET_SIZE;
use crate::error::NetworkError;
use crate::network::packet::{decode_packet, encode_packet, RtpSequencer, HEADER_SIZE};
use crate::network::udp::{create_socket, SocketOptions};
use crate::session::{PeerDirectory, PeerId};

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub bind_addr: SocketAddr,
    pub buffer_size: usize,
    /// Sleep between empty receive polls
    pub poll_interval: Duration,
}

impl TransportConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            bind_addr: SocketAddr::new(config.network.bind_address, config.network.media_port),
            buffer_size: config.network.socket_buffer_bytes,
            poll_interval: config.network.receive_poll_interval(),
        }
    }

    /// Ephemeral port on `ip`, for running several transports on one host
    pub fn ephemeral(ip: IpAddr) -> Self {
        Self {
            bind_addr: SocketAddr::new(ip, 0),
            ..Self::from_app(&AppConfig::default())
        }
    }
}

/// Transport counters
#[derive(Debug, Default)]
pub struct TransportStats {
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_failures: AtomicU64,
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub unknown_sender: AtomicU64,
    pub invalid_packets: AtomicU64,
    /// Frames discarded because the consumer fell behind
    pub stale_frames: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportStatsSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub unknown_sender: u64,
    pub invalid_packets: u64,
    pub stale_frames: u64,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            unknown_sender: self.unknown_sender.load(Ordering::Relaxed),
            invalid_packets: self.invalid_packets.load(Ordering::Relaxed),
            stale_frames: self.stale_frames.load(Ordering::Relaxed),
        }
    }
}

/// Per-peer FIFO of received frames
#[derive(Default)]
pub struct InboundQueues {
    queues: DashMap<PeerId, VecDeque<AudioFrame>>,
}

impl InboundQueues {
    pub fn push(&self, peer: PeerId, frame: AudioFrame) {
        self.queues.entry(peer).or_default().push_back(frame);
    }

    /// Oldest frame for `peer`; `None` for unknown peers and empty queues
    pub fn pop(&self, peer: PeerId) -> Option<AudioFrame> {
        self.queues.get_mut(&peer)?.pop_front()
    }

    /// Take everything queued for `peer`, keeping only the newest
    /// `max_frames`. Returns the frames oldest first and how many were
    /// discarded.
    pub fn drain(&self, peer: PeerId, max_frames: usize) -> (Vec<AudioFrame>, usize) {
        let Some(mut queue) = self.queues.get_mut(&peer) else {
            return (Vec::new(), 0);
        };
        let stale = queue.len().saturating_sub(max_frames);
        queue.drain(..stale);
        (queue.drain(..).collect(), stale)
    }

    pub fn len(&self, peer: PeerId) -> usize {
        self.queues.get(&peer).map(|q| q.len()).unwrap_or(0)
    }

    pub fn has_queue(&self, peer: PeerId) -> bool {
        self.queues.contains_key(&peer)
    }

    /// Drop queues of peers not in `live`
    pub fn retain(&self, live: &HashSet<PeerId>) {
        self.queues.retain(|id, _| live.contains(id));
    }

    pub fn clear(&self) {
        self.queues.clear();
    }
}

/// Route one datagram to its peer's queue
fn handle_datagram(
    data: &[u8],
    source: SocketAddr,
    peers: &dyn PeerDirectory,
    queues: &InboundQueues,
    stats: &TransportStats,
) {
    stats.packets_received.fetch_add(1, Ordering::Relaxed);
    stats
        .bytes_received
        .fetch_add(data.len() as u64, Ordering::Relaxed);

    if data.len() <= HEADER_SIZE {
        stats.invalid_packets.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let Some(peer) = peers.resolve_sender(source) else {
        stats.unknown_sender.fetch_add(1, Ordering::Relaxed);
        return;
    };

    match decode_packet(data) {
        Ok((_header, frame)) => queues.push(peer, frame),
        Err(e) => {
            stats.invalid_packets.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Dropping datagram from {}: {}", source, e);
        }
    }
}

fn run_receive_loop(
    socket: &UdpSocket,
    running: &AtomicBool,
    peers: &dyn PeerDirectory,
    queues: &InboundQueues,
    stats: &TransportStats,
    poll: Duration,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    while running.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((len, source)) => handle_datagram(&buf[..len], source, peers, queues, stats),
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(poll),
            Err(e) => {
                // ICMP unreachable from a departed peer shows up here on some platforms
                tracing::warn!("recv_from failed: {}", e);
                thread::sleep(poll);
            }
        }
    }
}

pub struct AudioTransport {
    config: TransportConfig,
    peers: Arc<dyn PeerDirectory>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    sequencer: Mutex<RtpSequencer>,
    queues: Arc<InboundQueues>,
    running: Arc<AtomicBool>,
    receive_thread: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<TransportStats>,
}

impl AudioTransport {
    pub fn new(config: TransportConfig, peers: Arc<dyn PeerDirectory>) -> Self {
        Self::with_sequencer(config, peers, RtpSequencer::new())
    }

    pub fn with_sequencer(
        config: TransportConfig,
        peers: Arc<dyn PeerDirectory>,
        sequencer: RtpSequencer,
    ) -> Self {
        Self {
            config,
            peers,
            socket: Mutex::new(None),
            sequencer: Mutex::new(sequencer),
            queues: Arc::new(InboundQueues::default()),
            running: Arc::new(AtomicBool::new(false)),
            receive_thread: Mutex::new(None),
            stats: Arc::new(TransportStats::default()),
        }
    }

    /// Open the media socket and start the receive loop. Returns the bound
    /// address; calling again while running returns the same address.
    pub fn initialize(&self) -> Result<SocketAddr, NetworkError> {
        let mut slot = self.socket.lock();
        if let Some(socket) = slot.as_ref() {
            return socket
                .local_addr()
                .map_err(|e| NetworkError::SocketSetup(e.to_string()));
        }

        tracing::info!("Initializing audio transport on {}", self.config.bind_addr);

        let socket = Arc::new(create_socket(&SocketOptions {
            bind_addr: self.config.bind_addr,
            buffer_size: self.config.buffer_size,
        })?);
        let local = socket
            .local_addr()
            .map_err(|e| NetworkError::SocketSetup(e.to_string()))?;

        let running = self.running.clone();
        let peers = self.peers.clone();
        let queues = self.queues.clone();
        let stats = self.stats.clone();
        let poll = self.config.poll_interval;
        let loop_socket = socket.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("media-receive".to_string())
            .spawn(move || {
                run_receive_loop(&loop_socket, &running, peers.as_ref(), &queues, &stats, poll)
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                NetworkError::ThreadSpawn("receive", e.to_string())
            })?;

        *self.receive_thread.lock() = Some(handle);
        *slot = Some(socket);
        tracing::info!(
            "Audio transport bound to {} (ssrc {:#010x})",
            local,
            self.ssrc()
        );
        Ok(local)
    }

    /// Send `frame` to every live peer. Per-peer failures are logged and
    /// skipped. Returns the number of peers the packet went out to.
    pub fn send_audio_to_peers(&self, frame: &AudioFrame) -> Result<usize, NetworkError> {
        let socket = self
            .socket
            .lock()
            .clone()
            .ok_or(NetworkError::NotInitialized)?;

        let header = self
            .sequencer
            .lock()
            .next_header(frame.samples_per_channel() as u32);
        let packet = encode_packet(&header, frame);

        let mut delivered = 0;
        for peer in self.peers.live_peers() {
            match socket.send_to(&packet, peer.media_addr()) {
                Ok(sent) => {
                    delivered += 1;
                    self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .bytes_sent
                        .fetch_add(sent as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!("Failed to send audio to peer {}: {}", peer.id, e);
                }
            }
        }
        Ok(delivered)
    }

    /// Oldest queued frame from `peer`, without blocking
    pub fn receive_audio_from_peer(&self, peer: PeerId) -> Option<AudioFrame> {
        self.queues.pop(peer)
    }

    /// Every frame queued from `peer`, oldest first, capped at the newest
    /// `max_frames`. Older frames are dropped so latency stays bounded.
    pub fn drain_audio_from_peer(&self, peer: PeerId, max_frames: usize) -> Vec<AudioFrame> {
        let (frames, stale) = self.queues.drain(peer, max_frames);
        if stale > 0 {
            self.stats
                .stale_frames
                .fetch_add(stale as u64, Ordering::Relaxed);
            tracing::debug!("Dropped {} stale frames from peer {}", stale, peer);
        }
        frames
    }

    pub fn queued_frames(&self, peer: PeerId) -> usize {
        self.queues.len(peer)
    }

    pub fn has_queue(&self, peer: PeerId) -> bool {
        self.queues.has_queue(peer)
    }

    /// Discard queues belonging to peers that have left the room
    pub fn prune_queues(&self) {
        let live: HashSet<PeerId> = self.peers.live_peers().iter().map(|p| p.id).collect();
        self.queues.retain(&live);
    }

    pub fn ssrc(&self) -> u32 {
        self.sequencer.lock().ssrc()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.lock().as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the receive loop, wait for it, then close the socket and
    /// discard undelivered frames
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.receive_thread.lock().take() {
            let _ = handle.join();
        }
        self.queues.clear();
        if self.socket.lock().take().is_some() {
            tracing::info!("Audio transport shut down");
        }
    }
}

impl Drop for AudioTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
