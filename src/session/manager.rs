//! Peer session manager
//!
//! Forms and supervises the peer group for one call. The room host runs an
//! accept loop; joiners call [`PeerSessionManager::connect_to_peer`]. Each
//! peer keeps its membership stream open for as long as it is in the room.

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::AppConfig;
use crate::constants::{MAX_PARTICIPANTS, MIN_PARTICIPANTS};
use crate::error::SessionError;
use crate::session::peer::{PeerId, PeerInfo};

/// Clamp a room size to the supported range
pub fn clamp_participants(n: usize) -> usize {
    n.clamp(MIN_PARTICIPANTS, MAX_PARTICIPANTS)
}

/// Target room size within the supported range and the configured cap
fn room_size(n: usize, max_participants: usize) -> usize {
    clamp_participants(n).min(max_participants)
}

/// Session manager settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub bind_address: IpAddr,
    /// Port peers receive media on
    pub peer_media_port: u16,
    /// Upper bound for the room size (clamped to 2..=4)
    pub max_participants: usize,
    pub expected_participants: usize,
    pub accept_poll: Duration,
    pub connection_timeout: Duration,
    pub peer_timeout: Duration,
}

impl SessionConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            bind_address: config.network.bind_address,
            peer_media_port: config.network.media_port,
            max_participants: MAX_PARTICIPANTS,
            expected_participants: config.room.expected_participants,
            accept_poll: config.network.accept_poll_interval(),
            connection_timeout: config.room.connection_timeout(),
            peer_timeout: config.room.peer_timeout(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

/// Read-only view of the live peers, as needed by the media transport
pub trait PeerDirectory: Send + Sync {
    /// Point-in-time copy of the live peers
    fn live_peers(&self) -> Vec<PeerInfo>;

    /// Peer whose media comes from `source`, if any
    fn resolve_sender(&self, source: SocketAddr) -> Option<PeerId> {
        self.live_peers()
            .into_iter()
            .find(|peer| peer.media_addr() == source)
            .map(|peer| peer.id)
    }
}

#[derive(Default)]
struct PeerSet {
    peers: Vec<PeerInfo>,
    /// Membership stream per peer; dropping it closes the connection
    streams: HashMap<PeerId, TcpStream>,
}

impl PeerSet {
    fn insert(&mut self, peer: PeerInfo, stream: TcpStream) {
        self.streams.insert(peer.id, stream);
        self.peers.push(peer);
    }

    fn remove(&mut self, id: PeerId) -> bool {
        self.streams.remove(&id);
        match self.peers.iter().position(|p| p.id == id) {
            Some(pos) => {
                self.peers.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// State shared with the accept thread
struct Shared {
    set: Mutex<PeerSet>,
    expected: AtomicUsize,
    peer_media_port: u16,
}

impl Shared {
    fn capacity(&self) -> usize {
        self.expected.load(Ordering::SeqCst) - 1
    }

    /// Register an accepted connection, or close it when the room is full
    fn admit(&self, stream: TcpStream, remote: SocketAddr) -> Option<PeerId> {
        let mut set = self.set.lock();

        if set.peers.len() >= self.capacity() {
            tracing::warn!(
                "Maximum participants reached, rejecting connection from {}",
                remote
            );
            drop(stream);
            return None;
        }

        if let Err(e) = prepare_stream(&stream) {
            tracing::warn!("Rejecting connection from {}: {}", remote, e);
            return None;
        }

        let peer = PeerInfo::new(remote.ip(), self.peer_media_port, remote);
        let id = peer.id;
        tracing::info!("Accepted connection from peer {} at {}", id, remote.ip());
        set.insert(peer, stream);
        Some(id)
    }
}

/// Idle time before the first keepalive probe on a membership stream
const KEEPALIVE_IDLE: Duration = Duration::from_secs(2);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Membership streams are polled, never read from. Keepalive turns a peer
/// that vanished without closing into a stream error.
fn prepare_stream(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Whether the far end still holds the membership stream open
fn stream_is_open(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match stream.peek(&mut probe) {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) if e.kind() == ErrorKind::WouldBlock => true,
        Err(_) => false,
    }
}

fn bind_listener(addr: SocketAddr, backlog: i32) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn run_accept_loop(listener: TcpListener, listening: &AtomicBool, shared: &Shared, poll: Duration) {
    while listening.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, remote)) => {
                shared.admit(stream, remote);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(poll),
            Err(e) => {
                tracing::debug!("accept failed: {}", e);
                thread::sleep(poll);
            }
        }
    }
}

pub struct PeerSessionManager {
    config: SessionConfig,
    shared: Arc<Shared>,
    listening: Arc<AtomicBool>,
    listen_addr: Mutex<Option<SocketAddr>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl PeerSessionManager {
    pub fn new(mut config: SessionConfig) -> Self {
        config.max_participants = clamp_participants(config.max_participants);
        let expected = room_size(config.expected_participants, config.max_participants);
        config.expected_participants = expected;

        tracing::info!(
            "Peer session manager ready (max {} participants, expecting {})",
            config.max_participants,
            expected
        );

        Self {
            shared: Arc::new(Shared {
                set: Mutex::new(PeerSet::default()),
                expected: AtomicUsize::new(expected),
                peer_media_port: config.peer_media_port,
            }),
            config,
            listening: Arc::new(AtomicBool::new(false)),
            listen_addr: Mutex::new(None),
            accept_thread: Mutex::new(None),
        }
    }

    /// Set the target room size (clamped to 2..=`max_participants`). Peers
    /// already admitted beyond a lowered target are kept.
    pub fn set_expected_participants(&self, n: usize) {
        let expected = room_size(n, self.config.max_participants);
        self.shared.expected.store(expected, Ordering::SeqCst);
        tracing::info!("Expected participants set to: {}", expected);
    }

    pub fn expected_participants(&self) -> usize {
        self.shared.expected.load(Ordering::SeqCst)
    }

    pub fn max_participants(&self) -> usize {
        self.config.max_participants
    }

    /// Start accepting peers on `port` (0 picks a free port). Returns the
    /// bound address; a second call while listening returns the same address.
    pub fn start_listening(&self, port: u16) -> Result<SocketAddr, SessionError> {
        let mut listen_addr = self.listen_addr.lock();
        if self.listening.load(Ordering::SeqCst) {
            if let Some(addr) = *listen_addr {
                return Ok(addr);
            }
        }

        tracing::info!("Starting to listen for peer connections on port {}", port);

        let requested = SocketAddr::new(self.config.bind_address, port);
        let backlog = (self.config.max_participants - 1) as i32;
        let listener = bind_listener(requested, backlog).map_err(|e| {
            tracing::error!("Failed to listen on {}: {}", requested, e);
            SessionError::ListenFailed(format!("{}: {}", requested, e))
        })?;
        let local = listener
            .local_addr()
            .map_err(|e| SessionError::ListenFailed(e.to_string()))?;

        let listening = self.listening.clone();
        let shared = self.shared.clone();
        let poll = self.config.accept_poll;
        listening.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("peer-accept".to_string())
            .spawn(move || run_accept_loop(listener, &listening, &shared, poll))
            .map_err(|e| {
                self.listening.store(false, Ordering::SeqCst);
                SessionError::ThreadSpawn("accept", e.to_string())
            })?;

        *self.accept_thread.lock() = Some(handle);
        *listen_addr = Some(local);
        tracing::info!("Listening on {}", local);
        Ok(local)
    }

    /// Stop the accept loop. Admitted peers stay in the room.
    pub fn stop_listening(&self) {
        self.listening.store(false, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
            tracing::info!("Listening stopped");
        }
        *self.listen_addr.lock() = None;
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Address of the accept loop's listener, while listening
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock()
    }

    /// Join a room hosted at `ip:port`. Nothing changes on failure.
    pub fn connect_to_peer(&self, ip: IpAddr, port: u16) -> Result<PeerId, SessionError> {
        let remote = SocketAddr::new(ip, port);
        tracing::info!("Attempting to connect to peer: {}", remote);

        let stream = TcpStream::connect_timeout(&remote, self.config.connection_timeout)
            .and_then(|stream| prepare_stream(&stream).map(|_| stream))
            .map_err(|e| {
                tracing::error!("Failed to connect to peer {}: {}", remote, e);
                SessionError::ConnectFailed(remote.to_string(), e.to_string())
            })?;

        let peer = PeerInfo::new(ip, self.config.peer_media_port, remote);
        let id = peer.id;
        self.shared.set.lock().insert(peer, stream);

        tracing::info!("Connected to peer {}", id);
        Ok(id)
    }

    /// Remove a peer and close its membership stream. Absent ids are ignored.
    pub fn remove_peer(&self, id: PeerId) -> bool {
        let removed = self.shared.set.lock().remove(id);
        if removed {
            tracing::info!("Removing peer {}", id);
        }
        removed
    }

    /// Refresh a peer's heartbeat
    pub fn record_heartbeat(&self, id: PeerId) -> bool {
        let mut set = self.shared.set.lock();
        match set.peers.iter_mut().find(|p| p.id == id) {
            Some(peer) => {
                peer.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Probe every membership stream and evict peers silent past the timeout
    pub fn check_peer_heartbeats(&self) -> Vec<PeerId> {
        self.check_peer_heartbeats_at(Instant::now())
    }

    /// Heartbeat check against an explicit clock reading
    pub fn check_peer_heartbeats_at(&self, now: Instant) -> Vec<PeerId> {
        let timeout = self.config.peer_timeout;
        let dead: Vec<PeerId> = {
            let mut set = self.shared.set.lock();
            let PeerSet { peers, streams } = &mut *set;

            for peer in peers.iter_mut() {
                match streams.get(&peer.id) {
                    Some(stream) if stream_is_open(stream) => {
                        peer.last_heartbeat = peer.last_heartbeat.max(now);
                    }
                    Some(_) => {
                        if peer.connected {
                            tracing::info!("Peer {} closed its connection", peer.id);
                        }
                        peer.connected = false;
                    }
                    None => {}
                }
            }

            peers
                .iter()
                .filter(|peer| peer.is_timed_out(now, timeout))
                .map(|peer| peer.id)
                .collect()
        };

        for &id in &dead {
            tracing::info!("Peer {} timed out", id);
            self.remove_peer(id);
        }
        dead
    }

    /// Number of live peers
    pub fn peer_count(&self) -> usize {
        self.shared.set.lock().peers.len()
    }

    pub fn connected_peers_count(&self) -> usize {
        self.shared.set.lock().peers.iter().filter(|p| p.connected).count()
    }

    /// Whether the first peer in the room is connected
    pub fn is_connected(&self) -> bool {
        self.shared
            .set
            .lock()
            .peers
            .first()
            .map(|p| p.connected)
            .unwrap_or(false)
    }

    /// The room is full and every peer is connected
    pub fn is_all_peers_connected(&self) -> bool {
        let set = self.shared.set.lock();
        set.peers.len() == self.shared.capacity() && set.peers.iter().all(|p| p.connected)
    }

    /// Point-in-time copy of the live peers
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.shared.set.lock().peers.clone()
    }

    pub fn peer(&self, id: PeerId) -> Option<PeerInfo> {
        self.shared.set.lock().peers.iter().find(|p| p.id == id).cloned()
    }

    /// Stop listening and drop every peer
    pub fn shutdown(&self) {
        tracing::info!("Shutting down peer session manager");
        self.stop_listening();
        let mut set = self.shared.set.lock();
        set.peers.clear();
        set.streams.clear();
    }
}

impl PeerDirectory for PeerSessionManager {
    fn live_peers(&self) -> Vec<PeerInfo> {
        self.peers()
    }

    fn resolve_sender(&self, source: SocketAddr) -> Option<PeerId> {
        self.shared
            .set
            .lock()
            .peers
            .iter()
            .find(|peer| peer.media_addr() == source)
            .map(|peer| peer.id)
    }
}

impl Drop for PeerSessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn loopback_config(expected: usize) -> SessionConfig {
        SessionConfig {
            bind_address: IpAddr::from([127, 0, 0, 1]),
            expected_participants: expected,
            accept_poll: Duration::from_millis(5),
            ..SessionConfig::default()
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_expected_participants_clamped() {
        let manager = PeerSessionManager::new(loopback_config(2));
        manager.set_expected_participants(0);
        assert_eq!(manager.expected_participants(), 2);
        manager.set_expected_participants(9);
        assert_eq!(manager.expected_participants(), 4);
        manager.set_expected_participants(3);
        assert_eq!(manager.expected_participants(), 3);
    }

    #[test]
    fn test_expected_participants_respect_configured_cap() {
        let manager = PeerSessionManager::new(SessionConfig {
            max_participants: 3,
            ..loopback_config(4)
        });
        assert_eq!(manager.max_participants(), 3);
        assert_eq!(manager.expected_participants(), 3);

        manager.set_expected_participants(4);
        assert_eq!(manager.expected_participants(), 3);
        manager.set_expected_participants(2);
        assert_eq!(manager.expected_participants(), 2);
    }

    #[test]
    fn test_lowering_room_size_keeps_admitted_peers() {
        let manager = PeerSessionManager::new(loopback_config(3));
        let addr = manager.start_listening(0).unwrap();

        let first = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| manager.peer_count() == 1));
        let second = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| manager.peer_count() == 2));
        assert!(manager.is_all_peers_connected());

        manager.set_expected_participants(2);
        assert_eq!(manager.peer_count(), 2);
        assert!(!manager.is_all_peers_connected());

        let mut late = TcpStream::connect(addr).unwrap();
        late.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(late.read(&mut buf), Ok(0) | Err(_)));
        assert_eq!(manager.peer_count(), 2);

        drop((first, second));
    }

    #[test]
    fn test_room_of_two_fills_after_one_connect() {
        let manager = PeerSessionManager::new(loopback_config(2));
        let addr = manager.start_listening(0).unwrap();
        assert!(!manager.is_all_peers_connected());

        let _client = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| manager.peer_count() == 1));

        assert!(manager.is_all_peers_connected());
        assert!(manager.is_connected());
        let peer = &manager.peers()[0];
        assert_eq!(peer.ip, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(peer.audio_port, manager.config.peer_media_port);
    }

    #[test]
    fn test_connection_beyond_capacity_is_closed() {
        for n in 2..=4usize {
            let manager = PeerSessionManager::new(loopback_config(n));
            let addr = manager.start_listening(0).unwrap();

            let mut clients = Vec::new();
            for i in 1..n {
                clients.push(TcpStream::connect(addr).unwrap());
                assert!(wait_for(|| manager.peer_count() == i));
            }
            assert!(manager.is_all_peers_connected());

            let mut extra = TcpStream::connect(addr).unwrap();
            extra
                .set_read_timeout(Some(Duration::from_secs(2)))
                .unwrap();
            let mut buf = [0u8; 1];
            // Host closes the surplus connection without sending anything
            assert!(matches!(extra.read(&mut buf), Ok(0) | Err(_)));
            assert_eq!(manager.peer_count(), n - 1);
        }
    }

    #[test]
    fn test_start_listening_twice_returns_same_addr() {
        let manager = PeerSessionManager::new(loopback_config(2));
        let first = manager.start_listening(0).unwrap();
        let second = manager.start_listening(0).unwrap();
        assert_eq!(first, second);

        manager.stop_listening();
        assert!(!manager.is_listening());
        assert!(manager.listen_addr().is_none());
    }

    #[test]
    fn test_connect_failure_leaves_state_untouched() {
        let manager = PeerSessionManager::new(loopback_config(2));
        // Bind then drop to find a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let result = manager.connect_to_peer(IpAddr::from([127, 0, 0, 1]), port);
        assert!(matches!(result, Err(SessionError::ConnectFailed(..))));
        assert_eq!(manager.peer_count(), 0);
    }

    #[test]
    fn test_heartbeat_timeout_evicts_only_silent_peers() {
        let manager = PeerSessionManager::new(loopback_config(3));
        let addr = manager.start_listening(0).unwrap();

        let alive = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| manager.peer_count() == 1));
        let gone = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| manager.peer_count() == 2));
        drop(gone);

        let peers = manager.peers();
        assert!(wait_for(|| {
            manager.check_peer_heartbeats();
            manager.connected_peers_count() == 1
        }));
        assert!(!manager.is_all_peers_connected());

        let later = Instant::now() + Duration::from_millis(10_001);
        let removed = manager.check_peer_heartbeats_at(later);

        assert_eq!(removed.len(), 1);
        assert_eq!(manager.peer_count(), 1);
        let survivor = manager.peers()[0].id;
        assert!(peers.iter().any(|p| p.id == survivor));
        assert!(!removed.contains(&survivor));
        drop(alive);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let manager = PeerSessionManager::new(loopback_config(2));
        let addr = manager.start_listening(0).unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| manager.peer_count() == 1));

        let id = manager.peers()[0].id;
        assert!(manager.remove_peer(id));
        assert!(!manager.remove_peer(id));
        assert!(!manager.record_heartbeat(id));
        assert_eq!(manager.peer_count(), 0);
    }

    #[test]
    fn test_resolve_sender_by_ip_and_port() {
        let manager = PeerSessionManager::new(SessionConfig {
            peer_media_port: 5100,
            ..loopback_config(2)
        });
        let addr = manager.start_listening(0).unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| manager.peer_count() == 1));

        let id = manager.peers()[0].id;
        assert_eq!(manager.resolve_sender("127.0.0.1:5100".parse().unwrap()), Some(id));
        assert_eq!(manager.resolve_sender("127.0.0.1:5101".parse().unwrap()), None);
        assert_eq!(manager.resolve_sender("10.0.0.9:5100".parse().unwrap()), None);
    }
}
