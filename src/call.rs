//! Call loop
//!
//! Glue between the audio engine, the peer session manager and the media
//! transport. A front end feeds connect requests and the mute flag in and
//! reads [`CallStatus`] back out; [`CallController::process_cycle`] is
//! called on a short fixed period.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::buffer::AudioFrame;
use crate::audio::capture::FrameSink;
use crate::audio::engine::{AudioEngine, EngineStats};
use crate::config::AppConfig;
use crate::constants::{FRAME_DURATION_MS, PEER_BACKLOG_FRAMES};
use crate::error::{Result, SessionError};
use crate::network::transport::{AudioTransport, TransportConfig, TransportStatsSnapshot};
use crate::session::{
    parse_host_port, PeerDirectory, PeerId, PeerInfo, PeerSessionManager, SessionConfig,
};

pub const STATUS_IDLE: &str = "Not connected";
pub const STATUS_IN_CALL: &str = "In call";
pub const STATUS_INVALID_ADDRESS: &str = "Invalid address. Use IP:port";

/// Sends captured frames to the room once it is full
pub struct TransportSink {
    sessions: Arc<PeerSessionManager>,
    transport: Arc<AudioTransport>,
}

impl TransportSink {
    pub fn new(sessions: Arc<PeerSessionManager>, transport: Arc<AudioTransport>) -> Self {
        Self {
            sessions,
            transport,
        }
    }
}

impl FrameSink for TransportSink {
    fn on_frame(&self, frame: AudioFrame) {
        if !self.sessions.is_all_peers_connected() {
            return;
        }
        if let Err(e) = self.transport.send_audio_to_peers(&frame) {
            tracing::debug!("Captured frame not sent: {}", e);
        }
    }
}

/// Snapshot for display
#[derive(Debug, Clone, Serialize)]
pub struct CallStatus {
    pub status: String,
    pub muted: bool,
    pub in_call: bool,
    pub expected_participants: usize,
    pub max_participants: usize,
    pub peer_count: usize,
    pub connected_peers: usize,
    pub peers: Vec<PeerInfo>,
    pub listen_addr: Option<SocketAddr>,
    pub media_addr: Option<SocketAddr>,
    pub audio: EngineStats,
    pub transport: TransportStatsSnapshot,
}

pub struct CallController {
    config: AppConfig,
    engine: Arc<AudioEngine>,
    sessions: Arc<PeerSessionManager>,
    transport: Arc<AudioTransport>,
    muted: AtomicBool,
    status: Mutex<String>,
    connect_tx: Sender<String>,
    connect_rx: Receiver<String>,
    last_heartbeat_check: Mutex<Option<Instant>>,
}

impl CallController {
    /// Build every component from `config`. Nothing is opened yet.
    pub fn new(config: AppConfig) -> Self {
        let engine = Arc::new(AudioEngine::new(&config.audio));
        let sessions = Arc::new(PeerSessionManager::new(SessionConfig::from_app(&config)));
        let directory: Arc<dyn PeerDirectory> = sessions.clone();
        let transport = AudioTransport::new(TransportConfig::from_app(&config), directory);
        Self::from_parts(config, engine, sessions, Arc::new(transport))
    }

    pub fn from_parts(
        config: AppConfig,
        engine: Arc<AudioEngine>,
        sessions: Arc<PeerSessionManager>,
        transport: Arc<AudioTransport>,
    ) -> Self {
        let (connect_tx, connect_rx) = unbounded();
        engine.set_frame_sink(Arc::new(TransportSink::new(sessions.clone(), transport.clone())));

        Self {
            config,
            engine,
            sessions,
            transport,
            muted: AtomicBool::new(false),
            status: Mutex::new(STATUS_IDLE.to_string()),
            connect_tx,
            connect_rx,
            last_heartbeat_check: Mutex::new(None),
        }
    }

    /// Open the network side, then the audio devices.
    ///
    /// Listener and media socket failures are fatal; the listener is closed
    /// again when the media socket cannot be opened. Audio device failures
    /// are logged and the call runs without that direction.
    pub fn start(&self) -> Result<()> {
        self.sessions.start_listening(self.config.network.control_port)?;
        if let Err(e) = self.transport.initialize() {
            self.sessions.stop_listening();
            return Err(e.into());
        }

        if let Err(e) = self.engine.start_capture() {
            tracing::warn!("Continuing without capture: {}", e);
        }
        if let Err(e) = self.engine.start_playback() {
            tracing::warn!("Continuing without playback: {}", e);
        }
        Ok(())
    }

    /// Queue a user connect request (`ip[:port]`); handled on the next cycle
    pub fn request_connect(&self, target: impl Into<String>) {
        let _ = self.connect_tx.send(target.into());
    }

    /// Parse and dial `target` right away, updating the status string
    pub fn handle_connect_request(
        &self,
        target: &str,
    ) -> std::result::Result<PeerId, SessionError> {
        let remote = match parse_host_port(target, self.config.network.control_port) {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!("Rejected connect request '{}': {}", target, e);
                self.set_status(STATUS_INVALID_ADDRESS);
                return Err(e);
            }
        };

        self.set_status(format!("Connecting to {}...", remote));
        match self.sessions.connect_to_peer(remote.ip(), remote.port()) {
            Ok(id) => {
                self.set_status(format!("Connected to {}", remote));
                Ok(id)
            }
            Err(e) => {
                self.set_status(format!("Failed to connect to {}", remote));
                Err(e)
            }
        }
    }

    /// One pass of the call loop. Returns the number of frames handed to
    /// playback.
    pub fn process_cycle(&self) -> usize {
        self.process_cycle_at(Instant::now())
    }

    pub fn process_cycle_at(&self, now: Instant) -> usize {
        if let Ok(target) = self.connect_rx.try_recv() {
            let _ = self.handle_connect_request(&target);
        }

        if self.heartbeat_due(now) {
            let removed = self.sessions.check_peer_heartbeats_at(now);
            if !removed.is_empty() {
                self.transport.prune_queues();
            }
        }

        if !self.sessions.is_all_peers_connected() {
            return 0;
        }

        let rendered = self.deliver_peer_audio();
        self.set_status(STATUS_IN_CALL);
        rendered
    }

    fn heartbeat_due(&self, now: Instant) -> bool {
        let mut last = self.last_heartbeat_check.lock();
        let due = match *last {
            Some(at) => now.saturating_duration_since(at) >= self.config.room.heartbeat_interval(),
            None => true,
        };
        if due {
            *last = Some(now);
        }
        due
    }

    /// Drain every peer's queue, mix the peers together and render the
    /// result unless muted. Each peer keeps at most `PEER_BACKLOG_FRAMES`
    /// per cycle, so playback latency stays bounded when cycles run long.
    /// Frames received while muted are discarded.
    fn deliver_peer_audio(&self) -> usize {
        let backlogs: Vec<Vec<AudioFrame>> = self
            .sessions
            .peers()
            .iter()
            .map(|peer| self.transport.drain_audio_from_peer(peer.id, PEER_BACKLOG_FRAMES))
            .collect();

        if self.is_muted() {
            return 0;
        }

        let mixed = mix_peer_frames(backlogs);
        let rendered = mixed.len();
        for frame in mixed {
            self.engine.queue_playback_frame(frame);
        }
        rendered
    }

    pub fn set_muted(&self, muted: bool) {
        if self.muted.swap(muted, Ordering::SeqCst) != muted {
            tracing::info!("{}", if muted { "Muted" } else { "Unmuted" });
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn set_expected_participants(&self, n: usize) {
        self.sessions.set_expected_participants(n);
    }

    fn set_status(&self, status: impl Into<String>) {
        let status = status.into();
        let mut current = self.status.lock();
        if *current != status {
            tracing::info!("Status: {}", status);
            *current = status;
        }
    }

    pub fn connection_status(&self) -> String {
        self.status.lock().clone()
    }

    pub fn status(&self) -> CallStatus {
        CallStatus {
            status: self.connection_status(),
            muted: self.is_muted(),
            in_call: self.sessions.is_all_peers_connected(),
            expected_participants: self.sessions.expected_participants(),
            max_participants: self.sessions.max_participants(),
            peer_count: self.sessions.peer_count(),
            connected_peers: self.sessions.connected_peers_count(),
            peers: self.sessions.peers(),
            listen_addr: self.sessions.listen_addr(),
            media_addr: self.transport.local_addr(),
            audio: self.engine.stats(),
            transport: self.transport.stats(),
        }
    }

    pub fn engine(&self) -> &Arc<AudioEngine> {
        &self.engine
    }

    pub fn sessions(&self) -> &Arc<PeerSessionManager> {
        &self.sessions
    }

    pub fn transport(&self) -> &Arc<AudioTransport> {
        &self.transport
    }

    /// Poll interval for a front end driving [`Self::process_cycle`]
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(FRAME_DURATION_MS)
    }

    /// Audio first, then membership, then the media socket
    pub fn shutdown(&self) {
        tracing::info!("Shutting down call");
        self.engine.shutdown();
        self.sessions.shutdown();
        self.transport.shutdown();
    }
}

/// Sum the k-th frame of every peer into the k-th output frame, so peers
/// talking at once are heard together instead of one after another
fn mix_peer_frames(backlogs: Vec<Vec<AudioFrame>>) -> Vec<AudioFrame> {
    let mut mixed: Vec<AudioFrame> = Vec::new();
    for frames in backlogs {
        for (slot, frame) in frames.into_iter().enumerate() {
            match mixed.get_mut(slot) {
                Some(out) => out.mix(&frame),
                None => mixed.push(frame),
            }
        }
    }
    mixed
}

impl Drop for CallController {
    fn drop(&mut self) {
        self.shutdown();
    }
}
