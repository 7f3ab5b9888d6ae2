//! Two participants on loopback: membership over TCP, media over UDP.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lan_voice_room::audio::AudioFrame;
use lan_voice_room::network::{encode_packet, AudioTransport, PacketHeader, TransportConfig};
use lan_voice_room::session::{PeerDirectory, PeerSessionManager, SessionConfig};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

struct Participant {
    sessions: Arc<PeerSessionManager>,
    transport: AudioTransport,
}

impl Participant {
    /// `media_port` is where this participant receives; `peer_media_port`
    /// is where its peers do.
    fn new(media_port: u16, peer_media_port: u16, expected: usize) -> Self {
        let sessions = Arc::new(PeerSessionManager::new(SessionConfig {
            bind_address: LOCALHOST,
            peer_media_port,
            expected_participants: expected,
            accept_poll: Duration::from_millis(5),
            ..SessionConfig::default()
        }));
        let directory: Arc<dyn PeerDirectory> = sessions.clone();
        let transport = AudioTransport::new(
            TransportConfig {
                bind_addr: SocketAddr::new(LOCALHOST, media_port),
                poll_interval: Duration::from_millis(1),
                ..TransportConfig::ephemeral(LOCALHOST)
            },
            directory,
        );
        transport.initialize().unwrap();
        Self { sessions, transport }
    }
}

/// A port nobody is bound to right now
fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn pair() -> (Participant, Participant) {
    let (host_port, joiner_port) = (free_udp_port(), free_udp_port());
    let host = Participant::new(host_port, joiner_port, 2);
    let joiner = Participant::new(joiner_port, host_port, 2);

    let control = host.sessions.start_listening(0).unwrap();
    joiner
        .sessions
        .connect_to_peer(LOCALHOST, control.port())
        .unwrap();
    assert!(wait_for(|| host.sessions.peer_count() == 1));
    (host, joiner)
}

#[test]
fn two_party_call_exchanges_audio_in_order() {
    let (host, joiner) = pair();
    assert!(host.sessions.is_all_peers_connected());
    assert!(joiner.sessions.is_all_peers_connected());

    let host_as_seen_by_joiner = joiner.sessions.peers()[0].id;
    let joiner_as_seen_by_host = host.sessions.peers()[0].id;

    for i in 0..5i16 {
        assert_eq!(host.transport.send_audio_to_peers(&AudioFrame::new(vec![i; 480])).unwrap(), 1);
    }
    assert!(wait_for(|| joiner.transport.queued_frames(host_as_seen_by_joiner) == 5));
    for i in 0..5i16 {
        let frame = joiner
            .transport
            .receive_audio_from_peer(host_as_seen_by_joiner)
            .unwrap();
        assert_eq!(frame.samples, vec![i; 480]);
    }

    joiner
        .transport
        .send_audio_to_peers(&AudioFrame::new(vec![-7; 480]))
        .unwrap();
    assert!(wait_for(|| host.transport.queued_frames(joiner_as_seen_by_host) == 1));
    assert_eq!(
        host.transport
            .receive_audio_from_peer(joiner_as_seen_by_host)
            .unwrap()
            .samples[0],
        -7
    );
}

#[test]
fn stranger_datagrams_are_discarded() {
    let (host, _joiner) = pair();
    let stranger = UdpSocket::bind("127.0.0.1:0").unwrap();
    let packet = encode_packet(&PacketHeader::new(1, 0, 1), &AudioFrame::silence());

    stranger
        .send_to(&packet, host.transport.local_addr().unwrap())
        .unwrap();
    assert!(wait_for(|| host.transport.stats().unknown_sender == 1));

    let peer = host.sessions.peers()[0].id;
    assert_eq!(host.transport.queued_frames(peer), 0);
}

#[test]
fn room_of_three_rejects_fourth_participant() {
    let host = Participant::new(free_udp_port(), free_udp_port(), 3);
    let control = host.sessions.start_listening(0).unwrap();

    let first = TcpStream::connect(control).unwrap();
    assert!(wait_for(|| host.sessions.peer_count() == 1));
    assert!(!host.sessions.is_all_peers_connected());

    let second = TcpStream::connect(control).unwrap();
    assert!(wait_for(|| host.sessions.peer_count() == 2));
    assert!(host.sessions.is_all_peers_connected());

    let _third = TcpStream::connect(control).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(host.sessions.peer_count(), 2);

    drop((first, second));
}

#[test]
fn departed_peer_is_evicted_and_no_longer_routed() {
    let (host, joiner) = pair();
    let joiner_id = host.sessions.peers()[0].id;
    let now = Instant::now();

    joiner.sessions.shutdown();
    assert!(wait_for(|| {
        host.sessions.check_peer_heartbeats_at(now);
        host.sessions.connected_peers_count() == 0
    }));
    assert!(!host.sessions.is_all_peers_connected());

    let removed = host
        .sessions
        .check_peer_heartbeats_at(now + Duration::from_secs(11));
    assert_eq!(removed, vec![joiner_id]);
    assert_eq!(host.sessions.peer_count(), 0);

    let joiner_media = joiner.transport.local_addr().unwrap();
    assert_eq!(host.sessions.resolve_sender(joiner_media), None);
    host.transport.prune_queues();
    assert!(host.transport.receive_audio_from_peer(joiner_id).is_none());
}
