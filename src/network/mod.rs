//! Media transport: packet format, socket setup and per-peer queues

pub mod packet;
pub mod transport;
pub mod udp;

pub use packet::{decode_packet, encode_packet, PacketHeader, RtpSequencer, HEADER_SIZE};
pub use transport::{AudioTransport, InboundQueues, TransportConfig, TransportStatsSnapshot};
pub use udp::{create_socket, SocketOptions};
