//! Media socket construction

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, UdpSocket};

use crate::error::NetworkError;

/// Options for the media socket
#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    pub bind_addr: SocketAddr,
    /// Requested OS send and receive buffer size
    pub buffer_size: usize,
}

/// Create a non-blocking, address-reusing datagram socket bound to
/// `options.bind_addr`. Each failing step releases what came before.
pub fn create_socket(options: &SocketOptions) -> Result<UdpSocket, NetworkError> {
    let setup = |what: &str, e: std::io::Error| {
        tracing::error!("Failed to {} on media socket: {}", what, e);
        NetworkError::SocketSetup(format!("{}: {}", what, e))
    };

    let socket = Socket::new(
        Domain::for_address(options.bind_addr),
        Type::DGRAM,
        Some(Protocol::UDP),
    )
    .map_err(|e| setup("create socket", e))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| setup("set non-blocking", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| setup("set SO_REUSEADDR", e))?;

    // Buffer sizes are a hint; the OS may clamp them
    if let Err(e) = socket.set_recv_buffer_size(options.buffer_size) {
        tracing::warn!("Could not set receive buffer size: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(options.buffer_size) {
        tracing::warn!("Could not set send buffer size: {}", e);
    }

    socket.bind(&options.bind_addr.into()).map_err(|e| {
        tracing::error!("Failed to bind media socket to {}: {}", options.bind_addr, e);
        NetworkError::BindFailed(format!("{}: {}", options.bind_addr, e))
    })?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn test_socket_is_non_blocking() {
        let socket = create_socket(&SocketOptions {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            buffer_size: 64 * 1024,
        })
        .unwrap();

        let mut buf = [0u8; 16];
        let err = socket.recv_from(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }
}
