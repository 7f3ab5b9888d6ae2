//! Media packet format
//!
//! ```text
//!  0               1               2               3
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC=0 |M|   PT=111    |        sequence number        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |              15 reserved source slots (all zero)              |
//! |                             ....                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |             PCM samples, 16-bit little-endian ...             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Header fields are big-endian; sample data is not byte-swapped.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::audio::buffer::AudioFrame;
use crate::constants::PAYLOAD_TYPE;
use crate::error::NetworkError;

/// First header byte: version 2, no padding, no extension, CC = 0
pub const VERSION_FLAGS: u8 = 0x80;

/// Reserved 32-bit source identifier slots after the SSRC
pub const RESERVED_SLOTS: usize = 15;

/// Fixed part of the header (flags, PT, sequence, timestamp, SSRC)
pub const FIXED_HEADER_SIZE: usize = 12;

/// Full header size on the wire
pub const HEADER_SIZE: usize = FIXED_HEADER_SIZE + RESERVED_SLOTS * 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub version_flags: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl PacketHeader {
    pub fn new(sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version_flags: VERSION_FLAGS,
            marker: false,
            payload_type: PAYLOAD_TYPE,
            sequence,
            timestamp,
            ssrc,
        }
    }

    /// Write all `HEADER_SIZE` bytes
    pub fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.version_flags);
        buf.put_u8((if self.marker { 0x80 } else { 0 }) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        buf.put_bytes(0, RESERVED_SLOTS * 4);
    }

    /// Parse a header from the front of `data`
    pub fn parse(mut data: &[u8]) -> Result<Self, NetworkError> {
        if data.len() < HEADER_SIZE {
            return Err(NetworkError::InvalidPacket(format!(
                "{} bytes is shorter than the {}-byte header",
                data.len(),
                HEADER_SIZE
            )));
        }

        let version_flags = data.get_u8();
        if version_flags >> 6 != 2 {
            return Err(NetworkError::InvalidPacket(format!(
                "unsupported version {}",
                version_flags >> 6
            )));
        }
        let marker_pt = data.get_u8();

        Ok(Self {
            version_flags,
            marker: marker_pt & 0x80 != 0,
            payload_type: marker_pt & 0x7F,
            sequence: data.get_u16(),
            timestamp: data.get_u32(),
            ssrc: data.get_u32(),
        })
    }
}

/// Header followed by the frame's samples, in one owned buffer
pub fn encode_packet(header: &PacketHeader, frame: &AudioFrame) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + frame.byte_len());
    header.write(&mut buf);
    frame.write_le(&mut buf);
    buf.freeze()
}

/// Split a datagram into header and frame. The datagram must carry at
/// least one sample after the header.
pub fn decode_packet(data: &[u8]) -> Result<(PacketHeader, AudioFrame), NetworkError> {
    if data.len() <= HEADER_SIZE {
        return Err(NetworkError::InvalidPacket(format!(
            "{} bytes carries no audio",
            data.len()
        )));
    }

    let header = PacketHeader::parse(data)?;
    let frame = AudioFrame::from_le_bytes(&data[HEADER_SIZE..]).ok_or_else(|| {
        NetworkError::InvalidPacket(format!(
            "{}-byte payload is not whole samples",
            data.len() - HEADER_SIZE
        ))
    })?;
    Ok((header, frame))
}

/// Sequence/timestamp state for one sender
#[derive(Debug, Clone)]
pub struct RtpSequencer {
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
}

impl RtpSequencer {
    /// Fresh sender with a random SSRC
    pub fn new() -> Self {
        Self::with_state(0, 0, rand::random())
    }

    pub fn with_state(sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            sequence,
            timestamp,
            ssrc,
        }
    }

    /// Header for the next packet carrying `samples` samples per channel.
    /// The sequence is bumped first; the timestamp advances afterwards.
    pub fn next_header(&mut self, samples: u32) -> PacketHeader {
        self.sequence = self.sequence.wrapping_add(1);
        let header = PacketHeader::new(self.sequence, self.timestamp, self.ssrc);
        self.timestamp = self.timestamp.wrapping_add(samples);
        header
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }
}

impl Default for RtpSequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_layout() {
        let header = PacketHeader::new(0x0102, 0x0304_0506, 0xDEAD_BEEF);
        let packet = encode_packet(&header, &AudioFrame::new(vec![0x1234]));

        assert_eq!(HEADER_SIZE, 72);
        assert_eq!(packet.len(), 74);
        assert_eq!(
            &packet[..12],
            &[0x80, 111, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0xDE, 0xAD, 0xBE, 0xEF]
        );
        assert!(packet[12..72].iter().all(|&b| b == 0));
        assert_eq!(&packet[72..], &[0x34, 0x12]);
    }

    #[test]
    fn test_sequence_wraps() {
        let mut seq = RtpSequencer::with_state(65534, 0, 7);
        assert_eq!(seq.next_header(480).sequence, 65535);
        assert_eq!(seq.next_header(480).sequence, 0);
        assert_eq!(seq.next_header(480).sequence, 1);
    }

    #[test]
    fn test_timestamp_advances_by_frame_length() {
        let mut seq = RtpSequencer::with_state(0, u32::MAX - 479, 7);
        let first = seq.next_header(480);
        let second = seq.next_header(480);
        let third = seq.next_header(480);

        assert_eq!(first.sequence, 1);
        assert_eq!(first.timestamp, u32::MAX - 479);
        assert_eq!(second.timestamp, 0);
        assert_eq!(third.timestamp, 480);
        assert!([first.ssrc, second.ssrc, third.ssrc].iter().all(|&s| s == 7));
    }

    #[test]
    fn test_decode_rejects_short_and_odd() {
        assert!(decode_packet(&[0x80; HEADER_SIZE]).is_err());

        let mut odd = vec![0u8; HEADER_SIZE + 3];
        odd[0] = VERSION_FLAGS;
        assert!(decode_packet(&odd).is_err());

        let mut wrong_version = vec![0u8; HEADER_SIZE + 2];
        wrong_version[0] = 0x40;
        assert!(decode_packet(&wrong_version).is_err());
    }

    proptest! {
        #[test]
        fn prop_packet_round_trip(
            samples in prop::collection::vec(any::<i16>(), 1..1920),
            sequence in any::<u16>(),
            timestamp in any::<u32>(),
            ssrc in any::<u32>(),
        ) {
            let header = PacketHeader::new(sequence, timestamp, ssrc);
            let frame = AudioFrame::new(samples);
            let packet = encode_packet(&header, &frame);

            let (decoded_header, decoded_frame) = decode_packet(&packet).unwrap();
            prop_assert_eq!(decoded_header, header);
            prop_assert_eq!(decoded_frame, frame);
        }

        #[test]
        fn prop_sequence_steps_by_one(start in any::<u16>(), count in 1usize..300) {
            let mut seq = RtpSequencer::with_state(start, 0, 1);
            let mut previous = start;
            for i in 0..count {
                let header = seq.next_header(480);
                prop_assert_eq!(header.sequence, previous.wrapping_add(1));
                prop_assert_eq!(header.timestamp, (i as u32) * 480);
                previous = header.sequence;
            }
        }
    }
}
