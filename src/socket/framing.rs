//! Wire codec for byte-stream transports.
//!
//! Length-prefixed frames with a type byte:
//!
//! ```text
//! [u32 LE length] [u8 type] [payload: length-1 bytes]
//! ```
//!
//! Frame types:
//! - `0x01`: packet (UTF-8 JSON object, see [`Packet`](crate::packet::Packet))
//!
//! Unknown types are surfaced as [`Frame::Unknown`] so a newer peer can add
//! frame kinds without tearing down older ones. A bad length header is fatal:
//! the stream can no longer be resynchronized.

use crate::constants::MAX_FRAME_SIZE;
use crate::error::{NetError, NetResult};
use crate::packet::Packet;

/// Frame type constants.
pub mod frame_type {
    /// JSON-encoded packet.
    pub const PACKET: u8 = 0x01;
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Raw JSON bytes of one packet. Decoded by the endpoint so a bad packet
    /// only costs that packet.
    Packet(Vec<u8>),

    /// Frame type this side does not understand.
    Unknown {
        /// Type byte.
        frame_type: u8,
        /// Payload bytes.
        payload: Vec<u8>,
    },
}

impl Frame {
    /// Serialize a packet into a frame.
    ///
    /// # Errors
    ///
    /// [`NetError::Codec`] if the packet does not serialize or the frame
    /// would exceed [`MAX_FRAME_SIZE`]. Nothing is written in that case, so
    /// the connection stays usable.
    pub fn from_packet(packet: &Packet) -> NetResult<Self> {
        let payload = packet.to_vec()?;
        check_frame_len(payload.len())?;
        Ok(Frame::Packet(payload))
    }

    /// Encode this frame into a wire-format byte vector.
    ///
    /// Returns `[u32 LE length][u8 type][payload]`.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Packet(payload) => encode_raw(frame_type::PACKET, payload),
            Frame::Unknown { frame_type, payload } => encode_raw(*frame_type, payload),
        }
    }
}

/// Length header for `payload_len` bytes plus the type byte, if it fits.
fn check_frame_len(payload_len: usize) -> NetResult<u32> {
    match u32::try_from(payload_len + 1) {
        Ok(length) if length <= MAX_FRAME_SIZE => Ok(length),
        _ => Err(NetError::Codec(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            payload_len + 1
        ))),
    }
}

/// Encode a raw frame with type byte and payload.
fn encode_raw(frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 1) as u32; // +1 for type byte
    let mut buf = Vec::with_capacity(4 + 1 + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.push(frame_type);
    buf.extend_from_slice(payload);
    buf
}

fn decode_frame(frame_type: u8, payload: &[u8]) -> Frame {
    match frame_type {
        frame_type::PACKET => Frame::Packet(payload.to_vec()),
        _ => Frame::Unknown {
            frame_type,
            payload: payload.to_vec(),
        },
    }
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a new decoder with empty buffer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes into the decoder and extract all complete frames.
    ///
    /// Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// [`NetError::Codec`] if a length header is zero or exceeds
    /// [`MAX_FRAME_SIZE`]. The decoder is unusable afterwards.
    pub fn feed(&mut self, bytes: &[u8]) -> NetResult<Vec<Frame>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            // Need at least 4 bytes for the length header
            if self.buf.len() < 4 {
                break;
            }

            let length = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);

            if length == 0 {
                return Err(NetError::Codec("invalid frame: zero length".into()));
            }
            if length > MAX_FRAME_SIZE {
                return Err(NetError::Codec(format!(
                    "frame too large: {length} bytes (max {MAX_FRAME_SIZE})"
                )));
            }

            let total = 4 + length as usize;
            if self.buf.len() < total {
                break;
            }

            frames.push(decode_frame(self.buf[4], &self.buf[5..total]));
            self.buf.drain(..total);
        }

        Ok(frames)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::message::Channel;
    use crate::packet::PacketType;

    fn sample() -> Packet {
        Packet::request(
            3,
            PacketType::Call,
            Channel::Net,
            "PING",
            Some(serde_json::json!({"n": 1})),
            "UR_001".parse::<Address>().unwrap(),
        )
    }

    #[test]
    fn test_packet_frame_carries_json() {
        let frame = Frame::from_packet(&sample()).unwrap();
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&frame.encode()).unwrap();
        assert_eq!(frames.len(), 1);
        let Frame::Packet(bytes) = &frames[0] else {
            panic!("expected packet frame, got {:?}", frames[0]);
        };
        assert_eq!(Packet::from_slice(bytes).unwrap(), sample());
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_multiple_frames_in_single_feed() {
        let f1 = Frame::Packet(b"{}".to_vec());
        let f2 = Frame::Unknown { frame_type: 0x09, payload: b"later".to_vec() };
        let f3 = Frame::Packet(b"[]".to_vec());

        let mut buf = Vec::new();
        buf.extend_from_slice(&f1.encode());
        buf.extend_from_slice(&f2.encode());
        buf.extend_from_slice(&f3.encode());

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&buf).unwrap();
        assert_eq!(frames, vec![f1, f2, f3]);
    }

    #[test]
    fn test_byte_at_a_time() {
        let frame = Frame::from_packet(&sample()).unwrap();
        let encoded = frame.encode();

        let mut decoder = FrameDecoder::new();
        for (i, byte) in encoded.iter().enumerate() {
            let frames = decoder.feed(&[*byte]).unwrap();
            if i < encoded.len() - 1 {
                assert!(frames.is_empty());
                assert!(decoder.has_partial());
            } else {
                assert_eq!(frames, vec![frame.clone()]);
            }
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut decoder = FrameDecoder::new();
        assert!(matches!(decoder.feed(&[0u8; 4]), Err(NetError::Codec(_))));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut decoder = FrameDecoder::new();
        let buf = (MAX_FRAME_SIZE + 1).to_le_bytes();
        assert!(matches!(decoder.feed(&buf), Err(NetError::Codec(_))));
    }

    #[test]
    fn test_oversized_packet_is_not_framed() {
        let mut packet = sample();
        packet.payload = Some(serde_json::Value::String("x".repeat(MAX_FRAME_SIZE as usize)));
        match Frame::from_packet(&packet) {
            Err(NetError::Codec(reason)) => assert!(reason.contains("too large"), "{reason}"),
            other => panic!("expected codec error, got {other:?}"),
        }
        assert!(check_frame_len(MAX_FRAME_SIZE as usize - 1).is_ok());
        assert!(check_frame_len(MAX_FRAME_SIZE as usize).is_err());
    }

    #[test]
    fn test_empty_payload_is_a_frame() {
        // length 1 = type byte only
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&[1, 0, 0, 0, frame_type::PACKET]).unwrap();
        assert_eq!(frames, vec![Frame::Packet(Vec::new())]);
    }
}
