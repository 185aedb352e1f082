//! Length-prefixed framing for envelope text on the duplex stream.
//!
//! Each frame is `[Length: i32][UTF-8 envelope JSON]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use tidelog_common::{Error, Result};

/// Maximum frame size (64MB) to prevent OOM on a corrupt length prefix
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Envelope frame decoder/encoder
pub struct EnvelopeCodec {
    /// Maximum allowed frame size
    max_frame_size: usize,
}

impl EnvelopeCodec {
    /// Create a new frame codec with default settings
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a new frame codec with custom max frame size
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = String;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        // Need at least 4 bytes for the length prefix
        if src.len() < 4 {
            return Ok(None);
        }

        // Peek at the length without consuming
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = i32::from_be_bytes(length_bytes);

        if length < 0 {
            return Err(Error::Protocol(format!("negative frame size {}", length)));
        }
        let length = length as usize;

        if length > self.max_frame_size {
            return Err(Error::Protocol(format!(
                "frame size {} exceeds maximum {}",
                length, self.max_frame_size
            )));
        }

        // Check if we have the complete frame
        if src.len() < 4 + length {
            trace!(
                "waiting for complete frame, have {} bytes, need {}",
                src.len(),
                4 + length
            );
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame: Bytes = src.split_to(length).freeze();
        let text = String::from_utf8(frame.to_vec())
            .map_err(|e| Error::Protocol(format!("frame is not valid UTF-8: {}", e)))?;

        Ok(Some(text))
    }
}

impl Encoder<String> for EnvelopeCodec {
    type Error = Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        let length = item.len();

        if length > self.max_frame_size {
            return Err(Error::Protocol(format!(
                "frame size {} exceeds maximum {}",
                length, self.max_frame_size
            )));
        }

        dst.reserve(4 + length);
        dst.put_i32(length as i32);
        dst.put_slice(item.as_bytes());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_incremental() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();

        // Incomplete length prefix
        buf.put_u8(0);
        buf.put_u8(0);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // Complete length prefix but no payload
        buf.put_u8(0);
        buf.put_u8(5);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // Payload arrives
        buf.put_slice(b"hello");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, "hello");
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();

        codec.encode("[{},{}]".to_string(), &mut buf).unwrap();
        codec.encode("second".to_string(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "[{},{}]");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "second");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_frame_size_validation() {
        let mut codec = EnvelopeCodec::with_max_frame_size(8);
        let mut buf = BytesMut::new();

        assert!(codec.encode("123456789".to_string(), &mut buf).is_err());

        buf.put_i32(9);
        buf.put_slice(b"123456789");
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        buf.put_i32(-1);
        assert!(codec.decode(&mut buf).is_err());
    }
}
