use bytes::{Bytes, BytesMut};

use crate::{
    frame::{self, FrameError, FrameHeader},
    varint::{VarInt, be_varint},
};

/// ``` ignore
/// GOAWAY Frame {
///   Type (i) = 0x07,
///   Length (i),
///   Stream ID/Push ID (i),
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Goaway {
    stream_id: VarInt,
}

impl Goaway {
    pub const fn new(stream_id: VarInt) -> Self {
        Self { stream_id }
    }

    pub const fn stream_id(&self) -> VarInt {
        self.stream_id
    }

    /// Encode a complete GOAWAY frame (type, length, payload).
    pub fn encode_frame(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3 * VarInt::MAX_SIZE);
        FrameHeader {
            r#type: frame::GOAWAY_FRAME_TYPE,
            length: VarInt::try_from(self.stream_id.encoding_size())
                .expect("encoding size is at most 8"),
        }
        .encode(&mut buf);
        self.stream_id.encode(&mut buf);
        buf.freeze()
    }

    /// Decode the payload of a GOAWAY frame. The payload must contain exactly
    /// one variable-length integer.
    pub fn decode_payload(payload: &[u8]) -> Result<Self, FrameError> {
        let (rest, stream_id) = be_varint(payload).map_err(|_| FrameError::Malformed {
            length: payload.len(),
        })?;
        if !rest.is_empty() {
            return Err(FrameError::TrailingBytes {
                trailing: rest.len(),
            });
        }
        Ok(Self { stream_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let goaway = Goaway::new(VarInt::from_u32(4));
        assert_eq!(goaway.encode_frame().as_ref(), &[0x07, 0x01, 0x04]);
        assert_eq!(Goaway::decode_payload(&[0x04]).unwrap(), goaway);
    }

    #[test]
    fn maximum_stream_id_takes_eight_bytes() {
        let frame = Goaway::new(VarInt::MAX).encode_frame();
        assert_eq!(frame.len(), 10);
        assert_eq!(&frame[..2], &[0x07, 0x08]);
        assert!(frame[2..].iter().all(|&byte| byte == 0xff));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        assert!(matches!(
            Goaway::decode_payload(&[0x04, 0x00]),
            Err(FrameError::TrailingBytes { trailing: 1 })
        ));
    }
}
