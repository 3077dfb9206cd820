use bytes::BufMut;
use snafu::Snafu;
use tokio::io::AsyncRead;

use crate::{
    error::{Code, HasErrorCode},
    varint::{self, DecodeVarIntError, VarInt},
};

pub mod goaway;
pub mod settings;

pub use goaway::Goaway;
pub use settings::{Setting, Settings};

/// All frames have the following format:
///
/// ``` plaintext
/// HTTP/3 Frame Format {
///   Type (i),
///   Length (i),
///   Frame Payload (..),
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub r#type: VarInt,
    pub length: VarInt,
}

pub const DATA_FRAME_TYPE: VarInt = VarInt::from_u32(0x00);
pub const HEADERS_FRAME_TYPE: VarInt = VarInt::from_u32(0x01);
pub const SETTINGS_FRAME_TYPE: VarInt = VarInt::from_u32(0x04);
pub const GOAWAY_FRAME_TYPE: VarInt = VarInt::from_u32(0x07);

/// Frame types of the format `0x1f * N + 0x21` are reserved to exercise the
/// requirement that unknown types be ignored.
///
/// https://datatracker.ietf.org/doc/html/rfc9114#name-reserved-frame-types
pub const fn is_reserved_frame_type(r#type: VarInt) -> bool {
    r#type.into_inner() >= 0x21 && (r#type.into_inner() - 0x21) % 0x1f == 0
}

impl FrameHeader {
    /// Read the next frame header from the stream, or `None` if the stream
    /// ends cleanly at a frame boundary.
    pub async fn decode(
        stream: &mut (impl AsyncRead + Unpin),
    ) -> Result<Option<Self>, DecodeVarIntError> {
        let Some(r#type) = varint::decode_opt(&mut *stream).await? else {
            return Ok(None);
        };
        let length = varint::decode(stream).await?;
        Ok(Some(Self { r#type, length }))
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        self.r#type.encode(buf);
        self.length.encode(buf);
    }
}

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[snafu(display("frame payload of {length} bytes is truncated or malformed"))]
    Malformed { length: usize },
    #[snafu(display("frame carries {trailing} bytes beyond its declared content"))]
    TrailingBytes { trailing: usize },
}

impl HasErrorCode for FrameError {
    fn code(&self) -> Code {
        Code::H3_FRAME_ERROR
    }
}

impl From<FrameError> for crate::error::ConnectionError {
    fn from(error: FrameError) -> Self {
        Self::Http3 {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn decodes_headers_before_payload() {
        let mut input: &[u8] = &[0x01, 0x03, b'a', b'b', b'c'];
        let header = FrameHeader::decode(&mut input).await.unwrap().unwrap();
        assert_eq!(header.r#type, HEADERS_FRAME_TYPE);
        assert_eq!(header.length, 3);
        assert_eq!(input, b"abc");
    }

    #[tokio::test]
    async fn clean_end_of_stream_is_not_an_error() {
        let mut input: &[u8] = &[];
        assert!(FrameHeader::decode(&mut input).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_length_is_an_error() {
        let mut input: &[u8] = &[0x01];
        assert!(FrameHeader::decode(&mut input).await.is_err());
    }

    #[test]
    fn reserved_frame_types() {
        assert!(is_reserved_frame_type(VarInt::from_u32(0x21)));
        assert!(is_reserved_frame_type(VarInt::from_u32(0x21 + 0x1f)));
        assert!(!is_reserved_frame_type(GOAWAY_FRAME_TYPE));
        assert!(!is_reserved_frame_type(VarInt::from_u32(0x22)));
    }
}
