use std::{cmp::Ordering, fmt, io};

use bytes::BufMut;
use nom::{IResult, Needed};
use snafu::Snafu;
use tokio::io::{AsyncRead, AsyncReadExt};

/// An integer less than 2^62
///
/// Values of this type are suitable for encoding as QUIC variable-length
/// integer.
///
/// See [variable-length integers](https://www.rfc-editor.org/rfc/rfc9000.html#name-variable-length-integer-enc)
/// of [QUIC](https://www.rfc-editor.org/rfc/rfc9000.html) for more details.
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VarInt(u64);

/// The maximum value that can be represented by a QUIC variable-length integer.
pub const VARINT_MAX: u64 = 0x3fff_ffff_ffff_ffff;

impl VarInt {
    /// The largest representable value, `2^62 - 1`.
    pub const MAX: Self = Self(VARINT_MAX);
    /// The largest encoded value length.
    pub const MAX_SIZE: usize = 8;

    /// Construct a `VarInt` from a [`u32`].
    pub const fn from_u32(x: u32) -> Self {
        Self(x as u64)
    }

    /// Construct a `VarInt` from a [`u64`]. Succeeds if `x` < 2^62.
    pub const fn from_u64(value: u64) -> Result<Self, Overflow> {
        if value < (1 << 62) {
            Ok(Self(value))
        } else {
            Err(Overflow { value })
        }
    }

    /// Extract the integer value.
    pub const fn into_inner(self) -> u64 {
        self.0
    }

    /// Compute the number of bytes needed to encode this value.
    pub const fn encoding_size(self) -> usize {
        let x = self.0;
        if x < (1 << 6) {
            1
        } else if x < (1 << 14) {
            2
        } else if x < (1 << 30) {
            4
        } else {
            8
        }
    }

    /// Append the variable-length encoding of this value to `buf`.
    pub fn encode(self, buf: &mut impl BufMut) {
        let x = self.0;
        if x < (1 << 6) {
            buf.put_u8(x as u8);
        } else if x < (1 << 14) {
            buf.put_u16((0b01 << 14) | x as u16);
        } else if x < (1 << 30) {
            buf.put_u32((0b10 << 30) | x as u32);
        } else {
            buf.put_u64((0b11 << 62) | x);
        }
    }
}

impl From<VarInt> for u64 {
    fn from(x: VarInt) -> Self {
        x.0
    }
}

impl From<u8> for VarInt {
    fn from(x: u8) -> Self {
        Self(x.into())
    }
}

impl From<u16> for VarInt {
    fn from(x: u16) -> Self {
        Self(x.into())
    }
}

impl From<u32> for VarInt {
    fn from(x: u32) -> Self {
        Self(x.into())
    }
}

impl TryFrom<u64> for VarInt {
    type Error = Overflow;

    /// Succeeds if `x` < 2^62
    fn try_from(x: u64) -> Result<Self, Self::Error> {
        Self::from_u64(x)
    }
}

impl TryFrom<usize> for VarInt {
    type Error = Overflow;

    /// Succeeds if `x` < 2^62
    fn try_from(x: usize) -> Result<Self, Self::Error> {
        Self::try_from(x as u64)
    }
}

impl PartialEq<u64> for VarInt {
    fn eq(&self, other: &u64) -> bool {
        self.0.eq(other)
    }
}

impl PartialOrd<u64> for VarInt {
    fn partial_cmp(&self, other: &u64) -> Option<Ordering> {
        self.0.partial_cmp(other)
    }
}

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Overflow error indicating that a value exceeds 2^62.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Snafu)]
#[snafu(display("Value({value}) too large for varint encoding"))]
pub struct Overflow {
    value: u64,
}

#[derive(Debug, Snafu)]
pub enum DecodeVarIntError {
    /// The stream ended between the first and the last byte of a
    /// variable-length integer.
    #[snafu(display("stream ended inside a variable-length integer"))]
    UnexpectedEnd,
    #[snafu(context(false))]
    Io { source: io::Error },
}

/// Parse one variable-length integer from the front of a buffer,
/// [nom](https://docs.rs/nom/latest/nom/)-compatible. The two prefix bits of
/// the first byte select the encoded width; a short buffer reports how many
/// bytes are still missing.
pub fn be_varint(input: &[u8]) -> IResult<&[u8], VarInt> {
    let Some(&first) = input.first() else {
        return Err(nom::Err::Incomplete(Needed::new(1)));
    };
    let len = 1usize << (first >> 6);
    if input.len() < len {
        return Err(nom::Err::Incomplete(Needed::new(len - input.len())));
    }
    let mut value = u64::from(first & 0x3f);
    for &byte in &input[1..len] {
        value = (value << 8) | u64::from(byte);
    }
    Ok((&input[len..], VarInt(value)))
}

/// Read one variable-length integer from an asynchronous stream.
pub async fn decode(stream: impl AsyncRead + Unpin) -> Result<VarInt, DecodeVarIntError> {
    match decode_opt(stream).await? {
        Some(varint) => Ok(varint),
        None => Err(DecodeVarIntError::UnexpectedEnd),
    }
}

/// Read one variable-length integer, or `None` if the stream ends cleanly
/// before its first byte.
pub async fn decode_opt(
    mut stream: impl AsyncRead + Unpin,
) -> Result<Option<VarInt>, DecodeVarIntError> {
    let first_byte = match stream.read_u8().await {
        Ok(byte) => byte,
        Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error.into()),
    };
    let len = 1usize << (first_byte >> 6);
    let mut buf = [first_byte, 0, 0, 0, 0, 0, 0, 0];
    stream
        .read_exact(&mut buf[1..len])
        .await
        .map_err(|error| match error.kind() {
            io::ErrorKind::UnexpectedEof => DecodeVarIntError::UnexpectedEnd,
            _ => error.into(),
        })?;
    Ok(Some(be_varint(&buf[..len]).unwrap().1))
}
