use std::{fmt, io};

use snafu::Snafu;

use crate::varint::VarInt;

/// An HTTP/3 (or QPACK) error code, carried in stream resets and in the
/// CONNECTION_CLOSE frame of the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Code(VarInt);

impl From<VarInt> for Code {
    fn from(value: VarInt) -> Self {
        Self(value)
    }
}

impl From<Code> for VarInt {
    fn from(value: Code) -> Self {
        value.0
    }
}

impl Code {
    pub const fn new(code: VarInt) -> Self {
        Self(code)
    }

    pub const fn value(&self) -> VarInt {
        self.0
    }
}

macro_rules! codes {
    (
        $(
            $(#[$meta:meta])*
            pub const $name:ident = $value:expr;
        )*
    ) => {
        impl Code {
            $(
                $(#[$meta])*
                pub const $name: Self = Self(VarInt::from_u32($value));
            )*
        }

        impl fmt::Display for Code {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match *self {
                    $(
                        Self::$name => write!(f, "{} (0x{:x})", stringify!($name), $value),
                    )*
                    _ => write!(f, "Code 0x{:x}", self.0.into_inner()),
                }
            }
        }
    };
}

codes! {
    // https://datatracker.ietf.org/doc/html/rfc9114#name-http-3-error-codes
    /// The connection or stream needs to be closed, but there is no error to signal.
    pub const H3_NO_ERROR = 0x0100;
    /// Peer violated protocol requirements in a way that has no more specific error code.
    pub const H3_GENERAL_PROTOCOL_ERROR = 0x0101;
    /// An internal error has occurred in the HTTP stack.
    pub const H3_INTERNAL_ERROR = 0x0102;
    /// The peer created a stream that will not be accepted.
    pub const H3_STREAM_CREATION_ERROR = 0x0103;
    /// A stream required by the HTTP/3 connection was closed or reset.
    pub const H3_CLOSED_CRITICAL_STREAM = 0x0104;
    /// A frame was received that was not permitted in the current state or on the current stream.
    pub const H3_FRAME_UNEXPECTED = 0x0105;
    /// A frame that fails to satisfy layout requirements or with an invalid size was received.
    pub const H3_FRAME_ERROR = 0x0106;
    /// An error was detected in the payload of a SETTINGS frame.
    pub const H3_SETTINGS_ERROR = 0x0109;
    /// No SETTINGS frame was received at the beginning of the control stream.
    pub const H3_MISSING_SETTINGS = 0x010a;
    /// A request was rejected without any application processing.
    pub const H3_REQUEST_REJECTED = 0x010b;
    /// The request or its response is cancelled.
    pub const H3_REQUEST_CANCELLED = 0x010c;
    /// The client's stream terminated without containing a fully formed request.
    pub const H3_REQUEST_INCOMPLETE = 0x010d;
}

/// Errors that can surface the HTTP/3 error code the transport must carry.
pub trait HasErrorCode {
    fn code(&self) -> Code;
}

impl HasErrorCode for Code {
    fn code(&self) -> Code {
        *self
    }
}

/// Connection-level failure of the dispatcher.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The peer reset the underlying QUIC connection.
    #[snafu(display("the peer reset the connection"))]
    TransportReset,
    /// The transport failed with a generic I/O error.
    #[snafu(display("i/o failure on the connection transport: {message}"))]
    IoFailure { message: String },
    /// The connection was aborted cooperatively.
    #[snafu(display("the connection was aborted: {reason}"))]
    Aborted { code: Code, reason: String },
    /// A protocol violation with a specific HTTP/3 error code, reported by a
    /// stream.
    #[snafu(display("{message}"))]
    Http3 { code: Code, message: String },
    /// The peer sent a SETTINGS identifier this implementation does not
    /// recognize.
    #[snafu(display("unrecognized SETTINGS identifier 0x{:x}", id.into_inner()))]
    UnexpectedSetting { id: VarInt },
}

impl HasErrorCode for ConnectionError {
    fn code(&self) -> Code {
        match self {
            ConnectionError::TransportReset => Code::H3_NO_ERROR,
            ConnectionError::IoFailure { .. } => Code::H3_INTERNAL_ERROR,
            ConnectionError::Aborted { code, .. } => *code,
            ConnectionError::Http3 { code, .. } => *code,
            ConnectionError::UnexpectedSetting { .. } => Code::H3_SETTINGS_ERROR,
        }
    }
}

/// A stream never delivered the minimum bytes to begin: the first HEADERS
/// frame for a request stream, the stream-type varint for a unidirectional
/// stream. Aborts only that stream.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum StartupTimeout {
    #[snafu(display("request headers timeout expired"))]
    RequestHeaders,
    #[snafu(display("control stream header timeout expired"))]
    ControlStreamHeader,
}

impl HasErrorCode for StartupTimeout {
    fn code(&self) -> Code {
        match self {
            StartupTimeout::RequestHeaders => Code::H3_REQUEST_REJECTED,
            StartupTimeout::ControlStreamHeader => Code::H3_STREAM_CREATION_ERROR,
        }
    }
}

/// Failure of a single stream. `Connection` variants escalate to a
/// connection-wide abort; everything else stays stream-local.
#[derive(Debug, Snafu)]
pub enum StreamError {
    /// The peer reset the request stream.
    #[snafu(display("the peer reset the stream (code 0x{code:x})"))]
    Reset { code: u64 },
    #[snafu(context(false))]
    Io { source: io::Error },
    /// A protocol violation that must terminate the whole connection.
    #[snafu(display("{message}"))]
    Connection { code: Code, message: String },
    #[snafu(transparent)]
    StartupTimeout { source: StartupTimeout },
}

impl HasErrorCode for StreamError {
    fn code(&self) -> Code {
        match self {
            // peer-reported codes are surfaced verbatim
            StreamError::Reset { code } => {
                Code::new(VarInt::from_u64(*code).unwrap_or(VarInt::MAX))
            }
            StreamError::Io { .. } => Code::H3_INTERNAL_ERROR,
            StreamError::Connection { code, .. } => *code,
            StreamError::StartupTimeout { source } => source.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_display_their_name() {
        assert_eq!(
            Code::H3_REQUEST_REJECTED.to_string(),
            "H3_REQUEST_REJECTED (0x10b)"
        );
        assert_eq!(Code::new(VarInt::from_u32(0x42)).to_string(), "Code 0x42");
    }

    #[test]
    fn startup_timeouts_carry_their_pairing() {
        let request = StreamError::from(StartupTimeout::RequestHeaders);
        assert_eq!(request.code(), Code::H3_REQUEST_REJECTED);
        assert_eq!(request.to_string(), "request headers timeout expired");

        let control = StreamError::from(StartupTimeout::ControlStreamHeader);
        assert_eq!(control.code(), Code::H3_STREAM_CREATION_ERROR);
        assert_eq!(control.to_string(), "control stream header timeout expired");
    }

    #[test]
    fn stream_resets_surface_the_peer_code_verbatim() {
        let reset = StreamError::Reset { code: 0x10c };
        assert_eq!(reset.code(), Code::H3_REQUEST_CANCELLED);
    }

    #[test]
    fn connection_errors_carry_their_code() {
        let error = ConnectionError::UnexpectedSetting {
            id: VarInt::from_u32(0xff),
        };
        assert_eq!(error.code(), Code::H3_SETTINGS_ERROR);

        let error = ConnectionError::Http3 {
            code: Code::H3_FRAME_UNEXPECTED,
            message: "DATA before HEADERS".into(),
        };
        assert_eq!(error.code(), Code::H3_FRAME_UNEXPECTED);
    }
}
