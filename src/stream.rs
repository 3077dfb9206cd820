use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use snafu::Report;
use tokio::io::AsyncReadExt;

use crate::{
    connection::Connection,
    error::{Code, ConnectionError, HasErrorCode, StreamError},
    frame::{self, FrameHeader, Goaway, Settings},
    quic::{AbortStream, BoxReadHalf, BoxWriteHalf, Transport},
    service::{RequestStream, Service},
    varint::{self, VarInt},
};

/// A control stream is indicated by a stream type of 0x00. Data on this
/// stream consists of HTTP/3 frames.
///
/// https://datatracker.ietf.org/doc/html/rfc9114#name-control-streams
pub const CONTROL_STREAM_TYPE: VarInt = VarInt::from_u32(0x00);

/// A push stream is indicated by a stream type of 0x01.
///
/// https://datatracker.ietf.org/doc/html/rfc9114#name-push-streams
pub const PUSH_STREAM_TYPE: VarInt = VarInt::from_u32(0x01);

/// An encoder stream is a unidirectional stream of type 0x02. It carries an
/// unframed sequence of encoder instructions from encoder to decoder.
///
/// https://datatracker.ietf.org/doc/html/rfc9204#section-4.2-2.1
pub const QPACK_ENCODER_STREAM_TYPE: VarInt = VarInt::from_u32(0x02);

/// A decoder stream is a unidirectional stream of type 0x03. It carries an
/// unframed sequence of decoder instructions from decoder to encoder.
///
/// https://datatracker.ietf.org/doc/html/rfc9204#section-4.2-2.2
pub const QPACK_DECODER_STREAM_TYPE: VarInt = VarInt::from_u32(0x03);

/// Stream types of the format 0x1f * N + 0x21 are reserved to exercise the
/// requirement that unknown types be ignored.
///
/// https://datatracker.ietf.org/doc/html/rfc9114#name-reserved-stream-types
pub const fn is_reserved_stream_type(r#type: VarInt) -> bool {
    r#type.into_inner() >= 0x21 && (r#type.into_inner() - 0x21) % 0x1f == 0
}

/// Control frames larger than this are treated as malformed; SETTINGS and
/// GOAWAY payloads are tiny in practice.
const MAX_CONTROL_FRAME_PAYLOAD: u64 = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Request,
    Inbound,
}

/// Shared bookkeeping for one accepted stream: whether it has delivered
/// enough bytes to be classified, its startup deadline, and the capability to
/// abort it.
pub struct StreamHandle {
    stream_id: VarInt,
    kind: StreamKind,
    started: AtomicBool,
    /// Heartbeat tick at which the stream expires; 0 = deadline not armed.
    expires_at: AtomicU64,
    aborter: Arc<dyn AbortStream>,
}

impl StreamHandle {
    pub(crate) fn request(stream_id: VarInt, aborter: Arc<dyn AbortStream>) -> Self {
        Self::new(stream_id, StreamKind::Request, aborter)
    }

    pub(crate) fn inbound(stream_id: VarInt, aborter: Arc<dyn AbortStream>) -> Self {
        Self::new(stream_id, StreamKind::Inbound, aborter)
    }

    fn new(stream_id: VarInt, kind: StreamKind, aborter: Arc<dyn AbortStream>) -> Self {
        Self {
            stream_id,
            kind,
            started: AtomicBool::new(false),
            expires_at: AtomicU64::new(0),
            aborter,
        }
    }

    pub fn stream_id(&self) -> VarInt {
        self.stream_id
    }

    pub fn is_request_stream(&self) -> bool {
        self.kind == StreamKind::Request
    }

    /// True once the stream has received the minimum bytes to be classified:
    /// the first HEADERS frame header for a request stream, the stream-type
    /// varint for a unidirectional stream.
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub(crate) fn expiration_ticks(&self) -> u64 {
        self.expires_at.load(Ordering::Acquire)
    }

    pub(crate) fn set_expiration_ticks(&self, ticks: u64) {
        self.expires_at.store(ticks, Ordering::Release);
    }

    pub(crate) fn abort(&self, reason: &str, code: Code) {
        tracing::debug!(stream_id = %self.stream_id, %code, reason, "aborting stream");
        self.aborter.abort(code);
    }

    /// Abort the stream with a stream-local error, carrying its code.
    pub(crate) fn abort_with(&self, error: &StreamError) {
        self.abort(&error.to_string(), error.code());
    }
}

/// Drive one peer-initiated unidirectional stream: classify it by its
/// leading varint and hand it to the matching role.
pub(crate) async fn run_inbound_stream<T: Transport>(
    connection: Arc<Connection<T>>,
    handle: Arc<StreamHandle>,
    mut reader: BoxReadHalf,
) {
    let r#type = match varint::decode(&mut reader).await {
        Ok(r#type) => r#type,
        Err(error) => {
            tracing::debug!(
                error = %Report::from_error(error),
                "unidirectional stream ended before its type varint"
            );
            return;
        }
    };
    handle.mark_started();

    if r#type == CONTROL_STREAM_TYPE {
        if !connection
            .control()
            .on_inbound_control_stream(handle.clone())
            .await
        {
            // Only one control stream per peer is permitted; a second one is
            // a connection error of type H3_STREAM_CREATION_ERROR.
            //
            // https://datatracker.ietf.org/doc/html/rfc9114#section-6.2.1-2
            connection
                .on_stream_connection_error(ConnectionError::Http3 {
                    code: Code::H3_STREAM_CREATION_ERROR,
                    message: "peer opened a second control stream".into(),
                })
                .await;
            return;
        }
        if let Err(error) = run_control_frames(&connection, &mut reader).await {
            connection.on_stream_connection_error(error).await;
        }
    } else if r#type == QPACK_ENCODER_STREAM_TYPE {
        if !connection
            .control()
            .on_inbound_encoder_stream(handle.clone())
            .await
        {
            connection
                .on_stream_connection_error(ConnectionError::Http3 {
                    code: Code::H3_STREAM_CREATION_ERROR,
                    message: "peer opened a second QPACK encoder stream".into(),
                })
                .await;
            return;
        }
        // instructions are consumed by the QPACK collaborator
        discard(&mut reader).await;
    } else if r#type == QPACK_DECODER_STREAM_TYPE {
        if !connection
            .control()
            .on_inbound_decoder_stream(handle.clone())
            .await
        {
            connection
                .on_stream_connection_error(ConnectionError::Http3 {
                    code: Code::H3_STREAM_CREATION_ERROR,
                    message: "peer opened a second QPACK decoder stream".into(),
                })
                .await;
            return;
        }
        discard(&mut reader).await;
    } else if is_reserved_stream_type(r#type) {
        // https://datatracker.ietf.org/doc/html/rfc9114#section-6.2.3-2
        handle.abort("reserved stream type", Code::H3_NO_ERROR);
    } else {
        // Unknown stream types are not a connection error of any kind; abort
        // reading and move on.
        //
        // https://datatracker.ietf.org/doc/html/rfc9114#name-unidirectional-streams
        handle.abort("unsupported stream type", Code::H3_STREAM_CREATION_ERROR);
    }
}

/// The frame loop of the peer's control stream: SETTINGS first and exactly
/// once, GOAWAY initiates a client-driven drain, reserved and unknown frames
/// are skipped.
async fn run_control_frames<T: Transport>(
    connection: &Arc<Connection<T>>,
    reader: &mut BoxReadHalf,
) -> Result<(), ConnectionError> {
    let mut settings_received = false;
    loop {
        let header = match FrameHeader::decode(reader).await {
            Ok(Some(header)) => header,
            // Closing the control stream, cleanly or not, is a connection
            // error.
            //
            // https://datatracker.ietf.org/doc/html/rfc9114#section-6.2.1-3
            Ok(None) | Err(_) => {
                return Err(ConnectionError::Http3 {
                    code: Code::H3_CLOSED_CRITICAL_STREAM,
                    message: "peer closed its control stream".into(),
                });
            }
        };

        if header.r#type == frame::SETTINGS_FRAME_TYPE {
            if settings_received {
                return Err(ConnectionError::Http3 {
                    code: Code::H3_FRAME_UNEXPECTED,
                    message: "received a second SETTINGS frame".into(),
                });
            }
            settings_received = true;
            let payload = read_control_payload(reader, header.length).await?;
            for setting in Settings::decode_payload(&payload)? {
                connection
                    .control()
                    .on_inbound_control_stream_setting(setting)?;
            }
            tracing::debug!(settings = ?connection.control().peer_settings(), "peer settings applied");
            continue;
        }

        // A SETTINGS frame must be the first frame of each control stream.
        //
        // https://datatracker.ietf.org/doc/html/rfc9114#frame-settings
        if !settings_received {
            return Err(ConnectionError::Http3 {
                code: Code::H3_MISSING_SETTINGS,
                message: "first control frame was not SETTINGS".into(),
            });
        }

        if header.r#type == frame::GOAWAY_FRAME_TYPE {
            let payload = read_control_payload(reader, header.length).await?;
            let goaway = Goaway::decode_payload(&payload)?;
            tracing::debug!(stream_id = %goaway.stream_id(), "peer requested graceful close");
            connection.stop_processing_next_request(false);
        } else if header.r#type == frame::HEADERS_FRAME_TYPE
            || header.r#type == frame::DATA_FRAME_TYPE
        {
            return Err(ConnectionError::Http3 {
                code: Code::H3_FRAME_UNEXPECTED,
                message: format!(
                    "frame 0x{:x} is not permitted on the control stream",
                    header.r#type.into_inner()
                ),
            });
        } else {
            if !frame::is_reserved_frame_type(header.r#type) {
                tracing::debug!(
                    frame_type = header.r#type.into_inner(),
                    "ignoring unknown control frame"
                );
            }
            skip(reader, header.length.into_inner()).await?;
        }
    }
}

async fn read_control_payload(
    reader: &mut BoxReadHalf,
    length: VarInt,
) -> Result<Vec<u8>, ConnectionError> {
    if length > MAX_CONTROL_FRAME_PAYLOAD {
        return Err(ConnectionError::Http3 {
            code: Code::H3_FRAME_ERROR,
            message: format!("control frame payload of {length} bytes exceeds the limit"),
        });
    }
    let mut payload = vec![0u8; length.into_inner() as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|_| ConnectionError::Http3 {
            code: Code::H3_CLOSED_CRITICAL_STREAM,
            message: "peer closed its control stream".into(),
        })?;
    Ok(payload)
}

async fn skip(reader: &mut BoxReadHalf, length: u64) -> Result<(), ConnectionError> {
    let mut limited = reader.take(length);
    match tokio::io::copy(&mut limited, &mut tokio::io::sink()).await {
        Ok(copied) if copied == length => Ok(()),
        _ => Err(ConnectionError::Http3 {
            code: Code::H3_CLOSED_CRITICAL_STREAM,
            message: "peer closed its control stream".into(),
        }),
    }
}

async fn discard(reader: &mut BoxReadHalf) {
    _ = tokio::io::copy(reader, &mut tokio::io::sink()).await;
}

/// Drive one request stream: gate on the first HEADERS frame header, then
/// hand the stream to the application service. Completion is reported to the
/// registry exactly once, on every path.
pub(crate) async fn run_request_stream<T: Transport, S: Service>(
    connection: Arc<Connection<T>>,
    handle: Arc<StreamHandle>,
    mut reader: BoxReadHalf,
    writer: BoxWriteHalf,
    service: Arc<S>,
) {
    let _completion = CompletionGuard {
        connection: connection.clone(),
        stream_id: handle.stream_id(),
    };

    let header = match FrameHeader::decode(&mut reader).await {
        Ok(Some(header)) => header,
        Ok(None) => {
            tracing::debug!("request stream finished before its first frame");
            return;
        }
        Err(error) => {
            tracing::debug!(
                error = %Report::from_error(error),
                "failed to read the first frame header"
            );
            return;
        }
    };

    // Receipt of a frame other than HEADERS before the request headers is a
    // connection error.
    //
    // https://datatracker.ietf.org/doc/html/rfc9114#name-expressing-http-semantics-i
    if header.r#type != frame::HEADERS_FRAME_TYPE {
        connection
            .on_stream_connection_error(ConnectionError::Http3 {
                code: Code::H3_FRAME_UNEXPECTED,
                message: format!(
                    "frame 0x{:x} received before request HEADERS",
                    header.r#type.into_inner()
                ),
            })
            .await;
        return;
    }
    handle.mark_started();
    tracing::debug!(protocol = "HTTP/3", "request queued for processing");

    let request = RequestStream::new(handle.stream_id(), header.length, reader, writer);
    match service.call(request).await {
        Ok(()) => {}
        Err(StreamError::Connection { code, message }) => {
            connection
                .on_stream_connection_error(ConnectionError::Http3 { code, message })
                .await;
        }
        Err(error) => {
            tracing::debug!(
                error = %Report::from_error(error),
                "request processing failed"
            );
        }
    }
}

struct CompletionGuard<T: Transport> {
    connection: Arc<Connection<T>>,
    stream_id: VarInt,
}

impl<T: Transport> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        self.connection.on_stream_completed(self.stream_id);
    }
}
