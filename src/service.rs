use futures::future::BoxFuture;

use crate::{
    error::StreamError,
    quic::{BoxReadHalf, BoxWriteHalf},
    varint::VarInt,
};

/// A request stream that has delivered its first HEADERS frame header and is
/// ready for application processing. The reader is positioned at the start of
/// the HEADERS frame payload.
pub struct RequestStream {
    stream_id: VarInt,
    headers_frame_len: VarInt,
    reader: BoxReadHalf,
    writer: BoxWriteHalf,
}

impl RequestStream {
    pub(crate) fn new(
        stream_id: VarInt,
        headers_frame_len: VarInt,
        reader: BoxReadHalf,
        writer: BoxWriteHalf,
    ) -> Self {
        Self {
            stream_id,
            headers_frame_len,
            reader,
            writer,
        }
    }

    pub fn stream_id(&self) -> VarInt {
        self.stream_id
    }

    /// Declared length of the first HEADERS frame payload.
    pub fn headers_frame_len(&self) -> VarInt {
        self.headers_frame_len
    }

    pub fn reader_mut(&mut self) -> &mut BoxReadHalf {
        &mut self.reader
    }

    pub fn writer_mut(&mut self) -> &mut BoxWriteHalf {
        &mut self.writer
    }

    pub fn into_halves(self) -> (BoxReadHalf, BoxWriteHalf) {
        (self.reader, self.writer)
    }
}

/// The application entry point that services a single request stream.
///
/// Returning [`StreamError::Connection`] escalates to a connection-wide
/// abort; any other error is logged and stays local to the stream.
pub trait Service: Send + Sync + 'static {
    fn call(&self, request: RequestStream) -> BoxFuture<'static, Result<(), StreamError>>;
}

impl<F, Fut> Service for F
where
    F: Fn(RequestStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), StreamError>> + Send + 'static,
{
    fn call(&self, request: RequestStream) -> BoxFuture<'static, Result<(), StreamError>> {
        Box::pin((self)(request))
    }
}
