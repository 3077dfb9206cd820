use std::{io, net::SocketAddr, sync::Arc};

use futures::future::BoxFuture;
use snafu::Snafu;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{error::Code, varint::VarInt};

/// The direction capabilities of a QUIC stream, seen from this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFeatures {
    pub can_read: bool,
    pub can_write: bool,
}

impl StreamFeatures {
    /// A bidirectional stream.
    pub const BIDIRECTIONAL: Self = Self {
        can_read: true,
        can_write: true,
    };
    /// A peer-initiated unidirectional stream; read-only for us.
    pub const INBOUND_UNIDIRECTIONAL: Self = Self {
        can_read: true,
        can_write: false,
    };
    /// A locally-initiated unidirectional stream; write-only for us.
    pub const OUTBOUND_UNIDIRECTIONAL: Self = Self {
        can_read: false,
        can_write: true,
    };
}

/// Resets a stream in both directions, carrying the given error code.
pub trait AbortStream: Send + Sync {
    fn abort(&self, code: Code);
}

pub type BoxReadHalf = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

/// A single QUIC stream as handed over by the transport: its identifier, its
/// direction capabilities, its byte pipes, and an abort capability.
pub struct StreamContext {
    stream_id: VarInt,
    features: StreamFeatures,
    reader: Option<BoxReadHalf>,
    writer: Option<BoxWriteHalf>,
    aborter: Arc<dyn AbortStream>,
}

impl StreamContext {
    pub fn new(
        stream_id: VarInt,
        features: StreamFeatures,
        reader: Option<BoxReadHalf>,
        writer: Option<BoxWriteHalf>,
        aborter: Arc<dyn AbortStream>,
    ) -> Self {
        Self {
            stream_id,
            features,
            reader,
            writer,
            aborter,
        }
    }

    pub fn stream_id(&self) -> VarInt {
        self.stream_id
    }

    pub fn features(&self) -> StreamFeatures {
        self.features
    }

    pub fn aborter(&self) -> Arc<dyn AbortStream> {
        self.aborter.clone()
    }

    pub fn into_halves(self) -> (Option<BoxReadHalf>, Option<BoxWriteHalf>) {
        (self.reader, self.writer)
    }
}

#[derive(Debug, Snafu)]
pub enum TransportError {
    /// The peer reset the connection.
    #[snafu(display("the peer reset the connection (code 0x{code:x})"))]
    Reset { code: u64 },
    #[snafu(context(false))]
    Io { source: io::Error },
    /// The connection was aborted locally via [`Transport::abort`].
    #[snafu(display("the connection was aborted locally"))]
    Aborted,
}

/// The multiplexed QUIC connection the dispatcher runs on.
///
/// `accept` resolving to `Ok(None)` means the peer has stopped opening
/// streams; `abort` is the single mechanism that unblocks a pending `accept`,
/// for graceful and abortive shutdown alike.
pub trait Transport: Send + Sync + 'static {
    /// An identifier for this connection, stable for its lifetime. Used in
    /// logs only.
    fn connection_id(&self) -> &str;

    /// Await the next stream opened by the peer.
    fn accept(&self) -> BoxFuture<'_, Result<Option<StreamContext>, TransportError>>;

    /// Open a new stream with the requested direction.
    fn connect(
        &self,
        features: StreamFeatures,
    ) -> BoxFuture<'_, Result<StreamContext, TransportError>>;

    /// Forcibly close the connection; the code ends up in CONNECTION_CLOSE.
    fn abort(&self, code: Code, reason: &str);

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;
}

#[cfg(test)]
pub mod test {
    use std::{
        pin::Pin,
        sync::{
            Mutex as SyncMutex,
            atomic::{AtomicU64, Ordering},
        },
        task::{Context, Poll, Waker},
    };

    use tokio::{
        io::{DuplexStream, ReadBuf},
        sync::{Mutex as AsyncMutex, Notify, mpsc},
    };

    use super::*;

    /// Shared per-stream abort record: the mock reader starts failing once a
    /// code is set, and tests assert on the recorded codes.
    #[derive(Default)]
    pub struct AbortState {
        codes: SyncMutex<Vec<Code>>,
        waker: SyncMutex<Option<Waker>>,
    }

    impl AbortState {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn first_code(&self) -> Option<Code> {
            self.codes.lock().unwrap().first().copied()
        }

        pub fn codes(&self) -> Vec<Code> {
            self.codes.lock().unwrap().clone()
        }

        fn record(&self, code: Code) {
            self.codes.lock().unwrap().push(code);
            if let Some(waker) = self.waker.lock().unwrap().take() {
                waker.wake();
            }
        }
    }

    impl AbortStream for AbortState {
        fn abort(&self, code: Code) {
            self.record(code);
        }
    }

    pin_project_lite::pin_project! {
        /// Read half that fails with `ConnectionReset` once its stream has
        /// been aborted, mirroring how a reset surfaces from a real transport.
        pub struct AbortableReader<R> {
            #[pin]
            inner: R,
            state: Arc<AbortState>,
        }
    }

    impl<R: AsyncRead> AsyncRead for AbortableReader<R> {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = self.project();
            if let Some(code) = this.state.first_code() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    format!("stream aborted with {code}"),
                )));
            }
            *this.state.waker.lock().unwrap() = Some(cx.waker().clone());
            this.inner.poll_read(cx, buf)
        }
    }

    enum Incoming {
        Stream(StreamContext),
        /// The peer will not open further streams; `accept` yields `None`.
        End,
    }

    /// In-memory [`Transport`]: tests push inbound streams, the dispatcher's
    /// outbound streams come back as the peer end of a duplex pipe.
    #[derive(Clone)]
    pub struct MockTransport {
        inner: Arc<Inner>,
    }

    struct Inner {
        incoming_tx: mpsc::UnboundedSender<Incoming>,
        incoming_rx: AsyncMutex<mpsc::UnboundedReceiver<Incoming>>,
        outbound_tx: mpsc::UnboundedSender<DuplexStream>,
        outbound_rx: AsyncMutex<mpsc::UnboundedReceiver<DuplexStream>>,
        aborted: SyncMutex<Option<(Code, String)>>,
        abort_notify: Notify,
        next_outbound_id: AtomicU64,
    }

    impl MockTransport {
        pub fn new() -> Self {
            let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            Self {
                inner: Arc::new(Inner {
                    incoming_tx,
                    incoming_rx: AsyncMutex::new(incoming_rx),
                    outbound_tx,
                    outbound_rx: AsyncMutex::new(outbound_rx),
                    aborted: SyncMutex::new(None),
                    abort_notify: Notify::new(),
                    // server-initiated unidirectional stream ids: 3, 7, 11, …
                    next_outbound_id: AtomicU64::new(3),
                }),
            }
        }

        /// Hand a stream to the dispatcher's accept loop.
        pub fn push(&self, context: StreamContext) {
            _ = self.inner.incoming_tx.send(Incoming::Stream(context));
        }

        /// Make the accept loop observe end-of-accepts.
        pub fn end_accepts(&self) {
            _ = self.inner.incoming_tx.send(Incoming::End);
        }

        /// The peer end of the next stream the dispatcher opened.
        pub async fn next_outbound(&self) -> DuplexStream {
            self.inner
                .outbound_rx
                .lock()
                .await
                .recv()
                .await
                .expect("an outbound stream")
        }

        pub fn aborted(&self) -> Option<(Code, String)> {
            self.inner.aborted.lock().unwrap().clone()
        }
    }

    impl Transport for MockTransport {
        fn connection_id(&self) -> &str {
            "mock-connection"
        }

        fn accept(&self) -> BoxFuture<'_, Result<Option<StreamContext>, TransportError>> {
            Box::pin(async move {
                let mut incoming = self.inner.incoming_rx.lock().await;
                if self.aborted().is_some() {
                    return Err(TransportError::Aborted);
                }
                tokio::select! {
                    _ = self.inner.abort_notify.notified() => Err(TransportError::Aborted),
                    next = incoming.recv() => match next {
                        Some(Incoming::Stream(context)) => Ok(Some(context)),
                        Some(Incoming::End) | None => Ok(None),
                    },
                }
            })
        }

        fn connect(
            &self,
            features: StreamFeatures,
        ) -> BoxFuture<'_, Result<StreamContext, TransportError>> {
            Box::pin(async move {
                assert_eq!(features, StreamFeatures::OUTBOUND_UNIDIRECTIONAL);
                let stream_id = self.inner.next_outbound_id.fetch_add(4, Ordering::Relaxed);
                let (local, peer) = tokio::io::duplex(64 * 1024);
                let (_, write_half) = tokio::io::split(local);
                _ = self.inner.outbound_tx.send(peer);
                Ok(StreamContext::new(
                    VarInt::from_u64(stream_id).unwrap(),
                    features,
                    None,
                    Some(Box::new(write_half)),
                    Arc::new(AbortState::new()),
                ))
            })
        }

        fn abort(&self, code: Code, reason: &str) {
            let mut aborted = self.inner.aborted.lock().unwrap();
            if aborted.is_none() {
                *aborted = Some((code, reason.to_string()));
            }
            drop(aborted);
            // notify_one leaves a permit behind, so an accept that arrives
            // after the abort still unblocks
            self.inner.abort_notify.notify_one();
        }

        fn local_addr(&self) -> SocketAddr {
            "127.0.0.1:443".parse().unwrap()
        }

        fn remote_addr(&self) -> SocketAddr {
            "127.0.0.1:50000".parse().unwrap()
        }
    }

    /// A bidirectional (request) stream: the dispatcher reads what the test
    /// writes to the returned duplex end, and vice versa.
    pub fn request_stream(
        stream_id: u64,
    ) -> (StreamContext, DuplexStream, Arc<AbortState>) {
        mock_stream(stream_id, StreamFeatures::BIDIRECTIONAL)
    }

    /// A peer-initiated unidirectional stream.
    pub fn inbound_uni_stream(
        stream_id: u64,
    ) -> (StreamContext, DuplexStream, Arc<AbortState>) {
        mock_stream(stream_id, StreamFeatures::INBOUND_UNIDIRECTIONAL)
    }

    fn mock_stream(
        stream_id: u64,
        features: StreamFeatures,
    ) -> (StreamContext, DuplexStream, Arc<AbortState>) {
        let (local, peer) = tokio::io::duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(local);
        let state = Arc::new(AbortState::new());
        let reader: BoxReadHalf = Box::new(AbortableReader {
            inner: read_half,
            state: state.clone(),
        });
        let writer: Option<BoxWriteHalf> = features
            .can_write
            .then(|| Box::new(write_half) as BoxWriteHalf);
        let context = StreamContext::new(
            VarInt::from_u64(stream_id).unwrap(),
            features,
            Some(reader),
            writer,
            state.clone(),
        );
        (context, peer, state)
    }
}
