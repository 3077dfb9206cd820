use std::{
    sync::{
        Arc, Mutex as SyncMutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::BytesMut;
use snafu::Report;
use tokio::{io::AsyncWriteExt, sync::Notify, time::Instant};
use tokio_util::task::AbortOnDropHandle;
use tracing::Instrument;

use crate::{
    error::{Code, ConnectionError, HasErrorCode},
    frame::Settings,
    limits::Limits,
    quic::{StreamContext, StreamFeatures, Transport, TransportError},
    service::Service,
    stream::{self, StreamHandle},
    util::once::SetOnce,
    varint::VarInt,
};

pub(crate) mod control;
pub(crate) mod registry;
pub(crate) mod shutdown;
pub(crate) mod starting;

use control::ControlChannels;
use registry::StreamRegistry;
pub use shutdown::Initiator;
use shutdown::{CloseWitness, ShutdownCoordinator};
use starting::StartingStreamQueue;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// The owner of one QUIC connection for its lifetime: accepts and classifies
/// inbound streams, exchanges SETTINGS, enforces startup deadlines, tracks
/// active requests, and drives graceful or abortive shutdown to completion.
pub struct Connection<T: Transport> {
    transport: T,
    limits: Limits,
    server_settings: Settings,
    epoch: Instant,
    /// Largest request-stream id the dispatcher has accepted. Monotonic.
    highest_opened_request_stream_id: AtomicU64,
    shutdown: ShutdownCoordinator,
    registry: StreamRegistry,
    control: ControlChannels,
    starting: StartingStreamQueue,
    /// Wakes the accept loop when graceful-close intent is recorded.
    drain_kick: Notify,
    /// Guards `aborted` against check-then-act races during shutdown
    /// initiation.
    aborted: SyncMutex<bool>,
    /// First connection-level error; its code goes into CONNECTION_CLOSE.
    error: SetOnce<ConnectionError>,
}

#[bon::bon]
impl<T: Transport> Connection<T> {
    #[builder]
    pub fn new(transport: T, #[builder(default)] limits: Limits) -> Arc<Self> {
        let server_settings = limits.server_settings();
        Arc::new(Self {
            transport,
            limits,
            server_settings,
            epoch: Instant::now(),
            highest_opened_request_stream_id: AtomicU64::new(0),
            shutdown: ShutdownCoordinator::new(),
            registry: StreamRegistry::new(),
            control: ControlChannels::new(),
            starting: StartingStreamQueue::new(),
            drain_kick: Notify::new(),
            aborted: SyncMutex::new(false),
            error: SetOnce::new(),
        })
    }
}

impl<T: Transport> Connection<T> {
    /// Drive the connection from start to full shutdown. Returns once every
    /// active request has completed and the connection is closed.
    pub async fn run<S: Service>(self: &Arc<Self>, service: S) -> Result<(), ConnectionError> {
        let span =
            tracing::info_span!("connection", connection_id = %self.transport.connection_id());
        async move {
            tracing::debug!(
                local = %self.transport.local_addr(),
                remote = %self.transport.remote_addr(),
                "connection started"
            );
            let service = Arc::new(service);
            let _heartbeat = self.spawn_heartbeat();

            if let Err(error) = self.open_control_stream().await {
                self.abort(&error.to_string(), error.code()).await;
                return Err(error);
            }

            let loop_result = self.accept_streams(&service).await;
            self.finalize(loop_result).await
        }
        .instrument(span)
        .await
    }

    /// Idempotent: record graceful-close intent and kick the accept loop
    /// awake. Safe to call from any context.
    pub fn stop_processing_next_request(&self, server_initiated: bool) {
        self.shutdown.initiate(if server_initiated {
            Initiator::Server
        } else {
            Initiator::Client
        });
        self.drain_kick.notify_one();
    }

    /// The QUIC transport signalled close: mark closed and abort the
    /// transport so the accept loop unblocks. Idempotent after the first
    /// invocation.
    pub async fn on_connection_closed(&self) {
        self.abort("the client closed the connection", Code::H3_NO_ERROR)
            .await;
    }

    /// Mark the connection aborted, record the error code, attempt the
    /// single terminal GOAWAY, then abort the transport.
    pub async fn abort(&self, reason: &str, code: Code) {
        {
            let mut aborted = self.aborted.lock().unwrap();
            if *aborted {
                return;
            }
            *aborted = true;
        }
        _ = self.error.set(ConnectionError::Aborted {
            code,
            reason: reason.to_string(),
        });
        if let Some(witness) = self.shutdown.try_close() {
            self.send_final_goaway(witness).await;
        }
        self.transport.abort(code, reason);
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_closed()
    }

    pub fn graceful_close_initiator(&self) -> Option<Initiator> {
        self.shutdown.initiator()
    }

    pub fn active_request_count(&self) -> usize {
        self.registry.active_request_count()
    }

    pub fn highest_opened_request_stream_id(&self) -> VarInt {
        VarInt::from_u64(self.highest_opened_request_stream_id.load(Ordering::Acquire))
            .expect("stream ids fit a varint")
    }

    /// The last protocol error code recorded by the core or surfaced by a
    /// stream, for inclusion in CONNECTION_CLOSE.
    pub fn error_code(&self) -> Option<Code> {
        self.error.peek().map(|error| error.code())
    }

    /// Resolves once a connection-level error (including the cooperative
    /// abort reason) has been recorded.
    pub async fn error(&self) -> ConnectionError {
        self.error.get().await
    }

    pub fn server_settings(&self) -> &Settings {
        &self.server_settings
    }

    pub fn peer_settings(&self) -> Settings {
        self.control.peer_settings()
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub(crate) fn control(&self) -> &ControlChannels {
        &self.control
    }

    /// A protocol violation reported by a stream: record it and escalate to
    /// a connection-wide abort with its code.
    pub(crate) async fn on_stream_connection_error(&self, error: ConnectionError) {
        tracing::error!(error = %Report::from_error(error.clone()), "connection error");
        let code = error.code();
        let reason = error.to_string();
        _ = self.error.set(error);
        self.abort(&reason, code).await;
    }

    pub(crate) fn on_stream_completed(&self, stream_id: VarInt) {
        if self.registry.on_stream_completed(stream_id) {
            tracing::debug!(stream_id = %stream_id, "request stream completed");
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>) -> AbortOnDropHandle<()> {
        let connection = self.clone();
        let heartbeat = async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                interval.tick().await;
                connection.tick();
            }
        };
        AbortOnDropHandle::new(tokio::spawn(heartbeat.in_current_span()))
    }

    fn tick(&self) {
        let now_ticks = self.epoch.elapsed().as_millis() as u64;
        let timeout_ticks = self.limits.request_headers_timeout.as_millis() as u64;
        self.starting.tick(now_ticks, timeout_ticks);
    }

    /// Open the outbound control stream and send, in order, the stream-type
    /// varint and the server SETTINGS frame.
    async fn open_control_stream(&self) -> Result<(), ConnectionError> {
        let context = self
            .transport
            .connect(StreamFeatures::OUTBOUND_UNIDIRECTIONAL)
            .await
            .map_err(|error| self.classify(error))?;
        let (_, writer) = context.into_halves();
        let Some(mut writer) = writer else {
            return Err(ConnectionError::IoFailure {
                message: "outbound control stream is not writable".into(),
            });
        };

        let mut preamble = BytesMut::new();
        stream::CONTROL_STREAM_TYPE.encode(&mut preamble);
        preamble.extend_from_slice(&self.server_settings.encode_frame());
        let send = async {
            writer.write_all(&preamble).await?;
            writer.flush().await
        };
        send.await.map_err(|error| ConnectionError::IoFailure {
            message: error.to_string(),
        })?;

        self.control.set_outbound(writer).await;
        tracing::debug!(settings = ?self.server_settings, "control stream opened");
        Ok(())
    }

    async fn accept_streams<S: Service>(
        self: &Arc<Self>,
        service: &Arc<S>,
    ) -> Result<(), ConnectionError> {
        loop {
            if self.shutdown.is_closed() || self.shutdown.graceful_close_started() {
                return Ok(());
            }

            let next = tokio::select! {
                next = self.transport.accept() => next,
                _ = self.drain_kick.notified() => {
                    self.update_connection_state().await;
                    continue;
                }
            };

            let context = match next {
                Ok(Some(context)) => context,
                // The peer will not open further streams; in-flight requests
                // still drain normally.
                Ok(None) => return Ok(()),
                Err(error) => return Err(self.classify(error)),
            };

            self.dispatch(context, service);
            self.update_connection_state().await;
        }
    }

    fn classify(&self, error: TransportError) -> ConnectionError {
        match error {
            TransportError::Reset { code } => {
                tracing::debug!(code, "transport reset by peer");
                ConnectionError::TransportReset
            }
            TransportError::Io { source } => ConnectionError::IoFailure {
                message: source.to_string(),
            },
            TransportError::Aborted => self.error.peek().unwrap_or(ConnectionError::Aborted {
                code: Code::H3_NO_ERROR,
                reason: "the connection was aborted".to_string(),
            }),
        }
    }

    fn dispatch<S: Service>(self: &Arc<Self>, context: StreamContext, service: &Arc<S>) {
        let stream_id = context.stream_id();
        let features = context.features();
        let aborter = context.aborter();
        let (reader, writer) = context.into_halves();

        if !features.can_write {
            let Some(reader) = reader else {
                tracing::debug!(%stream_id, "inbound stream without a read pipe, ignoring");
                return;
            };
            let handle = Arc::new(StreamHandle::inbound(stream_id, aborter));
            self.starting.enqueue(handle.clone());
            let span = tracing::info_span!("inbound_stream", %stream_id);
            tokio::spawn(
                stream::run_inbound_stream(self.clone(), handle, reader).instrument(span),
            );
        } else if features.can_read {
            let (Some(reader), Some(writer)) = (reader, writer) else {
                tracing::debug!(%stream_id, "request stream without both pipes, ignoring");
                return;
            };
            self.highest_opened_request_stream_id
                .fetch_max(stream_id.into_inner(), Ordering::AcqRel);
            let handle = Arc::new(StreamHandle::request(stream_id, aborter));
            self.registry.register(handle.clone());
            self.starting.enqueue(handle.clone());
            let span = tracing::info_span!("request_stream", %stream_id);
            tokio::spawn(
                stream::run_request_stream(self.clone(), handle, reader, writer, service.clone())
                    .instrument(span),
            );
        } else {
            tracing::debug!(%stream_id, "accepted stream with unsupported direction, ignoring");
        }
    }

    /// Run the shutdown state table: the first observer of a non-None
    /// initiator performs the closing actions, and once no requests remain
    /// the `try_close` winner emits the terminal GOAWAY.
    pub(crate) async fn update_connection_state(&self) {
        let Some(initiator) = self.shutdown.initiator() else {
            return;
        };
        if self.shutdown.begin_graceful_close() {
            tracing::debug!("connection closing");
            if initiator == Initiator::Server && self.registry.active_request_count() > 0 {
                // no commitment to a stream id yet, only "stop opening new
                // requests"
                if let Err(error) = self.control.send_goaway(VarInt::MAX).await {
                    tracing::debug!(
                        error = %Report::from_error(error),
                        "failed to send preparatory GOAWAY"
                    );
                }
            }
        }
        if self.registry.active_request_count() == 0
            && self.shutdown.graceful_close_started()
            && let Some(witness) = self.shutdown.try_close()
        {
            self.send_final_goaway(witness).await;
        }
    }

    /// Emit the one terminal GOAWAY, carrying the real high-water stream id.
    /// Requires the close witness, so it can run at most once per connection.
    async fn send_final_goaway(&self, witness: CloseWitness) {
        let highest = self.highest_opened_request_stream_id();
        if let Err(error) = self.control.send_goaway(highest).await {
            tracing::debug!(
                error = %Report::from_error(error),
                "failed to send terminal GOAWAY"
            );
        }
        tracing::debug!(highest_stream_id = %highest, "connection closed");
        drop(witness);
    }

    async fn finalize(&self, loop_result: Result<(), ConnectionError>) -> Result<(), ConnectionError> {
        match loop_result {
            Ok(()) => {
                // graceful path: existing streams may still complete; closure
                // and the terminal GOAWAY follow the last completion
                self.update_connection_state().await;
                self.registry.drained().await;
                self.update_connection_state().await;
                if let Some(witness) = self.shutdown.try_close() {
                    self.send_final_goaway(witness).await;
                }
                self.transport
                    .abort(Code::H3_NO_ERROR, "the connection has finished processing requests");
                Ok(())
            }
            Err(error) => {
                if self.registry.active_request_count() > 0 {
                    tracing::debug!(
                        error = %Report::from_error(error.clone()),
                        "request processing interrupted"
                    );
                }
                if self.error.set(error.clone()).is_ok() {
                    tracing::error!(
                        error = %Report::from_error(error.clone()),
                        "connection faulted"
                    );
                }
                let code = self.error_code().unwrap_or(Code::H3_NO_ERROR);
                self.abort(&error.to_string(), code).await;
                self.registry.abort_all("the connection faulted", code);
                self.registry.drained().await;
                match error {
                    ConnectionError::Aborted { code, .. } if code == Code::H3_NO_ERROR => Ok(()),
                    error => Err(error),
                }
            }
        }
    }
}
