use std::sync::{Arc, Mutex as SyncMutex};

use tokio::sync::mpsc;

use crate::{
    error::{StartupTimeout, StreamError},
    stream::StreamHandle,
};

/// Streams that have been accepted but have not yet delivered their first
/// well-formed frame. Multi-producer (the accept path enqueues), single
/// consumer (the heartbeat tick).
pub(crate) struct StartingStreamQueue {
    queue: mpsc::UnboundedSender<Arc<StreamHandle>>,
    pending: SyncMutex<mpsc::UnboundedReceiver<Arc<StreamHandle>>>,
}

impl StartingStreamQueue {
    pub(crate) fn new() -> Self {
        let (queue, pending) = mpsc::unbounded_channel();
        Self {
            queue,
            pending: SyncMutex::new(pending),
        }
    }

    /// Called exactly once when a stream is created.
    pub(crate) fn enqueue(&self, stream: Arc<StreamHandle>) {
        _ = self.queue.send(stream);
    }

    /// Heartbeat entry point. Processes exactly the elements present at tick
    /// entry, so re-enqueued streams are not re-examined within one tick.
    pub(crate) fn tick(&self, now_ticks: u64, headers_timeout_ticks: u64) {
        let mut pending = self.pending.lock().unwrap();
        let snapshot = pending.len();
        for _ in 0..snapshot {
            let Ok(stream) = pending.try_recv() else {
                break;
            };
            if stream.has_started() {
                continue;
            }
            match stream.expiration_ticks() {
                0 => {
                    // first sighting: arm the deadline
                    stream
                        .set_expiration_ticks(now_ticks.saturating_add(headers_timeout_ticks).max(1));
                    _ = self.queue.send(stream);
                }
                deadline if deadline < now_ticks => {
                    let timeout = if stream.is_request_stream() {
                        StartupTimeout::RequestHeaders
                    } else {
                        StartupTimeout::ControlStreamHeader
                    };
                    stream.abort_with(&StreamError::from(timeout));
                }
                _ => _ = self.queue.send(stream),
            }
        }
    }
}
