use std::{
    collections::HashMap,
    sync::{Arc, Mutex as SyncMutex},
};

use tokio::sync::Notify;

use crate::{error::Code, stream::StreamHandle, varint::VarInt};

/// The set of request streams that have been accepted and not yet completed.
/// The map and the active count live under one lock, held only for O(1)
/// operations; completions wake the drain loop through an edge-triggered
/// signal.
pub(crate) struct StreamRegistry {
    streams: SyncMutex<HashMap<u64, Arc<StreamHandle>>>,
    completed: Notify,
}

impl StreamRegistry {
    pub(crate) fn new() -> Self {
        Self {
            streams: SyncMutex::new(HashMap::new()),
            completed: Notify::new(),
        }
    }

    pub(crate) fn register(&self, stream: Arc<StreamHandle>) {
        let mut streams = self.streams.lock().unwrap();
        streams.insert(stream.stream_id().into_inner(), stream);
    }

    /// Remove the stream and wake the drain loop. Returns whether the stream
    /// was still registered.
    pub(crate) fn on_stream_completed(&self, stream_id: VarInt) -> bool {
        let removed = {
            let mut streams = self.streams.lock().unwrap();
            streams.remove(&stream_id.into_inner()).is_some()
        };
        if removed {
            self.completed.notify_waiters();
        }
        removed
    }

    pub(crate) fn active_request_count(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    /// Wait until every registered request stream has completed.
    pub(crate) async fn drained(&self) {
        loop {
            let completed = self.completed.notified();
            if self.active_request_count() == 0 {
                return;
            }
            completed.await;
        }
    }

    pub(crate) fn abort_all(&self, reason: &str, code: Code) {
        let streams: Vec<_> = {
            let streams = self.streams.lock().unwrap();
            streams.values().cloned().collect()
        };
        for stream in streams {
            stream.abort(reason, code);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::quic::test::AbortState;

    fn handle(stream_id: u64) -> (Arc<StreamHandle>, Arc<AbortState>) {
        let state = Arc::new(AbortState::new());
        let handle = Arc::new(StreamHandle::request(
            VarInt::from_u64(stream_id).unwrap(),
            state.clone(),
        ));
        (handle, state)
    }

    #[test]
    fn count_tracks_registration_and_completion() {
        let registry = StreamRegistry::new();
        let (zero, _) = handle(0);
        let (four, _) = handle(4);
        registry.register(zero);
        registry.register(four);
        assert_eq!(registry.active_request_count(), 2);

        assert!(registry.on_stream_completed(VarInt::from_u32(0)));
        assert_eq!(registry.active_request_count(), 1);
        // completing twice is a no-op
        assert!(!registry.on_stream_completed(VarInt::from_u32(0)));
        assert_eq!(registry.active_request_count(), 1);
    }

    #[tokio::test]
    async fn drained_waits_for_the_last_completion() {
        let registry = Arc::new(StreamRegistry::new());
        let (stream, _) = handle(0);
        registry.register(stream);

        let drain = tokio::spawn({
            let registry = registry.clone();
            async move { registry.drained().await }
        });
        tokio::task::yield_now().await;
        assert!(!drain.is_finished());

        registry.on_stream_completed(VarInt::from_u32(0));
        tokio::time::timeout(Duration::from_secs(1), drain)
            .await
            .expect("drain must wake on completion")
            .unwrap();
    }

    #[test]
    fn abort_all_reaches_every_stream() {
        let registry = StreamRegistry::new();
        let (zero, zero_aborts) = handle(0);
        let (four, four_aborts) = handle(4);
        registry.register(zero);
        registry.register(four);

        registry.abort_all("connection faulted", Code::H3_INTERNAL_ERROR);
        assert_eq!(zero_aborts.first_code(), Some(Code::H3_INTERNAL_ERROR));
        assert_eq!(four_aborts.first_code(), Some(Code::H3_INTERNAL_ERROR));
    }
}
