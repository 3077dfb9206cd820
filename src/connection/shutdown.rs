use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::util::once::{FlagOnce, Witness};

/// Which side initiated graceful close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    Server,
    Client,
}

/// Proof of having won the 0→1 exchange on `is_closed`. Required to emit the
/// terminal GOAWAY, which makes the at-most-once property structural.
pub(crate) struct CloseWitness(#[allow(dead_code)] Witness);

/// The state machine joining "accepting streams" with "draining" with
/// "closed". All transitions are single-shot.
pub(crate) struct ShutdownCoordinator {
    /// 0 = none, 1 = server, 2 = client.
    initiator: AtomicU8,
    graceful_close_started: AtomicBool,
    closed: FlagOnce,
}

impl ShutdownCoordinator {
    pub(crate) fn new() -> Self {
        Self {
            initiator: AtomicU8::new(0),
            graceful_close_started: AtomicBool::new(false),
            closed: FlagOnce::new(),
        }
    }

    /// Record graceful-close intent. Only the first initiator sticks.
    pub(crate) fn initiate(&self, initiator: Initiator) {
        let value = match initiator {
            Initiator::Server => 1,
            Initiator::Client => 2,
        };
        _ = self
            .initiator
            .compare_exchange(0, value, Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn initiator(&self) -> Option<Initiator> {
        match self.initiator.load(Ordering::Acquire) {
            0 => None,
            1 => Some(Initiator::Server),
            _ => Some(Initiator::Client),
        }
    }

    /// Returns true for exactly one caller once an initiator is set; that
    /// caller runs the closing actions (log, preparatory GOAWAY).
    pub(crate) fn begin_graceful_close(&self) -> bool {
        !self.graceful_close_started.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn graceful_close_started(&self) -> bool {
        self.graceful_close_started.load(Ordering::Acquire)
    }

    /// The atomic 0→1 exchange on `is_closed`. The winner alone receives the
    /// witness granting the terminal GOAWAY.
    pub(crate) fn try_close(&self) -> Option<CloseWitness> {
        self.closed.transition().map(CloseWitness)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_set()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn first_initiator_sticks() {
        let shutdown = ShutdownCoordinator::new();
        assert_eq!(shutdown.initiator(), None);
        shutdown.initiate(Initiator::Client);
        shutdown.initiate(Initiator::Server);
        assert_eq!(shutdown.initiator(), Some(Initiator::Client));
    }

    #[test]
    fn graceful_close_starts_once() {
        let shutdown = ShutdownCoordinator::new();
        assert!(shutdown.begin_graceful_close());
        assert!(!shutdown.begin_graceful_close());
        assert!(shutdown.graceful_close_started());
    }

    #[test]
    fn try_close_has_a_single_winner_across_threads() {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let winners: usize = std::thread::scope(|scope| {
            (0..8)
                .map(|_| {
                    let shutdown = shutdown.clone();
                    scope.spawn(move || shutdown.try_close().is_some())
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|handle| handle.join().unwrap() as usize)
                .sum()
        });
        assert_eq!(winners, 1);
        assert!(shutdown.is_closed());
    }
}
