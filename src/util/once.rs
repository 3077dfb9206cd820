use std::sync::{
    Mutex as SyncMutex,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::Notify;

/// A write-once slot. The first `set` wins; `get` waits until a value is
/// present.
pub(crate) struct SetOnce<T> {
    value: SyncMutex<Option<T>>,
    notify: Notify,
}

impl<T> SetOnce<T> {
    pub(crate) fn new() -> Self {
        Self {
            value: SyncMutex::new(None),
            notify: Notify::new(),
        }
    }

    pub(crate) fn set(&self, value: T) -> Result<(), T> {
        let mut guard = self.value.lock().unwrap();
        if guard.is_some() {
            return Err(value);
        }
        *guard = Some(value);
        drop(guard);
        self.notify.notify_waiters();
        Ok(())
    }

    pub(crate) fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.value.lock().unwrap().clone()
    }

    pub(crate) async fn get(&self) -> T
    where
        T: Clone,
    {
        loop {
            let notified = self.notify.notified();
            if let Some(value) = self.peek() {
                return value;
            }
            notified.await;
        }
    }
}

/// A single 0→1 transition. The caller that wins the exchange receives a
/// [`Witness`], granting it alone the right to run the guarded action.
pub(crate) struct FlagOnce {
    flag: AtomicBool,
}

/// Proof of having performed a [`FlagOnce`] transition. Deliberately neither
/// `Clone` nor `Copy`.
pub(crate) struct Witness(());

impl FlagOnce {
    pub(crate) fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }

    pub(crate) fn transition(&self) -> Option<Witness> {
        self.flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Witness(()))
    }

    pub(crate) fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn set_once_first_writer_wins() {
        let slot = SetOnce::new();
        assert!(slot.set(1).is_ok());
        assert_eq!(slot.set(2), Err(2));
        assert_eq!(slot.peek(), Some(1));
    }

    #[tokio::test]
    async fn get_waits_for_the_value() {
        let slot = Arc::new(SetOnce::new());
        let waiter = tokio::spawn({
            let slot = slot.clone();
            async move { slot.get().await }
        });
        tokio::task::yield_now().await;
        slot.set("ready").unwrap();
        assert_eq!(waiter.await.unwrap(), "ready");
    }

    #[test]
    fn exactly_one_witness_is_issued() {
        let flag = Arc::new(FlagOnce::new());
        let winners: usize = std::thread::scope(|scope| {
            (0..8)
                .map(|_| {
                    let flag = flag.clone();
                    scope.spawn(move || flag.transition().is_some())
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|handle| handle.join().unwrap() as usize)
                .sum()
        });
        assert_eq!(winners, 1);
        assert!(flag.is_set());
        assert!(flag.transition().is_none());
    }
}
