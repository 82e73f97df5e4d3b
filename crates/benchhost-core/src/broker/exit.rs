//! Process-exit notification with explicit subscriptions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct ExitInner {
    exited: AtomicBool,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Callback>>,
}

/// Published once when a worker process exits.
///
/// Cloning shares the same underlying signal.
#[derive(Clone, Default)]
pub struct ProcessExit {
    inner: Arc<ExitInner>,
}

impl ProcessExit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_exited(&self) -> bool {
        self.inner.exited.load(Ordering::Acquire)
    }

    /// Mark the process as exited and run every subscriber once.
    /// Later calls do nothing.
    pub fn notify_exited(&self) {
        let subscribers = {
            let mut map = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.inner.exited.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *map)
        };
        for callback in subscribers.into_values() {
            callback();
        }
    }

    /// Run `callback` on exit, or right away if the process already exited.
    ///
    /// Dropping the returned subscription detaches the callback.
    pub fn subscribe(&self, callback: impl FnOnce() + Send + 'static) -> ExitSubscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut map = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !self.inner.exited.load(Ordering::Acquire) {
                map.insert(id, Box::new(callback));
                return ExitSubscription {
                    id,
                    inner: Arc::downgrade(&self.inner),
                };
            }
        }
        callback();
        ExitSubscription {
            id,
            inner: Weak::new(),
        }
    }

    fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl std::fmt::Debug for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessExit")
            .field("exited", &self.has_exited())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Keeps a [`ProcessExit`] callback attached until dropped.
#[derive(Debug)]
pub struct ExitSubscription {
    id: u64,
    inner: Weak<ExitInner>,
}

impl Drop for ExitSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hit = Arc::clone(&count);
        (count, move || {
            hit.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn subscribers_run_once_on_exit() {
        let exit = ProcessExit::new();
        let (count, callback) = counter();
        let _sub = exit.subscribe(callback);

        assert!(!exit.has_exited());
        exit.notify_exited();
        exit.notify_exited();
        assert!(exit.has_exited());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_subscriber_runs_immediately() {
        let exit = ProcessExit::new();
        exit.notify_exited();
        let (count, callback) = counter();
        let _sub = exit.subscribe(callback);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_subscription_is_detached() {
        let exit = ProcessExit::new();
        let (count, callback) = counter();
        let sub = exit.subscribe(callback);
        assert_eq!(exit.subscriber_count(), 1);
        drop(sub);
        assert_eq!(exit.subscriber_count(), 0);

        exit.notify_exited();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn clones_share_state() {
        let exit = ProcessExit::new();
        let (count, callback) = counter();
        let _sub = exit.clone().subscribe(callback);
        exit.clone().notify_exited();
        assert!(exit.has_exited());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscription_may_outlive_signal() {
        let exit = ProcessExit::new();
        let (_count, callback) = counter();
        let sub = exit.subscribe(callback);
        drop(exit);
        drop(sub);
    }
}
