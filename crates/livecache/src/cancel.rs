// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! [`CancelHandle`] for terminating registrations and in-flight requests.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;

type CancelFn = Box<dyn FnOnce() + Send>;

/// A token that terminates one subscription, request, or listener registration.
///
/// Cancelling is idempotent: the first call runs the cancellation logic and every
/// later call (including calls after the underlying work already finished) does nothing.
/// Clones share the same underlying token.
///
/// Dropping a handle does **not** cancel it.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use livecache::CancelHandle;
///
/// let calls = Arc::new(AtomicUsize::new(0));
/// let handle = CancelHandle::new({
///     let calls = Arc::clone(&calls);
///     move || {
///         calls.fetch_add(1, Ordering::Relaxed);
///     }
/// });
///
/// handle.cancel();
/// handle.cancel();
/// assert!(handle.is_cancelled());
/// assert_eq!(calls.load(Ordering::Relaxed), 1);
/// ```
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<Mutex<Slot>>,
    retained: Option<Arc<dyn Any + Send + Sync>>,
}

enum Slot {
    Armed(CancelFn),
    Fired,
}

impl CancelHandle {
    /// Creates a handle that runs `on_cancel` the first time it is cancelled.
    pub fn new(on_cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Slot::Armed(Box::new(on_cancel)))),
            retained: None,
        }
    }

    /// Returns a handle to the same token that also keeps `owner` alive while it exists.
    pub(crate) fn retaining(&self, owner: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            retained: Some(owner),
        }
    }

    /// Creates a handle with nothing to cancel.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Cancels the associated work.
    ///
    /// The cancellation logic runs on the calling thread, outside of any lock held by the handle.
    pub fn cancel(&self) {
        let slot = std::mem::replace(&mut *self.inner.lock(), Slot::Fired);
        if let Slot::Armed(on_cancel) = slot {
            on_cancel();
        }
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called on this handle or a clone.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.inner.lock(), Slot::Fired)
    }
}

impl Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    static_assertions::assert_impl_all!(CancelHandle: Send, Sync, Clone);

    #[test]
    fn cancel_runs_once_across_clones() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = CancelHandle::new({
            let calls = Arc::clone(&calls);
            move || {
                calls.fetch_add(1, Ordering::Relaxed);
            }
        });
        let clone = handle.clone();

        assert!(!handle.is_cancelled());
        clone.cancel();
        handle.cancel();

        assert!(handle.is_cancelled());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn drop_does_not_cancel() {
        let calls = Arc::new(AtomicUsize::new(0));
        drop(CancelHandle::new({
            let calls = Arc::clone(&calls);
            move || {
                calls.fetch_add(1, Ordering::Relaxed);
            }
        }));

        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn cancel_may_reenter_the_handle() {
        let handle = CancelHandle::noop();
        let reentrant = CancelHandle::new({
            let handle = handle.clone();
            move || handle.cancel()
        });

        reentrant.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn retaining_shares_the_token_and_keeps_owner_alive() {
        let owner: Arc<dyn Any + Send + Sync> = Arc::new(5_u8);
        let weak = Arc::downgrade(&owner);

        let handle = CancelHandle::noop();
        let retaining = handle.retaining(owner);
        assert!(weak.upgrade().is_some());

        retaining.cancel();
        assert!(handle.is_cancelled());

        drop(retaining);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn debug_reports_state() {
        let handle = CancelHandle::noop();
        assert!(format!("{handle:?}").contains("cancelled: false"));
        handle.cancel();
        assert!(format!("{handle:?}").contains("cancelled: true"));
    }
}
