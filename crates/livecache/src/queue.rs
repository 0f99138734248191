// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! [`CallbackQueue`] for delivering notifications and driving requests.

use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;

/// A boxed, pinned future handed to custom queues.
pub type BoxedFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

type DispatchFn = dyn Fn(BoxedFuture) + Send + Sync;

/// The execution context on which a cache runs its work.
///
/// Every subscriber callback is delivered through the queue, never inline on the thread that
/// changed the value. Populate and subscribe requests are driven on the same queue.
///
/// Both single-threaded cooperative and multi-threaded queues are valid.
///
/// # Examples
///
/// Using Tokio:
///
/// ```rust
/// # #[cfg(feature = "tokio")]
/// # #[tokio::main]
/// # async fn main() {
/// use livecache::CallbackQueue;
///
/// let queue = CallbackQueue::new_tokio();
/// let (tx, rx) = tokio::sync::oneshot::channel();
/// queue.dispatch(async move {
///     tx.send(42).unwrap();
/// });
/// assert_eq!(rx.await.unwrap(), 42);
/// # }
/// # #[cfg(not(feature = "tokio"))]
/// # fn main() {}
/// ```
///
/// ## Custom Runtime
///
/// Any executor works as long as it eventually polls what it is handed. This one collects
/// work and runs it when asked:
///
/// ```rust
/// use std::sync::Arc;
///
/// use livecache::{BoxedFuture, CallbackQueue, ReactiveCache};
/// use parking_lot::Mutex;
///
/// let inbox: Arc<Mutex<Vec<BoxedFuture>>> = Arc::default();
/// let queue = CallbackQueue::new_custom({
///     let inbox = Arc::clone(&inbox);
///     move |work| inbox.lock().push(work)
/// });
///
/// let greeting = ReactiveCache::constant("hello", queue);
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let subscription = greeting.subscribe({
///     let seen = Arc::clone(&seen);
///     move |_, value| seen.lock().push(value)
/// });
/// assert!(seen.lock().is_empty(), "callbacks never run inline");
///
/// let work = std::mem::take(&mut *inbox.lock());
/// for task in work {
///     futures::executor::block_on(task);
/// }
/// assert_eq!(*seen.lock(), vec!["hello"]);
/// subscription.cancel();
/// ```
#[derive(Debug, Clone)]
pub struct CallbackQueue(QueueKind);

#[derive(Clone)]
enum QueueKind {
    #[cfg(feature = "tokio")]
    Tokio(::tokio::runtime::Handle),
    Custom(Arc<DispatchFn>),
}

impl CallbackQueue {
    /// Creates a queue that spawns onto the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context.
    #[must_use]
    #[cfg(feature = "tokio")]
    #[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
    pub fn new_tokio() -> Self {
        Self::from_tokio_handle(::tokio::runtime::Handle::current())
    }

    /// Creates a queue that spawns onto the runtime behind `handle`.
    #[must_use]
    #[cfg(feature = "tokio")]
    #[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
    pub fn from_tokio_handle(handle: ::tokio::runtime::Handle) -> Self {
        Self(QueueKind::Tokio(handle))
    }

    /// Creates a queue from a closure.
    ///
    /// The closure receives a boxed, pinned future and is responsible for running it to
    /// completion on the appropriate executor. It must not poll the future inline.
    pub fn new_custom<F>(f: F) -> Self
    where
        F: Fn(BoxedFuture) + Send + Sync + 'static,
    {
        Self(QueueKind::Custom(Arc::new(f)))
    }

    /// Schedules `work` to run on the queue, fire-and-forget.
    pub fn dispatch(&self, work: impl Future<Output = ()> + Send + 'static) {
        match &self.0 {
            #[cfg(feature = "tokio")]
            QueueKind::Tokio(handle) => {
                drop(handle.spawn(work));
            }
            QueueKind::Custom(f) => f(Box::pin(work)),
        }
    }
}

impl Debug for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "tokio")]
            Self::Tokio(_) => f.write_str("Tokio"),
            Self::Custom(_) => f.debug_struct("Custom").finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    static_assertions::assert_impl_all!(CallbackQueue: Send, Sync, Clone);

    #[test]
    fn custom_queue_receives_work_without_running_it() {
        let pending: Arc<Mutex<Vec<BoxedFuture>>> = Arc::default();
        let queue = CallbackQueue::new_custom({
            let pending = Arc::clone(&pending);
            move |fut| pending.lock().push(fut)
        });

        let ran = Arc::new(Mutex::new(false));
        queue.dispatch({
            let ran = Arc::clone(&ran);
            async move { *ran.lock() = true }
        });

        assert!(!*ran.lock());
        let work = pending.lock().pop().unwrap();
        futures::executor::block_on(work);
        assert!(*ran.lock());
    }

    #[test]
    fn custom_queue_debug() {
        let queue = CallbackQueue::new_custom(|_| {});
        assert!(format!("{queue:?}").contains("Custom"));
    }

    #[cfg(feature = "tokio")]
    #[tokio::test]
    async fn tokio_queue_runs_work() {
        let queue = CallbackQueue::new_tokio();
        let (tx, rx) = tokio::sync::oneshot::channel();
        queue.dispatch(async move {
            tx.send(7).unwrap();
        });
        assert_eq!(rx.await.unwrap(), 7);
    }
}
