// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Deterministic test doubles for caches.
//!
//! [`ManualQueue`] is a callback queue that only runs work when asked to, and
//! [`MockConnection`] is a scripted connection whose requests and feeds are answered by the
//! test itself.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::{Arc, Weak};
use std::task::Context;

use futures::channel::{mpsc, oneshot};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::task::{ArcWake, waker_ref};
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;

use crate::{BoxedFuture, CallbackQueue, CancelHandle, Connection, ConnectionState, RequestError, Result, StateListener};

type ReadyList = Mutex<VecDeque<Arc<Task>>>;

struct Task {
    future: Mutex<Option<BoxedFuture>>,
    ready: Weak<ReadyList>,
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if let Some(ready) = arc_self.ready.upgrade() {
            ready.lock().push_back(Arc::clone(arc_self));
        }
    }
}

impl Task {
    fn poll(self: &Arc<Self>) {
        let mut slot = self.future.lock();
        let Some(future) = slot.as_mut() else {
            return;
        };
        let waker = waker_ref(self);
        let mut cx = Context::from_waker(&waker);
        if future.as_mut().poll(&mut cx).is_ready() {
            *slot = None;
        }
    }
}

/// A single-threaded callback queue driven explicitly by the test.
///
/// Dispatched work is queued in FIFO order and only polled by [`run_until_stalled`]. Woken
/// tasks go to the back of the queue.
///
/// [`run_until_stalled`]: Self::run_until_stalled
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// use livecache::testing::ManualQueue;
///
/// let queue = ManualQueue::new();
/// let ran = Arc::new(AtomicBool::new(false));
///
/// queue.queue().dispatch({
///     let ran = Arc::clone(&ran);
///     async move { ran.store(true, Ordering::Relaxed) }
/// });
/// assert!(!ran.load(Ordering::Relaxed));
///
/// assert_eq!(queue.run_until_stalled(), 1);
/// assert!(ran.load(Ordering::Relaxed));
/// ```
pub struct ManualQueue {
    ready: Arc<ReadyList>,
}

impl ManualQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Returns a [`CallbackQueue`] that enqueues onto this queue.
    #[must_use]
    pub fn queue(&self) -> CallbackQueue {
        let ready = Arc::downgrade(&self.ready);
        CallbackQueue::new_custom(move |future| {
            if let Some(list) = ready.upgrade() {
                let task = Arc::new(Task {
                    future: Mutex::new(Some(future)),
                    ready: Weak::clone(&ready),
                });
                list.lock().push_back(task);
            }
        })
    }

    /// Polls queued work in FIFO order until nothing is ready. Returns the number of polls.
    pub fn run_until_stalled(&self) -> usize {
        self.drain(|ready| ready.pop_front())
    }

    /// Like [`run_until_stalled`](Self::run_until_stalled), but always polls the most recently
    /// queued work first.
    pub fn run_newest_first(&self) -> usize {
        self.drain(|ready| ready.pop_back())
    }

    /// Returns the number of tasks waiting to be polled.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.ready.lock().len()
    }

    fn drain(&self, next: impl Fn(&mut VecDeque<Arc<Task>>) -> Option<Arc<Task>>) -> usize {
        let mut polls = 0;
        loop {
            let task = next(&mut self.ready.lock());
            let Some(task) = task else {
                return polls;
            };
            task.poll();
            polls += 1;
        }
    }
}

impl Default for ManualQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for ManualQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualQueue").field("pending", &self.pending()).finish()
    }
}

struct Script<R, E> {
    state: ConnectionState,
    requests: HashMap<String, VecDeque<oneshot::Sender<Result<R>>>>,
    issued: HashMap<String, usize>,
    streams: HashMap<String, Vec<mpsc::UnboundedSender<Result<E>>>>,
    opened: HashMap<String, usize>,
}

impl<R, E> Script<R, E> {
    /// Pops the oldest (or newest) request under `name` whose caller is still waiting.
    fn next_waiting(&mut self, name: &str, newest: bool) -> Option<oneshot::Sender<Result<R>>> {
        let pending = self.requests.get_mut(name)?;
        while let Some(sender) = if newest { pending.pop_back() } else { pending.pop_front() } {
            if !sender.is_canceled() {
                return Some(sender);
            }
        }
        None
    }

    fn open_streams(&mut self, name: &str) -> &mut Vec<mpsc::UnboundedSender<Result<E>>> {
        let streams = self.streams.entry(name.to_owned()).or_default();
        streams.retain(|sender| !sender.is_closed());
        streams
    }
}

#[derive(Default)]
struct Listeners {
    next: u64,
    registered: HashMap<u64, StateListener>,
}

/// A scripted [`Connection`] for tests.
///
/// Requests and streams are keyed by name. [`request`](Self::request) records a pending
/// one-shot request that the test completes with [`respond`](Self::respond) or
/// [`fail`](Self::fail); [`stream`](Self::stream) opens a feed that the test pushes events into
/// with [`publish`](Self::publish). The connection starts out
/// [`Disconnected`](ConnectionState::Disconnected).
///
/// # Examples
///
/// ```
/// use futures::FutureExt;
/// use livecache::testing::{ManualQueue, MockConnection};
///
/// let queue = ManualQueue::new();
/// let connection = MockConnection::<u32, ()>::new(queue.queue());
///
/// let response = connection.request("answer");
/// assert_eq!(connection.pending_requests("answer"), 1);
///
/// assert!(connection.respond("answer", 42));
/// assert_eq!(response.now_or_never().unwrap().unwrap(), 42);
/// ```
pub struct MockConnection<R, E> {
    queue: CallbackQueue,
    script: Mutex<Script<R, E>>,
    listeners: Arc<Mutex<Listeners>>,
}

impl<R, E> MockConnection<R, E>
where
    R: Send + 'static,
    E: Send + 'static,
{
    /// Creates a disconnected mock delivering callbacks on `queue`.
    #[must_use]
    pub fn new(queue: CallbackQueue) -> Self {
        Self {
            queue,
            script: Mutex::new(Script {
                state: ConnectionState::Disconnected,
                requests: HashMap::new(),
                issued: HashMap::new(),
                streams: HashMap::new(),
                opened: HashMap::new(),
            }),
            listeners: Arc::new(Mutex::new(Listeners::default())),
        }
    }

    /// Moves to `state` and invokes every registered state listener.
    pub fn set_state(&self, state: ConnectionState) {
        self.script.lock().state = state;
        let listeners: Vec<StateListener> = self.listeners.lock().registered.values().map(Arc::clone).collect();
        for listener in listeners {
            listener(state);
        }
    }

    /// Issues a one-shot request under `name`.
    ///
    /// The future resolves once the test answers it, or with [`RequestError::Closed`] if the
    /// mock is dropped first.
    pub fn request(&self, name: &str) -> BoxFuture<'static, Result<R>> {
        let (sender, receiver) = oneshot::channel();
        {
            let mut script = self.script.lock();
            script.requests.entry(name.to_owned()).or_default().push_back(sender);
            *script.issued.entry(name.to_owned()).or_default() += 1;
        }
        async move { receiver.await.unwrap_or(Err(RequestError::Closed)) }.boxed()
    }

    /// Opens a feed under `name`.
    pub fn stream(&self, name: &str) -> BoxStream<'static, Result<E>> {
        let (sender, receiver) = mpsc::unbounded();
        {
            let mut script = self.script.lock();
            script.streams.entry(name.to_owned()).or_default().push(sender);
            *script.opened.entry(name.to_owned()).or_default() += 1;
        }
        receiver.boxed()
    }

    /// Answers the oldest outstanding request under `name`. Returns `false` if none is waiting.
    pub fn respond(&self, name: &str, response: R) -> bool {
        self.complete(name, Ok(response), false)
    }

    /// Answers the most recent outstanding request under `name`, leaving older ones waiting.
    pub fn respond_newest(&self, name: &str, response: R) -> bool {
        self.complete(name, Ok(response), true)
    }

    /// Fails the oldest outstanding request under `name`. Returns `false` if none is waiting.
    pub fn fail(&self, name: &str, error: RequestError) -> bool {
        self.complete(name, Err(error), false)
    }

    /// Pushes an error item into the most recently opened feed under `name`.
    ///
    /// Returns `false` if no feed under `name` is open.
    pub fn publish_error(&self, name: &str, error: RequestError) -> bool {
        let mut script = self.script.lock();
        script
            .open_streams(name)
            .last()
            .is_some_and(|sender| sender.unbounded_send(Err(error)).is_ok())
    }

    /// Ends every open feed under `name`.
    pub fn close_streams(&self, name: &str) {
        let closed = self.script.lock().streams.remove(name);
        drop(closed);
    }

    /// Returns how many requests were issued under `name` so far.
    #[must_use]
    pub fn request_count(&self, name: &str) -> usize {
        self.script.lock().issued.get(name).copied().unwrap_or_default()
    }

    /// Returns how many requests under `name` are still awaiting an answer.
    #[must_use]
    pub fn pending_requests(&self, name: &str) -> usize {
        self.script
            .lock()
            .requests
            .get(name)
            .map_or(0, |pending| pending.iter().filter(|sender| !sender.is_canceled()).count())
    }

    /// Returns how many feeds were opened under `name` so far.
    #[must_use]
    pub fn stream_count(&self, name: &str) -> usize {
        self.script.lock().opened.get(name).copied().unwrap_or_default()
    }

    /// Returns how many feeds under `name` are still being read.
    #[must_use]
    pub fn open_streams(&self, name: &str) -> usize {
        self.script.lock().open_streams(name).len()
    }

    fn complete(&self, name: &str, outcome: Result<R>, newest: bool) -> bool {
        let sender = self.script.lock().next_waiting(name, newest);
        sender.is_some_and(|sender| sender.send(outcome).is_ok())
    }
}

impl<R, E> MockConnection<R, E>
where
    R: Send + 'static,
    E: Clone + Send + 'static,
{
    /// Pushes `event` into every open feed under `name`. Returns the number of feeds reached.
    pub fn publish(&self, name: &str, event: E) -> usize {
        let mut script = self.script.lock();
        script
            .open_streams(name)
            .iter()
            .filter(|sender| sender.unbounded_send(Ok(event.clone())).is_ok())
            .count()
    }
}

impl<R, E> Connection for MockConnection<R, E>
where
    R: Send + 'static,
    E: Send + 'static,
{
    fn state(&self) -> ConnectionState {
        self.script.lock().state
    }

    fn watch_state(&self, listener: StateListener) -> CancelHandle {
        let id = {
            let mut listeners = self.listeners.lock();
            let id = listeners.next;
            listeners.next += 1;
            listeners.registered.insert(id, listener);
            id
        };

        let listeners = Arc::downgrade(&self.listeners);
        CancelHandle::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.lock().registered.remove(&id);
            }
        })
    }

    fn callback_queue(&self) -> CallbackQueue {
        self.queue.clone()
    }
}

impl<R, E> Debug for MockConnection<R, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let script = self.script.lock();
        f.debug_struct("MockConnection")
            .field("state", &script.state)
            .field("issued", &script.issued)
            .field("opened", &script.opened)
            .field("listeners", &self.listeners.lock().registered.len())
            .finish_non_exhaustive()
    }
}
