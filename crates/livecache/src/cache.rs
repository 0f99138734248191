// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The reactive cache type and the state machine behind it.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::builder::ReactiveCacheBuilder;
use crate::request::{Apply, Classify};
use crate::{CallbackQueue, CancelHandle, Connection, PopulateRequest, Update, derived};

/// Type alias for cache names used in logs.
pub type CacheName = &'static str;

pub(crate) const DEFAULT_NAME: CacheName = "reactive_cache";

/// Monotonic counter bumped on every commit to the current value.
pub(crate) type Version = u64;

/// Identifies one activation; completions carrying an older epoch are dropped.
pub(crate) type Epoch = u64;

/// Key of one outstanding request within an activation.
pub(crate) type RequestId = u64;

type Callback<V> = Box<dyn Fn(&CancelHandle, V, Version) + Send + Sync>;

/// Starts the work that keeps a cache synchronized with its source.
pub(crate) trait Activator<V>: Send + Sync {
    /// Returns the handles of everything started, or `None` if activation has to wait.
    fn activate(&self, cache: &Arc<Shared<V>>, epoch: Epoch) -> Option<Vec<CancelHandle>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Inactive,
    Activating,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SubscriberId(u64);

struct Subscriber<V> {
    handle: CancelHandle,
    callback: Callback<V>,
    inbox: Mutex<Inbox<V>>,
}

/// Per-subscriber delivery bookkeeping. The lock is never held while `callback` runs.
struct Inbox<V> {
    /// Last version handed to the callback.
    delivered: Version,
    /// Newest value that arrived while the callback was busy.
    pending: Option<(V, Version)>,
    running: bool,
}

impl<V> Inbox<V> {
    const fn new() -> Self {
        Self {
            delivered: 0,
            pending: None,
            running: false,
        }
    }
}

struct State<V> {
    current: Option<V>,
    version: Version,
    subscribers: HashMap<SubscriberId, Arc<Subscriber<V>>>,
    next_subscriber: u64,
    reset_when_unobserved: bool,
    phase: Phase,
    epoch: Epoch,
    active_requests: HashMap<RequestId, CancelHandle>,
    next_request: RequestId,
    activation_requested: bool,
}

/// A pending fan-out of one committed value.
struct Notification<V> {
    value: V,
    version: Version,
    targets: Vec<(SubscriberId, Arc<Subscriber<V>>)>,
}

/// The result of applying one classified feed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FeedOutcome {
    /// The feed belongs to a torn-down activation and should stop.
    Stale,
    /// The event was applied or ignored.
    Handled,
    /// The event asks for a fresh populate.
    Repopulate,
}

pub(crate) struct Shared<V> {
    name: CacheName,
    queue: CallbackQueue,
    activator: Option<Box<dyn Activator<V>>>,
    state: Mutex<State<V>>,
    watch: Mutex<Option<CancelHandle>>,
}

impl<V> Shared<V>
where
    V: Clone + Send + 'static,
{
    pub(crate) fn new(
        name: CacheName,
        queue: CallbackQueue,
        activator: Option<Box<dyn Activator<V>>>,
        initial: Option<V>,
        reset_when_unobserved: bool,
    ) -> Self {
        let version = Version::from(initial.is_some());
        Self {
            name,
            queue,
            activator,
            state: Mutex::new(State {
                current: initial,
                version,
                subscribers: HashMap::new(),
                next_subscriber: 0,
                reset_when_unobserved,
                phase: Phase::Inactive,
                epoch: 0,
                active_requests: HashMap::new(),
                next_request: 0,
                activation_requested: false,
            }),
            watch: Mutex::new(None),
        }
    }

    pub(crate) fn name(&self) -> CacheName {
        self.name
    }

    pub(crate) fn queue(&self) -> &CallbackQueue {
        &self.queue
    }

    pub(crate) fn set_watch(&self, watch: CancelHandle) {
        if let Some(previous) = self.watch.lock().replace(watch) {
            previous.cancel();
        }
    }

    pub(crate) fn current_value(&self) -> Option<V> {
        self.state.lock().current.clone()
    }

    pub(crate) fn snapshot(&self) -> Option<(V, Version)> {
        let state = self.state.lock();
        state.current.clone().map(|value| (value, state.version))
    }

    fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    fn is_active(&self) -> bool {
        self.state.lock().phase != Phase::Inactive
    }

    fn is_subscribed(&self, id: SubscriberId) -> bool {
        self.state.lock().subscribers.contains_key(&id)
    }

    fn set_reset_policy(&self, reset_when_unobserved: bool) {
        let released = {
            let mut state = self.state.lock();
            state.reset_when_unobserved = reset_when_unobserved;
            self.take_reset(&mut state)
        };
        cancel_all(released);
    }

    pub(crate) fn subscribe_with(self: &Arc<Self>, callback: Callback<V>) -> CancelHandle {
        let weak = Arc::downgrade(self);
        let (handle, replay) = {
            let mut state = self.state.lock();
            let id = SubscriberId(state.next_subscriber);
            state.next_subscriber += 1;

            let handle = CancelHandle::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.unsubscribe(id);
                }
            });
            let subscriber = Arc::new(Subscriber {
                handle: handle.clone(),
                callback,
                inbox: Mutex::new(Inbox::new()),
            });
            state.subscribers.insert(id, Arc::clone(&subscriber));

            let replay = state.current.clone().map(|value| Notification {
                value,
                version: state.version,
                targets: vec![(id, subscriber)],
            });
            (handle, replay)
        };

        if let Some(replay) = replay {
            self.notify(replay);
        }
        self.try_activate();

        let owner: Arc<dyn std::any::Any + Send + Sync> = Arc::clone(self) as _;
        handle.retaining(owner)
    }

    fn unsubscribe(&self, id: SubscriberId) {
        let released = {
            let mut state = self.state.lock();
            if state.subscribers.remove(&id).is_none() {
                return;
            }
            self.take_reset(&mut state)
        };
        cancel_all(released);
    }

    /// Clears the value and hands back every request handle when the reset condition holds.
    fn take_reset(&self, state: &mut State<V>) -> HashMap<RequestId, CancelHandle> {
        let resettable = self.activator.is_some() && state.reset_when_unobserved && state.subscribers.is_empty();
        if !resettable || (state.phase == Phase::Inactive && state.current.is_none() && state.active_requests.is_empty()) {
            return HashMap::new();
        }

        tracing::debug!(cache = self.name, requests = state.active_requests.len(), "resetting unobserved cache");
        state.current = None;
        state.phase = Phase::Inactive;
        state.epoch += 1;
        state.activation_requested = false;
        std::mem::take(&mut state.active_requests)
    }

    /// Starts the activator if subscribers exist and nothing is active yet.
    pub(crate) fn try_activate(self: &Arc<Self>) {
        let Some(activator) = &self.activator else {
            return;
        };

        let epoch = {
            let mut state = self.state.lock();
            if state.subscribers.is_empty() {
                return;
            }
            match state.phase {
                Phase::Inactive => state.phase = Phase::Activating,
                Phase::Activating => {
                    state.activation_requested = true;
                    return;
                }
                Phase::Active => return,
            }
            state.epoch
        };

        loop {
            let started = activator.activate(self, epoch);

            let mut state = self.state.lock();
            if state.epoch != epoch {
                drop(state);
                for handle in started.unwrap_or_default() {
                    handle.cancel();
                }
                return;
            }

            if let Some(handles) = started {
                tracing::debug!(cache = self.name, requests = handles.len(), "cache activated");
                for handle in handles {
                    state.insert_request(handle);
                }
                state.phase = Phase::Active;
                return;
            }

            if std::mem::take(&mut state.activation_requested) && !state.subscribers.is_empty() {
                continue;
            }

            tracing::debug!(cache = self.name, "activation deferred until the source is ready");
            state.phase = Phase::Inactive;
            return;
        }
    }

    /// Tears down the activation identified by `epoch` while keeping the current value.
    pub(crate) fn deactivate(&self, epoch: Epoch) {
        let released = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return;
            }
            state.phase = Phase::Inactive;
            state.epoch += 1;
            std::mem::take(&mut state.active_requests)
        };
        cancel_all(released);
    }

    /// Records a request handle started on behalf of `epoch`.
    ///
    /// Returns the key to pass to [`Shared::untrack`] once the request completes, or `None`
    /// after cancelling the handle if the activation is already gone.
    pub(crate) fn track(&self, epoch: Epoch, handle: CancelHandle) -> Option<RequestId> {
        let mut state = self.state.lock();
        if state.epoch == epoch {
            Some(state.insert_request(handle))
        } else {
            drop(state);
            handle.cancel();
            None
        }
    }

    /// Forgets a completed request of `epoch` without cancelling it.
    pub(crate) fn untrack(&self, epoch: Epoch, id: RequestId) {
        let mut state = self.state.lock();
        if state.epoch == epoch {
            state.active_requests.remove(&id);
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_requests(&self) -> usize {
        self.state.lock().active_requests.len()
    }

    /// Applies a populate response. Returns `false` if the activation is gone.
    pub(crate) fn populated(self: &Arc<Self>, epoch: Epoch, apply: Apply<V>) -> bool {
        let notification = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                tracing::debug!(cache = self.name, "dropping populate response of a torn-down activation");
                return false;
            }
            let next = apply(state.current.as_ref());
            Self::commit(&mut state, next)
        };

        tracing::debug!(cache = self.name, version = notification.version, "populate applied");
        self.notify(notification);
        true
    }

    /// Applies one classified feed event.
    pub(crate) fn classified(self: &Arc<Self>, epoch: Epoch, classify: Classify<V>) -> FeedOutcome {
        let notification = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return FeedOutcome::Stale;
            }
            let Some(current) = state.current.as_ref() else {
                tracing::error!(cache = self.name, "feed event arrived before the cache was populated; skipping it");
                return FeedOutcome::Handled;
            };
            match classify(current) {
                Update::Ignore => return FeedOutcome::Handled,
                Update::Repopulate => return FeedOutcome::Repopulate,
                Update::Replace(value) => Self::commit(&mut state, value),
            }
        };

        self.notify(notification);
        FeedOutcome::Handled
    }

    /// Replaces the value on behalf of `epoch`. Returns `false` if the activation is gone.
    pub(crate) fn replace(self: &Arc<Self>, epoch: Epoch, value: V) -> bool {
        let notification = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return false;
            }
            Self::commit(&mut state, value)
        };

        self.notify(notification);
        true
    }

    fn commit(state: &mut State<V>, value: V) -> Notification<V> {
        state.current = Some(value.clone());
        state.version += 1;
        Notification {
            value,
            version: state.version,
            targets: state
                .subscribers
                .iter()
                .map(|(id, subscriber)| (*id, Arc::clone(subscriber)))
                .collect(),
        }
    }

    /// Dispatches one queue task per target. Must be called without the state lock held.
    fn notify(self: &Arc<Self>, notification: Notification<V>) {
        let Notification { value, version, targets } = notification;
        for (id, subscriber) in targets {
            let weak = Arc::downgrade(self);
            let value = value.clone();
            self.queue.dispatch(async move { deliver(&weak, id, &subscriber, value, version) });
        }
    }
}

fn deliver<V>(cache: &Weak<Shared<V>>, id: SubscriberId, subscriber: &Subscriber<V>, value: V, version: Version)
where
    V: Clone + Send + 'static,
{
    {
        let mut inbox = subscriber.inbox.lock();
        let newest = inbox.pending.as_ref().map_or(inbox.delivered, |(_, pending)| *pending);
        if version <= newest {
            return;
        }
        inbox.pending = Some((value, version));
        // A callback already in flight picks the value up when it returns.
        if inbox.running {
            return;
        }
        inbox.running = true;
    }

    let cache = cache.upgrade();
    loop {
        let next = {
            let mut inbox = subscriber.inbox.lock();
            let next = inbox.pending.take();
            match &next {
                Some((_, version)) => inbox.delivered = *version,
                None => inbox.running = false,
            }
            next
        };
        let Some((value, version)) = next else {
            return;
        };
        if cache.as_ref().is_some_and(|cache| cache.is_subscribed(id)) {
            (subscriber.callback)(&subscriber.handle, value, version);
        }
    }
}

impl<V> State<V> {
    fn insert_request(&mut self, handle: CancelHandle) -> RequestId {
        let id = self.next_request;
        self.next_request += 1;
        self.active_requests.insert(id, handle);
        id
    }
}

fn cancel_all(handles: HashMap<RequestId, CancelHandle>) {
    for handle in handles.into_values() {
        handle.cancel();
    }
}

impl<V> Drop for Shared<V> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.subscribers.is_empty() {
            tracing::warn!(
                cache = self.name,
                subscribers = state.subscribers.len(),
                "cache dropped while it still had subscribers; cancel subscriptions before releasing the cache"
            );
        }
        cancel_all(std::mem::take(&mut state.active_requests));
        if let Some(watch) = self.watch.get_mut().take() {
            watch.cancel();
        }
    }
}

/// A thread-safe cache holding the latest value of an external data source.
///
/// A cache is created in one of three ways:
///
/// - [`ReactiveCache::builder`] ties it to a [`Connection`]. While the cache has subscribers
///   and the connection is ready, it populates once and then follows one or more live feeds.
/// - [`ReactiveCache::map`] derives it from another cache through a pure transform.
/// - [`ReactiveCache::constant`] fixes its value forever.
///
/// Subscribers are notified asynchronously on the cache's [`CallbackQueue`], never inline and
/// never while the cache's lock is held, so callbacks may freely call back into the cache.
///
/// Cloning a `ReactiveCache` yields another handle to the same cache. The cache is torn down
/// once the last clone and the last subscription handle are gone.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use livecache::ReactiveCache;
/// use livecache::testing::ManualQueue;
/// use parking_lot::Mutex;
///
/// let queue = ManualQueue::new();
/// let cache = ReactiveCache::constant(42, queue.queue());
///
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let subscription = cache.subscribe({
///     let seen = Arc::clone(&seen);
///     move |_, value| seen.lock().push(value)
/// });
///
/// // Nothing is delivered inline.
/// assert!(seen.lock().is_empty());
///
/// queue.run_until_stalled();
/// assert_eq!(*seen.lock(), vec![42]);
/// subscription.cancel();
/// ```
pub struct ReactiveCache<V> {
    shared: Arc<Shared<V>>,
}

impl<V> ReactiveCache<V> {
    pub(crate) fn from_shared(shared: Arc<Shared<V>>) -> Self {
        Self { shared }
    }
}

impl<V> ReactiveCache<V>
where
    V: Clone + Send + 'static,
{
    /// Creates a builder for a cache kept live through `connection`.
    ///
    /// The cache delivers callbacks on the connection's [`Connection::callback_queue`].
    #[must_use]
    pub fn builder<C>(connection: &Arc<C>, populate: PopulateRequest<C, V>) -> ReactiveCacheBuilder<C, V>
    where
        C: Connection,
    {
        ReactiveCacheBuilder::new(connection, populate)
    }

    /// Creates a cache whose value is `value` forever.
    ///
    /// Constant caches never activate anything and never reset.
    #[must_use]
    pub fn constant(value: V, queue: CallbackQueue) -> Self {
        Self::from_shared(Arc::new(Shared::new(DEFAULT_NAME, queue, None, Some(value), false)))
    }

    /// Returns the name used for this cache in logs.
    #[must_use]
    pub fn name(&self) -> CacheName {
        self.shared.name()
    }

    /// Returns a snapshot of the current value, if any.
    #[must_use]
    pub fn current_value(&self) -> Option<V> {
        self.shared.current_value()
    }

    /// Returns the number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscriber_count()
    }

    /// Returns `true` while the cache has started (or is starting) requests to stay live.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    /// Sets whether losing the last subscriber resets the cache.
    ///
    /// A reset cancels every outstanding request and clears the current value; the next
    /// subscriber triggers a fresh populate. Enabling the policy while the cache has no
    /// subscribers resets it immediately.
    pub fn set_reset_policy(&self, reset_when_unobserved: bool) {
        self.shared.set_reset_policy(reset_when_unobserved);
    }

    /// Registers `handler` to receive the current value and every later one.
    ///
    /// If the cache already holds a value, the handler receives it asynchronously before any
    /// later update. A handler registered before the first populate completes receives nothing
    /// until then.
    ///
    /// The handler is passed its own subscription handle and may cancel it from inside the
    /// callback. The returned handle keeps the cache alive until it is dropped.
    pub fn subscribe(&self, handler: impl Fn(&CancelHandle, V) + Send + Sync + 'static) -> CancelHandle {
        self.shared
            .subscribe_with(Box::new(move |handle, value, _version| handler(handle, value)))
    }

    /// Registers `handler` to receive exactly one value, current or next.
    ///
    /// The subscription cancels itself on delivery. Until then the cache is kept alive even if
    /// the caller holds no other reference to it, so `cache.map(f).once(h)` works as written.
    pub fn once(&self, handler: impl FnOnce(V) + Send + 'static) -> CancelHandle {
        let retained = Mutex::new(Some((handler, Arc::clone(&self.shared))));
        self.subscribe(move |handle, value| {
            handle.cancel();
            let taken = retained.lock().take();
            if let Some((handler, _cache)) = taken {
                handler(value);
            }
        })
    }

    /// Creates a cache whose value is `transform` applied to this cache's value.
    ///
    /// The derived cache holds this cache strongly and follows it while it has subscribers of
    /// its own. If this cache already holds a value, the derived cache starts out with its
    /// transform. The caller is responsible for keeping the derived cache alive.
    #[must_use]
    pub fn map<W>(&self, transform: impl Fn(&V) -> W + Send + Sync + 'static) -> ReactiveCache<W>
    where
        W: Clone + Send + 'static,
    {
        derived::derive(self, transform)
    }

    pub(crate) fn shared(&self) -> &Arc<Shared<V>> {
        &self.shared
    }
}

impl<V> Clone for ReactiveCache<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V> Debug for ReactiveCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ReactiveCache")
            .field("name", &self.shared.name)
            .field("populated", &state.current.is_some())
            .field("subscribers", &state.subscribers.len())
            .field("phase", &state.phase)
            .finish_non_exhaustive()
    }
}
