// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Builder for caches kept live through a connection.

use std::fmt::Debug;
use std::sync::{Arc, Weak};

use crate::cache::{CacheName, DEFAULT_NAME, Shared};
use crate::connected::Connected;
use crate::{Connection, ConnectionState, PopulateRequest, ReactiveCache, SubscribeRequest};

/// Builder for a [`ReactiveCache`] tied to a [`Connection`].
///
/// Created by calling [`ReactiveCache::builder`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use livecache::testing::{ManualQueue, MockConnection};
/// use livecache::{PopulateRequest, ReactiveCache, SubscribeRequest, Update};
///
/// let queue = ManualQueue::new();
/// let connection = Arc::new(MockConnection::<u64, u64>::new(queue.queue()));
///
/// let cache = ReactiveCache::builder(
///     &connection,
///     PopulateRequest::new(|c: &MockConnection<u64, u64>| c.request("balance"), |_, balance| balance),
/// )
/// .subscribe(SubscribeRequest::new(
///     |c: &MockConnection<u64, u64>| c.stream("deposits"),
///     |amount, balance: &u64| Update::Replace(balance + amount),
/// ))
/// .name("balance")
/// .reset_when_unobserved(true)
/// .build();
///
/// assert_eq!(cache.name(), "balance");
/// assert_eq!(cache.current_value(), None);
/// ```
pub struct ReactiveCacheBuilder<C, V> {
    connection: Arc<C>,
    populate: PopulateRequest<C, V>,
    feeds: Vec<SubscribeRequest<C, V>>,
    name: CacheName,
    reset_when_unobserved: bool,
}

impl<C, V> ReactiveCacheBuilder<C, V>
where
    C: Connection,
    V: Clone + Send + 'static,
{
    pub(crate) fn new(connection: &Arc<C>, populate: PopulateRequest<C, V>) -> Self {
        Self {
            connection: Arc::clone(connection),
            populate,
            feeds: Vec::new(),
            name: DEFAULT_NAME,
            reset_when_unobserved: false,
        }
    }

    /// Adds a live feed, started once the first populate completes.
    ///
    /// May be called repeatedly; every feed runs concurrently.
    #[must_use]
    pub fn subscribe(mut self, feed: SubscribeRequest<C, V>) -> Self {
        self.feeds.push(feed);
        self
    }

    /// Sets the name used for the cache in logs.
    #[must_use]
    pub fn name(mut self, name: CacheName) -> Self {
        self.name = name;
        self
    }

    /// Sets whether losing the last subscriber resets the cache. Defaults to `false`.
    #[must_use]
    pub fn reset_when_unobserved(mut self, reset: bool) -> Self {
        self.reset_when_unobserved = reset;
        self
    }

    /// Builds the cache and starts watching the connection's state.
    ///
    /// Nothing is requested until the cache has a subscriber and the connection is ready.
    #[must_use]
    pub fn build(self) -> ReactiveCache<V> {
        let Self {
            connection,
            populate,
            feeds,
            name,
            reset_when_unobserved,
        } = self;

        let activator = Connected::new(Arc::downgrade(&connection), populate, feeds);
        let queue = connection.callback_queue();
        let shared = Arc::new(Shared::new(
            name,
            queue.clone(),
            Some(Box::new(activator)),
            None,
            reset_when_unobserved,
        ));

        let target = Arc::downgrade(&shared);
        let watch = connection.watch_state(Arc::new(move |state: ConnectionState| {
            if !state.is_ready() {
                return;
            }
            let target = Weak::clone(&target);
            queue.dispatch(async move {
                if let Some(shared) = target.upgrade() {
                    shared.try_activate();
                }
            });
        }));
        shared.set_watch(watch);

        ReactiveCache::from_shared(shared)
    }
}

impl<C, V> Debug for ReactiveCacheBuilder<C, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveCacheBuilder")
            .field("name", &self.name)
            .field("feeds", &self.feeds.len())
            .field("reset_when_unobserved", &self.reset_when_unobserved)
            .finish_non_exhaustive()
    }
}
