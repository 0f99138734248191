// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Descriptions of how a connected cache fetches and follows its value.

use std::fmt::Debug;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt, TryFutureExt, TryStreamExt};

use crate::Result;

/// Produces the next value from the previous one once a populate response arrived.
pub(crate) type Apply<V> = Box<dyn FnOnce(Option<&V>) -> V + Send>;

/// Classifies one feed event against the current value.
pub(crate) type Classify<V> = Box<dyn FnOnce(&V) -> Update<V> + Send>;

type StartPopulate<C, V> = dyn Fn(&C) -> BoxFuture<'static, Result<Apply<V>>> + Send + Sync;
type StartSubscribe<C, V> = dyn Fn(&C) -> BoxStream<'static, Result<Classify<V>>> + Send + Sync;

/// The outcome of classifying one subscribe feed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update<V> {
    /// The event does not affect the cached value.
    Ignore,
    /// The event invalidates the cached value; fetch it again.
    Repopulate,
    /// The event carries the new value.
    Replace(V),
}

/// How a connected cache fetches (and re-fetches) its value.
///
/// A populate pairs a one-shot request with a function that folds the response into the
/// previous value. The function runs inside the cache's critical section, so it must be cheap
/// and must not call back into the cache.
///
/// # Examples
///
/// ```
/// use livecache::{PopulateRequest, Result};
///
/// struct Client {
///     account: u32,
/// }
///
/// let populate = PopulateRequest::new(
///     |client: &Client| {
///         let account = client.account;
///         async move { Result::Ok(u64::from(account) * 100) }
///     },
///     |_previous: Option<&u64>, balance| balance,
/// );
/// # let _ = populate;
/// ```
pub struct PopulateRequest<C, V> {
    start: Arc<StartPopulate<C, V>>,
}

impl<C, V> PopulateRequest<C, V>
where
    C: 'static,
    V: 'static,
{
    /// Creates a populate from a request issuer and a response folder.
    ///
    /// `request` is invoked each time the cache (re)populates. `apply` receives the value that
    /// is current when the response is applied, which is `None` on first population.
    pub fn new<R, Fut>(
        request: impl Fn(&C) -> Fut + Send + Sync + 'static,
        apply: impl Fn(Option<&V>, R) -> V + Send + Sync + 'static,
    ) -> Self
    where
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        let apply = Arc::new(apply);
        Self {
            start: Arc::new(move |connection| {
                let apply = Arc::clone(&apply);
                request(connection)
                    .map_ok(move |response| -> Apply<V> { Box::new(move |previous: Option<&V>| apply(previous, response)) })
                    .boxed()
            }),
        }
    }

    pub(crate) fn start(&self, connection: &C) -> BoxFuture<'static, Result<Apply<V>>> {
        (self.start)(connection)
    }
}

impl<C, V> Clone for PopulateRequest<C, V> {
    fn clone(&self) -> Self {
        Self {
            start: Arc::clone(&self.start),
        }
    }
}

impl<C, V> Debug for PopulateRequest<C, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PopulateRequest").finish_non_exhaustive()
    }
}

/// A live feed that keeps a connected cache up to date between populates.
///
/// Each feed event is classified against the current value into an [`Update`]. The
/// classifier runs inside the cache's critical section and is only ever called once the cache
/// holds a value.
///
/// # Examples
///
/// ```
/// use futures::stream;
/// use livecache::{SubscribeRequest, Update};
///
/// struct Client;
///
/// enum Event {
///     Deposit(u64),
///     Reset,
///     Heartbeat,
/// }
///
/// let feed = SubscribeRequest::new(
///     |_client: &Client| stream::iter(vec![Ok(Event::Deposit(5)), Ok(Event::Heartbeat)]),
///     |event, balance: &u64| match event {
///         Event::Deposit(amount) => Update::Replace(balance + amount),
///         Event::Reset => Update::Repopulate,
///         Event::Heartbeat => Update::Ignore,
///     },
/// );
/// # let _ = feed;
/// ```
pub struct SubscribeRequest<C, V> {
    start: Arc<StartSubscribe<C, V>>,
}

impl<C, V> SubscribeRequest<C, V>
where
    C: 'static,
    V: 'static,
{
    /// Creates a feed from a stream opener and an event classifier.
    pub fn new<E, S>(
        stream: impl Fn(&C) -> S + Send + Sync + 'static,
        classify: impl Fn(E, &V) -> Update<V> + Send + Sync + 'static,
    ) -> Self
    where
        S: Stream<Item = Result<E>> + Send + 'static,
        E: Send + 'static,
    {
        let classify = Arc::new(classify);
        Self {
            start: Arc::new(move |connection| {
                let classify = Arc::clone(&classify);
                stream(connection)
                    .map_ok(move |event| -> Classify<V> {
                        let classify = Arc::clone(&classify);
                        Box::new(move |current: &V| classify(event, current))
                    })
                    .boxed()
            }),
        }
    }

    pub(crate) fn start(&self, connection: &C) -> BoxStream<'static, Result<Classify<V>>> {
        (self.start)(connection)
    }
}

impl<C, V> Clone for SubscribeRequest<C, V> {
    fn clone(&self) -> Self {
        Self {
            start: Arc::clone(&self.start),
        }
    }
}

impl<C, V> Debug for SubscribeRequest<C, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeRequest").finish_non_exhaustive()
    }
}
