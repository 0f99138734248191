// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Activation of caches that populate from and subscribe through a connection.

use std::sync::{Arc, Weak};

use futures::StreamExt;
use futures::future::abortable;
use futures::stream::abortable as abortable_stream;

use crate::cache::{Activator, Epoch, FeedOutcome, Shared};
use crate::{CancelHandle, Connection, PopulateRequest, SubscribeRequest};

/// Whether a populate opens the activation or refreshes a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Initial,
    Refresh,
}

struct Plan<C, V> {
    connection: Weak<C>,
    populate: PopulateRequest<C, V>,
    feeds: Vec<SubscribeRequest<C, V>>,
}

pub(crate) struct Connected<C, V> {
    plan: Arc<Plan<C, V>>,
}

impl<C, V> Connected<C, V> {
    pub(crate) fn new(connection: Weak<C>, populate: PopulateRequest<C, V>, feeds: Vec<SubscribeRequest<C, V>>) -> Self {
        Self {
            plan: Arc::new(Plan {
                connection,
                populate,
                feeds,
            }),
        }
    }
}

impl<C, V> Activator<V> for Connected<C, V>
where
    C: Connection,
    V: Clone + Send + 'static,
{
    fn activate(&self, cache: &Arc<Shared<V>>, epoch: Epoch) -> Option<Vec<CancelHandle>> {
        let connection = self.plan.connection.upgrade()?;
        let state = connection.state();
        if !state.is_ready() {
            tracing::debug!(cache = cache.name(), state = %state, "connection not ready");
            return None;
        }

        Some(vec![populate(&self.plan, &connection, cache, epoch, Stage::Initial)])
    }
}

/// Starts a populate request.
///
/// A refresh tracks its own handle and forgets it on completion; the initial populate hands
/// its handle back to the activation instead.
fn populate<C, V>(plan: &Arc<Plan<C, V>>, connection: &C, cache: &Arc<Shared<V>>, epoch: Epoch, stage: Stage) -> CancelHandle
where
    C: Connection,
    V: Clone + Send + 'static,
{
    let (request, abort) = abortable(plan.populate.start(connection));
    let handle = CancelHandle::new(move || abort.abort());
    let tracked = match stage {
        Stage::Initial => None,
        Stage::Refresh => match cache.track(epoch, handle.clone()) {
            Some(id) => Some(id),
            None => return handle,
        },
    };
    let target = Arc::downgrade(cache);
    let plan = Arc::clone(plan);

    cache.queue().dispatch(async move {
        let outcome = request.await;
        let Some(cache) = target.upgrade() else {
            return;
        };
        if let Some(id) = tracked {
            cache.untrack(epoch, id);
        }
        // Aborted requests end here without touching the cache.
        let Ok(result) = outcome else {
            return;
        };

        match result {
            Ok(apply) => {
                if cache.populated(epoch, apply) && stage == Stage::Initial {
                    follow_all(&plan, &cache, epoch);
                }
            }
            Err(error) => {
                tracing::warn!(cache = cache.name(), error = %error, ?stage, "populate request failed");
                if stage == Stage::Initial {
                    cache.deactivate(epoch);
                }
            }
        }
    });

    handle
}

fn follow_all<C, V>(plan: &Arc<Plan<C, V>>, cache: &Arc<Shared<V>>, epoch: Epoch)
where
    C: Connection,
    V: Clone + Send + 'static,
{
    let Some(connection) = plan.connection.upgrade() else {
        return;
    };
    for (index, feed) in plan.feeds.iter().enumerate() {
        cache.track(epoch, follow(plan, &connection, feed, index, cache, epoch));
    }
}

fn follow<C, V>(
    plan: &Arc<Plan<C, V>>,
    connection: &C,
    feed: &SubscribeRequest<C, V>,
    index: usize,
    cache: &Arc<Shared<V>>,
    epoch: Epoch,
) -> CancelHandle
where
    C: Connection,
    V: Clone + Send + 'static,
{
    let (mut events, abort) = abortable_stream(feed.start(connection));
    let target = Arc::downgrade(cache);
    let plan = Arc::clone(plan);
    let name = cache.name();

    cache.queue().dispatch(async move {
        tracing::debug!(cache = name, feed = index, "subscribe feed started");
        while let Some(event) = events.next().await {
            let Some(cache) = target.upgrade() else {
                return;
            };
            match event {
                Ok(classify) => match cache.classified(epoch, classify) {
                    FeedOutcome::Stale => return,
                    FeedOutcome::Handled => {}
                    FeedOutcome::Repopulate => {
                        if let Some(connection) = plan.connection.upgrade() {
                            populate(&plan, &connection, &cache, epoch, Stage::Refresh);
                        }
                    }
                },
                Err(error) => tracing::warn!(cache = name, feed = index, error = %error, "subscribe feed reported an error"),
            }
        }
        tracing::debug!(cache = name, feed = index, "subscribe feed ended");
    });

    CancelHandle::new(move || abort.abort())
}
