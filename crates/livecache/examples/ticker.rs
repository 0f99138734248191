// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Ticker Example
//!
//! Implements [`Connection`] for a toy price feed and keeps a live price cache, plus a
//! derived cache formatting it for display.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use livecache::{
    CallbackQueue, CancelHandle, Connection, ConnectionState, PopulateRequest, ReactiveCache, RequestError, Result,
    StateListener, SubscribeRequest, Update,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// A price server that publishes every change to all connected clients.
struct Exchange {
    queue: CallbackQueue,
    state: Mutex<ConnectionState>,
    listeners: Arc<Mutex<HashMap<u64, StateListener>>>,
    next_listener: AtomicU64,
    price: AtomicU64,
    ticks: broadcast::Sender<u64>,
}

impl Exchange {
    fn new(queue: CallbackQueue) -> Self {
        Self {
            queue,
            state: Mutex::new(ConnectionState::Connecting),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener: AtomicU64::new(0),
            price: AtomicU64::new(100),
            ticks: broadcast::channel(16).0,
        }
    }

    fn go_online(&self) {
        *self.state.lock() = ConnectionState::Connected;
        let listeners: Vec<_> = self.listeners.lock().values().map(Arc::clone).collect();
        for listener in listeners {
            listener(ConnectionState::Connected);
        }
    }

    fn tick(&self, delta: u64) {
        let price = self.price.fetch_add(delta, Ordering::Relaxed) + delta;
        let _ = self.ticks.send(price);
    }

    async fn quote(price: u64) -> Result<u64> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(price)
    }

    fn quotes(&self) -> BoxStream<'static, Result<u64>> {
        stream::unfold(self.ticks.subscribe(), |mut ticks| async move {
            match ticks.recv().await {
                Ok(price) => Some((Ok(price), ticks)),
                Err(broadcast::error::RecvError::Closed) => None,
                Err(lagged) => Some((Err(RequestError::Other(Box::new(lagged))), ticks)),
            }
        })
        .boxed()
    }
}

impl Connection for Exchange {
    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn watch_state(&self, listener: StateListener) -> CancelHandle {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, listener);
        let listeners = Arc::downgrade(&self.listeners);
        CancelHandle::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.lock().remove(&id);
            }
        })
    }

    fn callback_queue(&self) -> CallbackQueue {
        self.queue.clone()
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry().with(tracing_subscriber::fmt::layer()).init();

    let exchange = Arc::new(Exchange::new(CallbackQueue::new_tokio()));

    let price = ReactiveCache::builder(
        &exchange,
        PopulateRequest::new(
            |exchange: &Exchange| Exchange::quote(exchange.price.load(Ordering::Relaxed)),
            |_, price| price,
        ),
    )
    .subscribe(SubscribeRequest::new(Exchange::quotes, |price, _: &u64| Update::Replace(price)))
    .name("price")
    .reset_when_unobserved(true)
    .build();

    let display = price.map(|cents| format!("${}.{:02}", cents / 100, cents % 100));
    let subscription = display.subscribe(|_, text| println!("price: {text}"));

    // Nothing is requested until the exchange is reachable.
    tokio::time::sleep(Duration::from_millis(50)).await;
    exchange.go_online();
    tokio::time::sleep(Duration::from_millis(50)).await;

    for delta in [5, 12, 250] {
        exchange.tick(delta);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    subscription.cancel();
    println!("last price: {:?}", display.current_value());
}
