// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! A thread-safe, subscription-driven cache for values backed by an external source.
//!
//! A [`ReactiveCache`] holds the latest known value of something that lives elsewhere, such
//! as a server-side balance or a configuration document, and notifies subscribers whenever
//! that value changes. Caches are lazy: nothing is requested until the first subscriber shows
//! up and the [`Connection`] reports it is ready.
//!
//! # Variants
//!
//! - **Connected**: built with [`ReactiveCache::builder`]. Populates once with a
//!   [`PopulateRequest`], then follows one or more [`SubscribeRequest`] feeds whose events are
//!   classified into an [`Update`].
//! - **Derived**: built with [`ReactiveCache::map`]. Holds a pure transform of another cache.
//! - **Constant**: built with [`ReactiveCache::constant`]. Never changes.
//!
//! # Delivery
//!
//! Callbacks are always dispatched onto a [`CallbackQueue`], never run inline and never while
//! the cache's internal lock is held. Each subscriber sees values in commit order, at most
//! once each; on a multi-threaded queue a subscriber may skip values superseded before its
//! callback got to run.
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use livecache::testing::{ManualQueue, MockConnection};
//! use livecache::{ConnectionState, PopulateRequest, ReactiveCache, SubscribeRequest, Update};
//! use parking_lot::Mutex;
//!
//! let queue = ManualQueue::new();
//! let connection = Arc::new(MockConnection::<u64, u64>::new(queue.queue()));
//!
//! let balance = ReactiveCache::builder(
//!     &connection,
//!     PopulateRequest::new(|c: &MockConnection<u64, u64>| c.request("balance"), |_, balance| balance),
//! )
//! .subscribe(SubscribeRequest::new(
//!     |c: &MockConnection<u64, u64>| c.stream("deposits"),
//!     |amount, balance: &u64| Update::Replace(balance + amount),
//! ))
//! .build();
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let subscription = balance.subscribe({
//!     let seen = Arc::clone(&seen);
//!     move |_, value| seen.lock().push(value)
//! });
//!
//! connection.set_state(ConnectionState::Connected);
//! queue.run_until_stalled();
//! connection.respond("balance", 100);
//! queue.run_until_stalled();
//! connection.publish("deposits", 5);
//! queue.run_until_stalled();
//!
//! assert_eq!(*seen.lock(), vec![100, 105]);
//! subscription.cancel();
//! ```
//!
//! # Features
//!
//! - `tokio`: Enables [`CallbackQueue::new_tokio`] and [`CallbackQueue::from_tokio_handle`]
//! - `test-util`: Enables the [`testing`] module with a manual queue and a mock connection

mod builder;
mod cache;
mod cancel;
mod connected;
mod connection;
mod derived;
mod error;
mod queue;
mod request;

#[cfg(any(feature = "test-util", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-util")))]
pub mod testing;

pub use builder::ReactiveCacheBuilder;
pub use cache::{CacheName, ReactiveCache};
pub use cancel::CancelHandle;
pub use connection::{Connection, ConnectionState, StateListener};
pub use error::{RequestError, Result};
pub use queue::{BoxedFuture, CallbackQueue};
pub use request::{PopulateRequest, SubscribeRequest, Update};
