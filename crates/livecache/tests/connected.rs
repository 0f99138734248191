// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(missing_docs, reason = "test code")]

//! Integration tests for caches kept live through a connection.

use std::sync::Arc;

use livecache::testing::{ManualQueue, MockConnection};
use livecache::{CancelHandle, ConnectionState, PopulateRequest, ReactiveCache, RequestError, SubscribeRequest, Update};
use parking_lot::Mutex;
use tracing_test::traced_test;

#[derive(Debug, Clone)]
enum Event {
    Deposit(u64),
    Invalidate,
    Heartbeat,
}

type Mock = MockConnection<u64, Event>;

fn balance_cache(connection: &Arc<Mock>, reset_when_unobserved: bool) -> ReactiveCache<u64> {
    ReactiveCache::builder(
        connection,
        PopulateRequest::new(|c: &Mock| c.request("balance"), |_, balance| balance),
    )
    .subscribe(SubscribeRequest::new(
        |c: &Mock| c.stream("events"),
        |event, balance: &u64| match event {
            Event::Deposit(amount) => Update::Replace(balance + amount),
            Event::Invalidate => Update::Repopulate,
            Event::Heartbeat => Update::Ignore,
        },
    ))
    .name("balance")
    .reset_when_unobserved(reset_when_unobserved)
    .build()
}

fn record(cache: &ReactiveCache<u64>) -> (Arc<Mutex<Vec<u64>>>, CancelHandle) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handle = cache.subscribe({
        let seen = Arc::clone(&seen);
        move |_, value| seen.lock().push(value)
    });
    (seen, handle)
}

struct Harness {
    queue: ManualQueue,
    connection: Arc<Mock>,
}

impl Harness {
    fn new() -> Self {
        let queue = ManualQueue::new();
        let connection = Arc::new(Mock::new(queue.queue()));
        Self { queue, connection }
    }

    fn connect(&self) {
        self.connection.set_state(ConnectionState::Connected);
        self.queue.run_until_stalled();
    }

    fn respond(&self, balance: u64) {
        assert!(self.connection.respond("balance", balance), "no populate request was waiting");
        self.queue.run_until_stalled();
    }

    fn publish(&self, event: Event) {
        self.connection.publish("events", event);
        self.queue.run_until_stalled();
    }
}

#[test]
fn populates_once_the_connection_becomes_ready() {
    let h = Harness::new();
    let cache = balance_cache(&h.connection, false);
    let (seen, handle) = record(&cache);
    h.queue.run_until_stalled();

    assert_eq!(h.connection.request_count("balance"), 0);
    assert!(!cache.is_active());

    h.connection.set_state(ConnectionState::Connecting);
    h.queue.run_until_stalled();
    assert_eq!(h.connection.request_count("balance"), 0);

    h.connect();
    assert_eq!(h.connection.request_count("balance"), 1);
    assert!(cache.is_active());
    assert_eq!(h.connection.stream_count("events"), 0, "feeds start after the first populate");

    h.respond(100);
    assert_eq!(*seen.lock(), vec![100]);
    assert_eq!(cache.current_value(), Some(100));
    assert_eq!(h.connection.stream_count("events"), 1);

    h.connect();
    assert_eq!(h.connection.request_count("balance"), 1, "a second ready state must not re-populate");
    handle.cancel();
}

#[test]
fn nothing_is_requested_without_subscribers() {
    let h = Harness::new();
    let cache = balance_cache(&h.connection, false);
    h.connect();

    assert_eq!(h.connection.request_count("balance"), 0);

    let (_seen, handle) = record(&cache);
    assert_eq!(h.connection.request_count("balance"), 1, "subscribing to a ready connection populates");
    handle.cancel();
}

#[test]
fn subscriber_sees_nothing_before_populate_completes() {
    let h = Harness::new();
    let cache = balance_cache(&h.connection, false);
    h.connect();
    let (seen, handle) = record(&cache);
    h.queue.run_until_stalled();

    assert!(seen.lock().is_empty());
    assert_eq!(cache.current_value(), None);

    h.respond(1);
    assert_eq!(*seen.lock(), vec![1]);
    handle.cancel();
}

#[test]
fn feed_events_replace_or_are_ignored() {
    let h = Harness::new();
    let cache = balance_cache(&h.connection, false);
    let (seen, handle) = record(&cache);
    h.connect();
    h.respond(100);

    h.publish(Event::Deposit(5));
    h.publish(Event::Heartbeat);
    h.publish(Event::Deposit(1));

    assert_eq!(*seen.lock(), vec![100, 105, 106]);
    assert_eq!(cache.current_value(), Some(106));
    handle.cancel();
}

#[test]
fn invalidation_repopulates_with_a_single_request() {
    let h = Harness::new();
    let cache = balance_cache(&h.connection, false);
    let (seen, handle) = record(&cache);
    h.connect();
    h.respond(100);

    h.publish(Event::Invalidate);
    assert_eq!(h.connection.request_count("balance"), 2);
    assert_eq!(h.connection.pending_requests("balance"), 1);

    h.respond(40);
    assert_eq!(*seen.lock(), vec![100, 40]);
    assert_eq!(h.connection.stream_count("events"), 1, "repopulating keeps the existing feed");

    h.publish(Event::Deposit(2));
    assert_eq!(*seen.lock(), vec![100, 40, 42]);
    handle.cancel();
}

#[test]
fn last_arriving_repopulate_response_wins() {
    let h = Harness::new();
    let cache = balance_cache(&h.connection, false);
    let (seen, handle) = record(&cache);
    h.connect();
    h.respond(100);

    h.publish(Event::Invalidate);
    h.publish(Event::Invalidate);
    assert_eq!(h.connection.pending_requests("balance"), 2);

    // The newer request answers first; the older one lands afterwards and is applied anyway.
    assert!(h.connection.respond_newest("balance", 2));
    h.queue.run_until_stalled();
    h.respond(1);

    assert_eq!(*seen.lock(), vec![100, 2, 1]);
    assert_eq!(cache.current_value(), Some(1));
    handle.cancel();
}

#[test]
fn late_subscriber_receives_current_value_first() {
    let h = Harness::new();
    let cache = balance_cache(&h.connection, false);
    let (_first, first) = record(&cache);
    h.connect();
    h.respond(100);

    let (second_seen, second) = record(&cache);
    h.queue.run_until_stalled();
    assert_eq!(*second_seen.lock(), vec![100]);

    h.publish(Event::Deposit(1));
    assert_eq!(*second_seen.lock(), vec![100, 101]);
    assert_eq!(h.connection.request_count("balance"), 1);

    first.cancel();
    second.cancel();
}

#[test]
fn reset_when_unobserved_cancels_everything() {
    let h = Harness::new();
    let cache = balance_cache(&h.connection, true);
    let (_seen, handle) = record(&cache);
    h.connect();
    h.respond(100);
    assert_eq!(h.connection.open_streams("events"), 1);

    handle.cancel();
    h.queue.run_until_stalled();

    assert_eq!(cache.current_value(), None);
    assert!(!cache.is_active());
    assert_eq!(h.connection.open_streams("events"), 0);

    let (seen, handle) = record(&cache);
    assert_eq!(h.connection.request_count("balance"), 2, "the next subscriber populates afresh");
    h.respond(7);
    assert_eq!(*seen.lock(), vec![7]);
    assert_eq!(h.connection.open_streams("events"), 1);
    handle.cancel();
}

#[test]
fn reset_aborts_an_in_flight_populate() {
    let h = Harness::new();
    let cache = balance_cache(&h.connection, true);
    let (seen, handle) = record(&cache);
    h.connect();
    assert_eq!(h.connection.pending_requests("balance"), 1);

    handle.cancel();
    h.queue.run_until_stalled();

    assert_eq!(h.connection.pending_requests("balance"), 0);
    assert!(!h.connection.respond("balance", 9));
    assert!(seen.lock().is_empty());
    assert_eq!(cache.current_value(), None);
}

#[test]
fn value_survives_losing_subscribers_by_default() {
    let h = Harness::new();
    let cache = balance_cache(&h.connection, false);
    let (_seen, handle) = record(&cache);
    h.connect();
    h.respond(100);

    handle.cancel();
    h.queue.run_until_stalled();

    assert_eq!(cache.current_value(), Some(100));
    assert!(cache.is_active());
    assert_eq!(h.connection.open_streams("events"), 1);

    // Switching the policy on while unobserved resets right away.
    cache.set_reset_policy(true);
    h.queue.run_until_stalled();
    assert_eq!(cache.current_value(), None);
    assert_eq!(h.connection.open_streams("events"), 0);
}

#[test]
fn cancel_is_idempotent() {
    let h = Harness::new();
    let cache = balance_cache(&h.connection, true);
    let (_a, first) = record(&cache);
    let (_b, second) = record(&cache);
    h.connect();

    first.cancel();
    first.cancel();
    assert_eq!(cache.subscriber_count(), 1);
    assert!(cache.is_active(), "a remaining subscriber keeps the cache live");

    second.cancel();
    second.cancel();
    assert_eq!(cache.subscriber_count(), 0);
    assert!(!cache.is_active());
}

#[test]
fn subscriber_may_cancel_itself_from_its_callback() {
    let h = Harness::new();
    let cache = balance_cache(&h.connection, false);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handle = cache.subscribe({
        let seen = Arc::clone(&seen);
        move |own: &CancelHandle, value| {
            seen.lock().push(value);
            own.cancel();
        }
    });
    h.connect();
    h.respond(100);
    h.publish(Event::Deposit(1));

    assert_eq!(*seen.lock(), vec![100]);
    assert!(handle.is_cancelled());
    assert_eq!(cache.subscriber_count(), 0);
}

#[test]
fn self_cancel_during_fan_out_leaves_other_subscribers_alone() {
    let h = Harness::new();
    let cache = balance_cache(&h.connection, false);
    let (before, first) = record(&cache);
    let quitter_seen = Arc::new(Mutex::new(Vec::new()));
    let quitter = cache.subscribe({
        let seen = Arc::clone(&quitter_seen);
        move |own: &CancelHandle, value| {
            seen.lock().push(value);
            own.cancel();
        }
    });
    let (after, last) = record(&cache);
    h.connect();

    // Committing 100 queues all three deliveries before any callback runs.
    h.respond(100);
    assert_eq!(cache.subscriber_count(), 2);

    h.publish(Event::Deposit(1));
    h.publish(Event::Deposit(2));

    assert_eq!(*quitter_seen.lock(), vec![100]);
    assert!(quitter.is_cancelled());
    assert_eq!(*before.lock(), vec![100, 101, 103]);
    assert_eq!(*after.lock(), vec![100, 101, 103]);
    first.cancel();
    last.cancel();
}

#[test]
fn failed_initial_populate_retries_on_next_ready_state() {
    let h = Harness::new();
    let cache = balance_cache(&h.connection, false);
    let (seen, handle) = record(&cache);
    h.connect();

    assert!(h.connection.fail("balance", RequestError::Rejected("busy".to_owned())));
    h.queue.run_until_stalled();
    assert!(!cache.is_active());
    assert_eq!(h.connection.stream_count("events"), 0);

    h.connect();
    assert_eq!(h.connection.request_count("balance"), 2);
    h.respond(3);
    assert_eq!(*seen.lock(), vec![3]);
    handle.cancel();
}

#[test]
fn failed_repopulate_keeps_the_current_value() {
    let h = Harness::new();
    let cache = balance_cache(&h.connection, false);
    let (seen, handle) = record(&cache);
    h.connect();
    h.respond(100);

    h.publish(Event::Invalidate);
    assert!(h.connection.fail("balance", RequestError::Closed));
    h.queue.run_until_stalled();

    assert_eq!(cache.current_value(), Some(100));
    assert!(cache.is_active());
    h.publish(Event::Deposit(1));
    assert_eq!(*seen.lock(), vec![100, 101]);
    handle.cancel();
}

#[test]
#[traced_test]
fn feed_errors_are_logged_and_skipped() {
    let h = Harness::new();
    let cache = balance_cache(&h.connection, false);
    let (seen, handle) = record(&cache);
    h.connect();
    h.respond(100);

    assert!(h.connection.publish_error("events", RequestError::Rejected("malformed".to_owned())));
    h.publish(Event::Deposit(1));

    assert_eq!(*seen.lock(), vec![100, 101]);
    assert!(logs_contain("subscribe feed reported an error"));
    handle.cancel();
}

#[test]
#[traced_test]
fn ended_feed_is_logged() {
    let h = Harness::new();
    let cache = balance_cache(&h.connection, false);
    let (seen, handle) = record(&cache);
    h.connect();
    h.respond(100);

    h.connection.close_streams("events");
    h.queue.run_until_stalled();

    assert!(logs_contain("subscribe feed ended"));
    assert_eq!(*seen.lock(), vec![100]);
    handle.cancel();
}

#[test]
#[traced_test]
fn dropping_an_observed_cache_warns_and_cancels_requests() {
    let h = Harness::new();
    let cache = balance_cache(&h.connection, false);
    let (_seen, handle) = record(&cache);
    h.connect();
    assert_eq!(h.connection.pending_requests("balance"), 1);

    drop(handle);
    drop(cache);
    h.queue.run_until_stalled();

    assert!(logs_contain("cache dropped while it still had subscribers"));
    assert_eq!(h.connection.pending_requests("balance"), 0);
}

#[test]
fn subscription_handle_keeps_the_cache_alive() {
    let h = Harness::new();
    let (seen, handle) = record(&balance_cache(&h.connection, false));
    h.connect();
    h.respond(5);

    assert_eq!(*seen.lock(), vec![5]);
    handle.cancel();
}
