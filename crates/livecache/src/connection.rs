// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The connection boundary a connected cache consumes.

use std::fmt::Display;
use std::sync::Arc;

use crate::{CallbackQueue, CancelHandle};

/// Listener invoked by a [`Connection`] on every state transition.
pub type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Connectivity state reported by a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ConnectionState {
    /// The transport is being established.
    Connecting,
    /// The transport is established and requests may be issued.
    Connected,
    /// The transport is shutting down.
    Disconnecting,
    /// The transport is down.
    Disconnected,
}

impl ConnectionState {
    /// Returns `true` if requests may be issued in this state.
    #[must_use]
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns the state name used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
        }
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transport that connected caches populate from and subscribe through.
///
/// The cache only needs the connectivity state, its change notification, and the queue
/// callbacks are delivered on. Issuing one-shot and streaming requests is left to the
/// concrete type; [`PopulateRequest`](crate::PopulateRequest) and
/// [`SubscribeRequest`](crate::SubscribeRequest) call those methods directly.
///
/// Caches hold connections weakly. A cache never keeps its connection alive.
pub trait Connection: Send + Sync + 'static {
    /// Returns the current connectivity state.
    fn state(&self) -> ConnectionState;

    /// Registers `listener` to be invoked on every state transition.
    ///
    /// Cancelling the returned handle unregisters the listener.
    fn watch_state(&self, listener: StateListener) -> CancelHandle;

    /// Returns the queue user-facing callbacks must be delivered on.
    fn callback_queue(&self) -> CallbackQueue;
}
