// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// A failure reported by a populate or subscribe request.
///
/// The cache never surfaces these to subscribers. A failed populate leaves the current value
/// untouched and a failed stream item is skipped; both are logged. Retrying, if desired, is the
/// job of the request itself.
///
/// # Thread safety
///
/// This type is thread-safe.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RequestError {
    /// The connection was not ready when the request was issued.
    #[error("connection is not ready")]
    NotReady,

    /// The connection closed before a response arrived.
    #[error("connection closed before a response arrived")]
    Closed,

    /// The remote end rejected the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// We are forwarding an error of unknown type from an unspecified source.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// A specialized `Result` for populate and subscribe requests.
pub type Result<T> = std::result::Result<T, RequestError>;
