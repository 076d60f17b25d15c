//! Canonical error and result types for the crate.
//!
//! Each layer owns its own error enum; [`ModiError`] collects them for the
//! [`Session`](crate::session::Session) surface.

use thiserror::Error;

pub use crate::{config::ConfigError, message::MalformedFrame, transport::TransportError};

/// Failure to queue an outbound frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The transport's outbound queue is full; the frame was dropped.
    #[error("outbound queue is full")]
    QueueFull,
    /// The transport's worker has stopped.
    #[error("outbound queue is closed")]
    Closed,
    /// No open transport can carry the frame.
    #[error("no transport is connected")]
    NoTransport,
}

/// Top-level error type exposed by `modilink`.
#[derive(Debug, Error)]
pub enum ModiError {
    /// Invalid session settings.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A transport failed to open or close.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A message could not be serialised.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    /// An outbound frame could not be queued.
    #[error(transparent)]
    Send(#[from] SendError),
    /// The session was used after [`close`](crate::session::Session::close).
    #[error("session is closed")]
    Closed,
    /// A wait did not finish in time.
    #[error("timed out waiting for the topology to complete")]
    TopologyTimeout,
}

/// Canonical result alias used by `modilink` public APIs.
pub type Result<T> = std::result::Result<T, ModiError>;
