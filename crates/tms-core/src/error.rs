//! Typed error definitions for the TMS streaming client.
//!
//! Provides [`TmsError`] for domain-specific errors that are more informative
//! than plain `anyhow::Error` strings. All variants implement `std::error::Error`
//! via `thiserror`, so they integrate seamlessly with `anyhow::Result`.

use thiserror::Error;

/// Domain-specific errors for the TMS streaming client.
#[derive(Debug, Error)]
pub enum TmsError {
    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// `start()` was called on a listener that has already been started.
    #[error("listener '{0}' may only be started once")]
    AlreadyStarted(String),

    /// Request or event frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The transport failed to open a stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// The listener thread could not be spawned.
    #[error("thread error: {0}")]
    Thread(String),
}
