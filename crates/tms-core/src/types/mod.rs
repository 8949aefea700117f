//! Core data types for the TMS streaming client.

pub mod feed;
pub mod market_data;
pub mod portfolio;
pub mod target;

pub use feed::*;
pub use market_data::*;
pub use portfolio::*;
pub use target::*;

use std::fmt;

use serde::de::DeserializeOwned;

/// Registry-assigned identifier of one listener.
///
/// Identifiers are spaced by the registry stride so that the four correlation
/// tags of a listener (`id + 1 ..= id + 4`) never overlap another listener's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event type delivered on a subscription stream.
///
/// Every event type carries a feed status variant so the listener can hand the
/// consumer a synthesized disconnect notification when the call dies.
pub trait FeedEvent: DeserializeOwned + Send + 'static {
    /// The event reported once when the transport fails.
    fn disconnected() -> Self;

    /// Feed status carried by this event, if it is a status event.
    fn feed_status(&self) -> Option<FeedStatus>;
}
