//! Subscription consumers built on the listener registry.
//!
//! - [`portfolio`]: stateless portfolio feed logger, controlled by id
//! - [`vwap`]: per-instrument interval VWAP over market data trades
//! - [`targets`]: one-shot market target snapshot

pub mod portfolio;
pub mod targets;
pub mod vwap;

pub use portfolio::PortfolioSubscriber;
pub use targets::{TargetRow, TargetSnapshot};
pub use vwap::{VwapState, VwapSubscriber};
