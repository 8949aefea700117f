//! # tms-core
//!
//! Core crate for the TMS streaming client, providing:
//!
//! - **Types** (`types`): feed status, field maps, subscription requests and events
//! - **Transport** (`transport`): tagged completion queue and duplex stream contracts
//! - **Codec** (`codec`): JSON frame encoding for requests and events
//! - **Configuration** (`config`): JSON config deserialization and validation
//! - **Error types** (`error`): domain-specific `TmsError` via thiserror
//! - **CPU affinity** (`cpu_affinity`): listener-thread-to-core pinning
//! - **Time utilities** (`time_util`): wall-clock timestamps
//! - **Logging** (`logging`): tracing-based structured logging

pub mod codec;
pub mod config;
pub mod cpu_affinity;
pub mod error;
pub mod logging;
pub mod time_util;
pub mod transport;
pub mod types;

// Re-export types at crate root for convenience.
pub use error::TmsError;
pub use types::*;
