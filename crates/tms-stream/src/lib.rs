//! # tms-stream
//!
//! Streaming subscription engine for the TMS client.
//!
//! ## Architecture
//!
//! Each subscription is one [`listener::StreamListener`]: a dedicated thread
//! driving a duplex call through its start, subscribe, read and drain phases.
//! The [`registry::ListenerRegistry`] allocates listener ids, owns the
//! transport stub and forwards lifecycle control to listeners by id.
//! Subscribers in [`subscriber`] build requests and consume decoded events.
//!
//! ## Modules
//!
//! - [`listener`]: per-subscription protocol state machine
//! - [`registry`]: id allocation and bulk lifecycle control
//! - [`subscriber`]: portfolio, VWAP and target-snapshot consumers
//! - [`loopback`]: in-process transport used by the runner and tests

pub mod listener;
pub mod loopback;
pub mod registry;
pub mod subscriber;

pub use listener::{Phase, StreamListener};
pub use registry::ListenerRegistry;
