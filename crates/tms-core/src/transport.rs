//! Transport seam between the listener engine and the RPC layer.
//!
//! The engine never talks to a network directly. It drives a duplex stream
//! whose asynchronous operations (start-call, write, read, half-close) are each
//! posted with a correlation [`Tag`], and learns about their completion by
//! polling a [`CompletionQueue`] with a deadline.
//!
//! ```text
//!  listener thread                transport
//!  ───────────────                ─────────
//!  stream.start_call(T+1)  ──►    ...completes...
//!  queue.next(deadline)    ◄──    Ready { tag: T+1, ok: true }
//!  stream.write(req, T+2)  ──►    ...
//! ```
//!
//! Requests and events cross the seam as opaque [`Frame`]s; see
//! [`crate::codec`] for their encoding.

use std::fmt;
use std::time::Instant;

use crate::error::TmsError;
use crate::types::ListenerId;

/// Opaque correlation tag attached to one asynchronous stream operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub u64);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A serialized request or event.
pub type Frame = Vec<u8>;

/// Result of one deadline-bounded poll of a completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The deadline passed before any operation completed.
    Timeout,
    /// The operation posted with `tag` completed. `ok == false` means the call
    /// is dead.
    Ready { tag: Tag, ok: bool },
    /// The queue has been shut down and will never produce another event.
    Shutdown,
}

/// A pollable queue of completed stream operations.
///
/// Only the thread that owns the queue may poll it.
pub trait CompletionQueue: Send {
    /// Wait until an operation completes, the deadline passes, or the queue
    /// shuts down.
    fn next(&mut self, deadline: Instant) -> PollOutcome;

    /// Shut the queue down. Further polls return [`PollOutcome::Shutdown`].
    fn shutdown(&mut self);
}

/// Client side of a bidirectional streaming call.
///
/// Every operation returns immediately; its completion is reported through
/// the paired [`CompletionQueue`] under the given tag.
pub trait DuplexStream: Send {
    fn start_call(&mut self, tag: Tag);

    fn write(&mut self, frame: &[u8], tag: Tag);

    /// Request the next event. When the read completes with `ok == true`,
    /// [`DuplexStream::take_read`] yields the received frame.
    fn read(&mut self, tag: Tag);

    /// Take the frame received by the last completed read.
    fn take_read(&mut self) -> Option<Frame>;

    /// Half-close: tell the server no more writes will follow.
    fn writes_done(&mut self, tag: Tag);
}

/// A freshly opened call: the stream plus the queue its completions arrive on.
pub struct OpenedStream {
    pub stream: Box<dyn DuplexStream>,
    pub queue: Box<dyn CompletionQueue>,
}

/// Per-call metadata handed to the stream-opening function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub listener_id: ListenerId,
    pub name: String,
}

/// Opens the stream for one listener. Called once, on the listener's thread.
pub type StreamOpener = Box<dyn FnOnce(&CallContext) -> Result<OpenedStream, TmsError> + Send>;

/// The remote service stub: one stream-opening method per subscription RPC.
///
/// The registry binds one of these methods to its stored stub to build the
/// [`StreamOpener`] of each listener.
pub trait TmsRemote: Send + Sync + 'static {
    fn subscribe_for_market_data(&self, ctx: &CallContext) -> Result<OpenedStream, TmsError>;

    fn subscribe_for_portfolios(&self, ctx: &CallContext) -> Result<OpenedStream, TmsError>;

    fn subscribe_for_targets(&self, ctx: &CallContext) -> Result<OpenedStream, TmsError>;
}
