//! In-process loopback transport.
//!
//! Implements the [`TmsRemote`] stub, [`DuplexStream`] and [`CompletionQueue`]
//! contracts without a network: every call opened through [`LoopbackStub`]
//! shows up on the stub's incoming channel as an [`IncomingCall`], whose
//! [`LoopbackPeer`] plays the server side (push events, close, break the call).
//!
//! ```text
//! listener thread ── DuplexStream ──► CallState ◄── LoopbackPeer (server side)
//!        ▲                               │
//!        └──── LoopbackQueue ◄── crossbeam channel of (tag, ok)
//! ```
//!
//! Completions are posted the moment an operation can complete: start-call and
//! write immediately, a read as soon as the peer has a frame for it. The call
//! also records every operation so tests can check the exact protocol sequence.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use tms_core::codec;
use tms_core::transport::{
    CallContext, CompletionQueue, DuplexStream, Frame, OpenedStream, PollOutcome, Tag, TmsRemote,
};
use tms_core::{ListenerId, TmsError};
use tracing::debug;

type Completion = (Tag, bool);

/// A stream operation as recorded by the loopback call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOp {
    StartCall,
    Write,
    Read,
    WritesDone,
}

/// Operation at which newly opened calls fail with `ok == false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    StartCall,
    Write,
    FirstRead,
}

/// Behavior applied to every call opened after it is set on the stub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    pub fail_at: Option<FailPoint>,
    /// The peer never acknowledges a half-close nor closes its side.
    pub unresponsive: bool,
}

#[derive(Default)]
struct CallState {
    completions: Option<Sender<Completion>>,
    options: CallOptions,
    inbox: VecDeque<Frame>,
    ready: Option<Frame>,
    pending_read: Option<Tag>,
    requests: Vec<Frame>,
    ops: Vec<StreamOp>,
    polls: usize,
    polls_at_half_close: Option<usize>,
    broken: bool,
    peer_closed: bool,
    queue_shut_down: bool,
}

impl CallState {
    fn post(&self, tag: Tag, ok: bool) {
        if let Some(tx) = &self.completions {
            let _ = tx.send((tag, ok));
        }
    }

    fn fails_at(&mut self, point: FailPoint) -> bool {
        if self.options.fail_at == Some(point) {
            self.broken = true;
        }
        self.broken
    }

    fn fail_pending_read(&mut self) {
        if let Some(tag) = self.pending_read.take() {
            self.post(tag, false);
        }
    }

    fn read_count(&self) -> usize {
        self.ops.iter().filter(|op| **op == StreamOp::Read).count()
    }
}

type SharedCall = Arc<Mutex<CallState>>;

/// Client half of a loopback call.
pub struct LoopbackStream {
    call: SharedCall,
}

impl DuplexStream for LoopbackStream {
    fn start_call(&mut self, tag: Tag) {
        let mut call = self.call.lock();
        call.ops.push(StreamOp::StartCall);
        let ok = !call.fails_at(FailPoint::StartCall);
        call.post(tag, ok);
    }

    fn write(&mut self, frame: &[u8], tag: Tag) {
        let mut call = self.call.lock();
        call.ops.push(StreamOp::Write);
        call.requests.push(frame.to_vec());
        let ok = !call.fails_at(FailPoint::Write);
        call.post(tag, ok);
    }

    fn read(&mut self, tag: Tag) {
        let mut call = self.call.lock();
        call.ops.push(StreamOp::Read);
        let first_read_fails = call.read_count() == 1 && call.fails_at(FailPoint::FirstRead);
        if first_read_fails || call.broken {
            call.post(tag, false);
        } else if let Some(frame) = call.inbox.pop_front() {
            call.ready = Some(frame);
            call.post(tag, true);
        } else if call.peer_closed {
            call.post(tag, false);
        } else {
            call.pending_read = Some(tag);
        }
    }

    fn take_read(&mut self) -> Option<Frame> {
        self.call.lock().ready.take()
    }

    fn writes_done(&mut self, tag: Tag) {
        let mut call = self.call.lock();
        call.ops.push(StreamOp::WritesDone);
        call.polls_at_half_close = Some(call.polls);
        if call.options.unresponsive {
            return;
        }
        let ok = !call.broken;
        call.post(tag, ok);
        // The server finishes its side once the client is done writing.
        call.peer_closed = true;
        call.fail_pending_read();
    }
}

/// Completion queue of a loopback call.
pub struct LoopbackQueue {
    rx: Receiver<Completion>,
    call: SharedCall,
    shut_down: bool,
}

impl CompletionQueue for LoopbackQueue {
    fn next(&mut self, deadline: Instant) -> PollOutcome {
        if self.shut_down {
            return PollOutcome::Shutdown;
        }
        self.call.lock().polls += 1;
        match self.rx.recv_deadline(deadline) {
            Ok((tag, ok)) => PollOutcome::Ready { tag, ok },
            Err(RecvTimeoutError::Timeout) => PollOutcome::Timeout,
            Err(RecvTimeoutError::Disconnected) => PollOutcome::Shutdown,
        }
    }

    fn shutdown(&mut self) {
        self.shut_down = true;
        self.call.lock().queue_shut_down = true;
    }
}

/// Server half of a loopback call.
#[derive(Clone)]
pub struct LoopbackPeer {
    call: SharedCall,
}

impl LoopbackPeer {
    /// Deliver a raw frame to the client.
    ///
    /// Returns `false` once the call is closed, broken or its queue shut down.
    pub fn push_frame(&self, frame: Frame) -> bool {
        let mut call = self.call.lock();
        if call.peer_closed || call.broken || call.queue_shut_down {
            return false;
        }
        if let Some(tag) = call.pending_read.take() {
            call.ready = Some(frame);
            call.post(tag, true);
        } else {
            call.inbox.push_back(frame);
        }
        true
    }

    /// Encode and deliver an event to the client.
    pub fn push<E: Serialize>(&self, event: &E) -> Result<bool, TmsError> {
        Ok(self.push_frame(codec::encode(event)?))
    }

    /// Close the server side: the outstanding read (if any) fails.
    pub fn close(&self) {
        let mut call = self.call.lock();
        call.peer_closed = true;
        call.fail_pending_read();
    }

    /// Kill the call: the outstanding read and all later operations fail.
    pub fn break_call(&self) {
        let mut call = self.call.lock();
        call.broken = true;
        call.fail_pending_read();
    }

    /// Drop the completion sender so the client's queue reports shutdown.
    pub fn tear_down(&self) {
        self.call.lock().completions = None;
    }

    /// Post an arbitrary completion, bypassing the stream.
    pub fn inject(&self, tag: Tag, ok: bool) {
        self.call.lock().post(tag, ok);
    }

    /// The subscription request written by the client, decoded.
    pub fn request<T: DeserializeOwned>(&self) -> Option<Result<T, TmsError>> {
        let call = self.call.lock();
        call.requests.first().map(|frame| codec::decode(frame))
    }

    pub fn ops(&self) -> Vec<StreamOp> {
        self.call.lock().ops.clone()
    }

    pub fn count(&self, op: StreamOp) -> usize {
        self.call.lock().ops.iter().filter(|o| **o == op).count()
    }

    pub fn polls(&self) -> usize {
        self.call.lock().polls
    }

    /// Polls made by the client after it sent its half-close.
    pub fn polls_since_half_close(&self) -> Option<usize> {
        let call = self.call.lock();
        call.polls_at_half_close.map(|at| call.polls - at)
    }

    pub fn has_pending_read(&self) -> bool {
        self.call.lock().pending_read.is_some()
    }

    pub fn is_open(&self) -> bool {
        let call = self.call.lock();
        !(call.peer_closed || call.broken || call.queue_shut_down)
    }

    pub fn is_queue_shut_down(&self) -> bool {
        self.call.lock().queue_shut_down
    }
}

/// A call opened by a client, as seen by the server side.
pub struct IncomingCall {
    pub method: &'static str,
    pub listener_id: ListenerId,
    pub name: String,
    pub peer: LoopbackPeer,
}

struct StubInner {
    incoming_tx: Sender<IncomingCall>,
    incoming_rx: Receiver<IncomingCall>,
    options: Mutex<CallOptions>,
    opened: AtomicUsize,
}

/// Loopback transport stub. Cheap to clone; clones share the incoming channel.
#[derive(Clone)]
pub struct LoopbackStub {
    inner: Arc<StubInner>,
}

impl Default for LoopbackStub {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackStub {
    pub fn new() -> Self {
        let (incoming_tx, incoming_rx) = unbounded();
        Self {
            inner: Arc::new(StubInner {
                incoming_tx,
                incoming_rx,
                options: Mutex::new(CallOptions::default()),
                opened: AtomicUsize::new(0),
            }),
        }
    }

    /// Options applied to calls opened from now on.
    pub fn set_call_options(&self, options: CallOptions) {
        *self.inner.options.lock() = options;
    }

    /// Open a call for `method` and announce it on the incoming channel.
    pub fn open_call(&self, method: &'static str, ctx: &CallContext) -> Result<OpenedStream, TmsError> {
        let (tx, rx) = unbounded();
        let call = Arc::new(Mutex::new(CallState {
            completions: Some(tx),
            options: *self.inner.options.lock(),
            ..CallState::default()
        }));

        self.inner
            .incoming_tx
            .send(IncomingCall {
                method,
                listener_id: ctx.listener_id,
                name: ctx.name.clone(),
                peer: LoopbackPeer { call: Arc::clone(&call) },
            })
            .map_err(|e| TmsError::Transport(format!("loopback stub closed: {e}")))?;
        self.inner.opened.fetch_add(1, Ordering::Relaxed);
        debug!("[loopback] opened {method} for listener {}", ctx.listener_id);

        Ok(OpenedStream {
            stream: Box::new(LoopbackStream { call: Arc::clone(&call) }),
            queue: Box::new(LoopbackQueue {
                rx,
                call,
                shut_down: false,
            }),
        })
    }

    /// Wait up to `timeout` for the next opened call.
    pub fn accept(&self, timeout: Duration) -> Option<IncomingCall> {
        self.inner.incoming_rx.recv_timeout(timeout).ok()
    }

    /// Receiver of opened calls, for a server loop on another thread.
    pub fn incoming(&self) -> Receiver<IncomingCall> {
        self.inner.incoming_rx.clone()
    }

    /// Total number of calls opened through this stub.
    pub fn opened_calls(&self) -> usize {
        self.inner.opened.load(Ordering::Relaxed)
    }
}

impl TmsRemote for LoopbackStub {
    fn subscribe_for_market_data(&self, ctx: &CallContext) -> Result<OpenedStream, TmsError> {
        self.open_call("subscribeForMarketData", ctx)
    }

    fn subscribe_for_portfolios(&self, ctx: &CallContext) -> Result<OpenedStream, TmsError> {
        self.open_call("subscribeForMarketPortfolios", ctx)
    }

    fn subscribe_for_targets(&self, ctx: &CallContext) -> Result<OpenedStream, TmsError> {
        self.open_call("subscribeForMarketTargets", ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(stub: &LoopbackStub) -> (OpenedStream, LoopbackPeer) {
        let ctx = CallContext {
            listener_id: ListenerId(1000),
            name: "test".to_string(),
        };
        let opened = stub.open_call("test", &ctx).unwrap();
        let incoming = stub.accept(Duration::from_secs(1)).unwrap();
        assert_eq!(incoming.listener_id, ListenerId(1000));
        (opened, incoming.peer)
    }

    fn poll(queue: &mut dyn CompletionQueue) -> PollOutcome {
        queue.next(Instant::now() + Duration::from_millis(50))
    }

    #[test]
    fn read_completes_when_frame_arrives() {
        let stub = LoopbackStub::new();
        let (OpenedStream { mut stream, mut queue }, peer) = open(&stub);

        stream.read(Tag(3));
        assert_eq!(poll(queue.as_mut()), PollOutcome::Timeout);
        assert!(peer.has_pending_read());

        assert!(peer.push_frame(b"one".to_vec()));
        assert_eq!(poll(queue.as_mut()), PollOutcome::Ready { tag: Tag(3), ok: true });
        assert_eq!(stream.take_read().as_deref(), Some(&b"one"[..]));
        assert_eq!(stream.take_read(), None);
    }

    #[test]
    fn half_close_acks_and_fails_pending_read() {
        let stub = LoopbackStub::new();
        let (OpenedStream { mut stream, mut queue }, peer) = open(&stub);

        stream.read(Tag(3));
        stream.writes_done(Tag(4));
        assert_eq!(poll(queue.as_mut()), PollOutcome::Ready { tag: Tag(4), ok: true });
        assert_eq!(poll(queue.as_mut()), PollOutcome::Ready { tag: Tag(3), ok: false });
        assert!(!peer.push_frame(b"late".to_vec()));
    }

    #[test]
    fn fail_point_applies_to_later_calls() {
        let stub = LoopbackStub::new();
        stub.set_call_options(CallOptions {
            fail_at: Some(FailPoint::Write),
            unresponsive: false,
        });
        let (OpenedStream { mut stream, mut queue }, _peer) = open(&stub);

        stream.start_call(Tag(1));
        stream.write(b"req", Tag(2));
        assert_eq!(poll(queue.as_mut()), PollOutcome::Ready { tag: Tag(1), ok: true });
        assert_eq!(poll(queue.as_mut()), PollOutcome::Ready { tag: Tag(2), ok: false });
    }

    #[test]
    fn tear_down_reports_shutdown() {
        let stub = LoopbackStub::new();
        let (OpenedStream { stream, mut queue }, peer) = open(&stub);
        drop(stream);
        peer.tear_down();
        assert_eq!(poll(queue.as_mut()), PollOutcome::Shutdown);
    }

    #[test]
    fn queue_shutdown_is_sticky() {
        let stub = LoopbackStub::new();
        let (OpenedStream { mut queue, .. }, peer) = open(&stub);
        queue.shutdown();
        assert!(peer.is_queue_shut_down());
        assert!(!peer.is_open());
        assert_eq!(poll(queue.as_mut()), PollOutcome::Shutdown);
    }
}
