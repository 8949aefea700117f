//! Stream listener: one duplex subscription call driven by one dedicated thread.
//!
//! # Protocol
//!
//! ```text
//! Created ──start()──► Starting ──Start ok──► AwaitingSubscribeAck ──Subscribe ok──► Streaming
//!                                                                                     │  ▲
//!                                                                        Read ok ─────┘  │ consumer → true (re-arm read)
//!                                                                                     │
//!          stop flag / consumer → false ──► Draining ──half-close, wait for peer──► Closed
//!          ok == false ───────────────────────────────── disconnect to consumer ──► Closed
//! ```
//!
//! The thread polls the call's completion queue with a short deadline and
//! re-checks the running flag before and after every poll, so a stop request
//! is noticed within one poll timeout. Stopping is cooperative: the thread
//! half-closes the call and waits for the server to finish its side before
//! shutting the queue down.
//!
//! Control operations ([`StreamListener::signal_stop`],
//! [`StreamListener::set_debug`]) are atomic flag writes callable from any
//! thread. [`StreamListener::wait_for_stop`] takes the thread handle out of its
//! slot under a lock, so concurrent callers race safely: exactly one joins.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::Mutex;
use tms_core::config::ListenerConfig;
use tms_core::transport::{
    CallContext, CompletionQueue, DuplexStream, Frame, OpenedStream, PollOutcome, StreamOpener, Tag,
};
use tms_core::{FeedEvent, ListenerId, TmsError, codec};
use tracing::{debug, error, info, warn};

/// Lifecycle phase of a listener.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created = 0,
    Starting = 1,
    AwaitingSubscribeAck = 2,
    Streaming = 3,
    Draining = 4,
    Closed = 5,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Starting,
            2 => Self::AwaitingSubscribeAck,
            3 => Self::Streaming,
            4 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// What the listener hands its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery<'a> {
    /// A frame received by a completed read.
    Data(&'a [u8]),
    /// The call died. Delivered at most once, as the last delivery.
    Disconnected,
}

/// Frame-level consumer: `(delivery, caller_label) -> continue_reading`.
pub type FrameConsumer = Box<dyn FnMut(Delivery<'_>, &str) -> bool + Send>;

/// Wrap a typed event callback into a [`FrameConsumer`].
///
/// Frames are decoded into `E`; a disconnect becomes `E::disconnected()`.
/// Undecodable frames are logged and skipped without stopping the stream.
pub fn decoding_consumer<E, C>(mut consumer: C) -> FrameConsumer
where
    E: FeedEvent,
    C: FnMut(&E, &str) -> bool + Send + 'static,
{
    Box::new(move |delivery: Delivery<'_>, caller: &str| match delivery {
        Delivery::Data(frame) => match codec::decode::<E>(frame) {
            Ok(event) => consumer(&event, caller),
            Err(e) => {
                warn!("{caller}dropping undecodable event: {e}");
                true
            }
        },
        Delivery::Disconnected => consumer(&E::disconnected(), caller),
    })
}

/// The four correlation tags of one listener, one per protocol operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerTags {
    pub start: Tag,
    pub subscribe: Tag,
    pub read: Tag,
    pub done: Tag,
}

impl ListenerTags {
    /// Tags `base + 1 ..= base + 4`.
    pub fn from_base(base: u64) -> Self {
        Self {
            start: Tag(base + 1),
            subscribe: Tag(base + 2),
            read: Tag(base + 3),
            done: Tag(base + 4),
        }
    }
}

/// Flags shared between the owner and the listener thread.
struct Shared {
    running: AtomicBool,
    /// Set by `signal_stop`, never cleared. `start` honors it.
    stop_requested: AtomicBool,
    debug: AtomicBool,
    phase: AtomicU8,
}

/// Owns one duplex subscription and the thread that drives it.
pub struct StreamListener {
    id: ListenerId,
    name: String,
    log_prefix: String,
    tags: ListenerTags,
    config: ListenerConfig,
    shared: Arc<Shared>,
    started: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl StreamListener {
    /// Create a listener whose tags are derived from `id`.
    pub fn new(id: ListenerId, name: &str, config: ListenerConfig) -> Self {
        Self {
            id,
            name: name.to_string(),
            log_prefix: format!("[{name}] "),
            tags: ListenerTags::from_base(id.0),
            config,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                debug: AtomicBool::new(false),
                phase: AtomicU8::new(Phase::Created as u8),
            }),
            started: AtomicBool::new(false),
            thread: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> ListenerTags {
        self.tags
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.shared.phase.load(Ordering::Acquire))
    }

    /// Target liveness: `false` once a stop has been requested.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Whether a thread is still owned (started and not yet joined).
    pub fn has_thread(&self) -> bool {
        self.thread.lock().is_some()
    }

    pub fn set_debug(&self, debug: bool) {
        self.shared.debug.store(debug, Ordering::Relaxed);
    }

    pub fn is_debug(&self) -> bool {
        self.shared.debug.load(Ordering::Relaxed)
    }

    /// Spawn the listener thread. It opens the stream with `opener`, writes
    /// `request` once the call is up and feeds every received frame to
    /// `consumer` until the consumer returns `false` or a stop is signaled.
    ///
    /// Returns immediately. Fails with [`TmsError::AlreadyStarted`] on every
    /// call after the first; no second thread is ever spawned. A stop signaled
    /// before `start` still applies: the thread exits without opening a call.
    pub fn start(
        &self,
        opener: StreamOpener,
        request: Frame,
        consumer: FrameConsumer,
    ) -> Result<(), TmsError> {
        if self.started.swap(true, Ordering::AcqRel) {
            error!("{}start() called on a listener that was already started", self.log_prefix);
            return Err(TmsError::AlreadyStarted(self.name.clone()));
        }
        // Held until the handle is stored, so a concurrent `wait_for_stop`
        // cannot miss the thread.
        let mut slot = self.thread.lock();
        self.shared.running.store(true, Ordering::SeqCst);
        if self.shared.stop_requested.load(Ordering::SeqCst) {
            self.shared.running.store(false, Ordering::SeqCst);
        }

        let ctx = CallContext {
            listener_id: self.id,
            name: self.name.clone(),
        };
        let driver = Driver {
            name: self.name.clone(),
            prefix: self.log_prefix.clone(),
            tags: self.tags,
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
            in_flight: Vec::with_capacity(4),
        };

        let spawned = thread::Builder::new()
            .name(format!("tms-listener-{}", self.id))
            .spawn(move || driver.run(ctx, opener, request, consumer));
        match spawned {
            Ok(handle) => {
                *slot = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                self.shared.phase.store(Phase::Closed as u8, Ordering::Release);
                Err(TmsError::Thread(format!("failed to spawn listener '{}': {e}", self.name)))
            }
        }
    }

    /// Ask the listener thread to stop. Idempotent, never blocks.
    pub fn signal_stop(&self, caller: &str) {
        if self.is_debug() {
            debug!("{caller}{}flagging listener thread to stop", self.log_prefix);
        }
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shared.running.store(false, Ordering::SeqCst);
    }

    /// Block until the listener thread has exited, then release it.
    ///
    /// Idempotent: returns immediately when no thread is owned, including for
    /// every caller that lost the race to take the handle.
    pub fn wait_for_stop(&self, caller: &str) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            // Called from the listener's own consumer: it exits on its own.
            warn!("{caller}{}wait_for_stop() on the listener thread itself, detaching", self.log_prefix);
            return;
        }
        if self.is_debug() {
            debug!("{caller}{}terminating listener thread...", self.log_prefix);
        }
        if handle.join().is_err() {
            error!("{caller}{}listener thread panicked", self.log_prefix);
        }
        info!("{caller}{}thread is stopped", self.log_prefix);
    }
}

impl Drop for StreamListener {
    fn drop(&mut self) {
        if self.is_running() {
            self.signal_stop("[drop] ");
        }
        self.wait_for_stop("[drop] ");
    }
}

/// Why the listener thread finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Half-close handshake finished.
    Drained,
    /// Drain gave up after the configured number of timeouts.
    DrainAbandoned,
    /// The call died; the consumer got a disconnect.
    Disconnected,
    /// The queue shut down underneath the listener.
    QueueShutdown,
    /// Unknown tag or a read without payload.
    ProtocolError,
}

/// State owned by the listener thread.
struct Driver {
    name: String,
    prefix: String,
    tags: ListenerTags,
    config: ListenerConfig,
    shared: Arc<Shared>,
    /// Tags of operations posted and not yet completed.
    in_flight: Vec<Tag>,
}

impl Driver {
    fn run(mut self, ctx: CallContext, opener: StreamOpener, request: Frame, mut consumer: FrameConsumer) {
        if !self.should_continue() {
            info!("{}stopped before the stream was opened", self.prefix);
            self.set_phase(Phase::Closed);
            return;
        }
        tms_core::cpu_affinity::maybe_bind(self.config.cpu_core, &self.name);

        let OpenedStream { mut stream, mut queue } = match opener(&ctx) {
            Ok(opened) => opened,
            Err(e) => {
                error!("{}failed to open stream: {e}", self.prefix);
                consumer(Delivery::Disconnected, &self.prefix);
                self.shared.running.store(false, Ordering::Release);
                self.set_phase(Phase::Closed);
                return;
            }
        };

        self.set_phase(Phase::Starting);
        self.trace("before start_call()");
        self.post(self.tags.start);
        stream.start_call(self.tags.start);

        let exit = self.drive(stream.as_mut(), queue.as_mut(), &request, &mut consumer);

        self.trace("shutting down queue");
        queue.shutdown();
        self.shared.running.store(false, Ordering::Release);
        self.set_phase(Phase::Closed);
        info!(listener = %self.name, exit = ?exit, "{}stream completed", self.prefix);
    }

    fn drive(
        &mut self,
        stream: &mut dyn DuplexStream,
        queue: &mut dyn CompletionQueue,
        request: &[u8],
        consumer: &mut FrameConsumer,
    ) -> Exit {
        loop {
            if !self.should_continue() {
                // Nothing was received since the last poll, so nothing to skip.
                return self.drain(stream, queue, false);
            }

            self.trace("before poll");
            let outcome = queue.next(Instant::now() + self.config.poll_timeout());
            self.trace_outcome(outcome);

            if let PollOutcome::Ready { tag, ok: false } = outcome {
                self.complete(tag);
                warn!(phase = ?self.phase(), %tag, "{}subscription call is dead", self.prefix);
                consumer(Delivery::Disconnected, &self.prefix);
                return Exit::Disconnected;
            }

            if !self.should_continue() {
                let received_read = matches!(outcome, PollOutcome::Ready { tag, .. } if tag == self.tags.read);
                if let PollOutcome::Ready { tag, .. } = outcome {
                    self.complete(tag);
                }
                return self.drain(stream, queue, received_read);
            }

            let tag = match outcome {
                PollOutcome::Timeout => continue,
                PollOutcome::Shutdown => {
                    warn!(phase = ?self.phase(), "{}completion queue shut down, forcing close", self.prefix);
                    return Exit::QueueShutdown;
                }
                PollOutcome::Ready { tag, .. } => tag,
            };
            self.complete(tag);

            if tag == self.tags.start {
                info!("{}stream is up", self.prefix);
                self.set_phase(Phase::AwaitingSubscribeAck);
                self.post(self.tags.subscribe);
                stream.write(request, self.tags.subscribe);
            } else if tag == self.tags.subscribe {
                info!("{}subscription is accepted", self.prefix);
                self.set_phase(Phase::Streaming);
                self.post(self.tags.read);
                stream.read(self.tags.read);
            } else if tag == self.tags.read {
                let Some(frame) = stream.take_read() else {
                    error!(%tag, "{}read completed without a payload", self.prefix);
                    return Exit::ProtocolError;
                };
                if consumer(Delivery::Data(&frame), &self.prefix) {
                    self.trace("re-arming read");
                    self.post(self.tags.read);
                    stream.read(self.tags.read);
                } else {
                    info!("{}got 'stop' from consumer", self.prefix);
                    self.shared.running.store(false, Ordering::Release);
                    // The frame was consumed, there is nothing left to skip.
                    return self.drain(stream, queue, false);
                }
            } else {
                error!(%tag, "{}received unknown completion queue tag", self.prefix);
                return Exit::ProtocolError;
            }
        }
    }

    /// Half-close the call and wait for the server to finish its side.
    fn drain(
        &mut self,
        stream: &mut dyn DuplexStream,
        queue: &mut dyn CompletionQueue,
        received_read: bool,
    ) -> Exit {
        self.set_phase(Phase::Draining);
        info!("{}detected request to stop", self.prefix);
        if received_read {
            // Re-reading here to discard the received event crashes some
            // transports, so the event is dropped unconsumed instead.
            self.trace("received event left unconsumed");
        }

        self.trace("calling writes_done()");
        self.post(self.tags.done);
        stream.writes_done(self.tags.done);

        let mut timeouts = 0u32;
        let mut failures = 0u32;
        while !self.in_flight.is_empty() {
            self.trace("waiting for server to close stream...");
            match queue.next(Instant::now() + self.config.poll_timeout()) {
                PollOutcome::Timeout => {
                    timeouts += 1;
                    if let Some(max) = self.config.max_drain_timeouts
                        && timeouts >= max
                    {
                        warn!("{}server did not close stream after {timeouts} polls, giving up", self.prefix);
                        return Exit::DrainAbandoned;
                    }
                }
                PollOutcome::Shutdown => return Exit::QueueShutdown,
                PollOutcome::Ready { tag, ok } => {
                    timeouts = 0;
                    self.complete(tag);
                    if ok {
                        failures = 0;
                        if tag == self.tags.done {
                            self.trace("half-close acknowledged");
                        } else if tag == self.tags.read {
                            self.trace("discarding event received while draining");
                        }
                    } else {
                        failures += 1;
                        if failures >= self.config.max_drain_failures {
                            break;
                        }
                    }
                }
            }
        }
        Exit::Drained
    }

    fn should_continue(&self) -> bool {
        let go_on = self.shared.running.load(Ordering::Acquire);
        if !go_on {
            self.trace("stop flag is set");
        }
        go_on
    }

    fn post(&mut self, tag: Tag) {
        self.in_flight.push(tag);
    }

    fn complete(&mut self, tag: Tag) {
        if let Some(pos) = self.in_flight.iter().position(|t| *t == tag) {
            self.in_flight.swap_remove(pos);
        }
    }

    fn phase(&self) -> Phase {
        Phase::from_u8(self.shared.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: Phase) {
        self.shared.phase.store(phase as u8, Ordering::Release);
        if self.shared.debug.load(Ordering::Relaxed) {
            debug!(listener = %self.name, ?phase, "{}phase change", self.prefix);
        }
    }

    fn trace(&self, msg: &str) {
        if self.shared.debug.load(Ordering::Relaxed) {
            debug!(phase = ?self.phase(), "{}{msg}", self.prefix);
        }
    }

    fn trace_outcome(&self, outcome: PollOutcome) {
        if self.shared.debug.load(Ordering::Relaxed) {
            debug!(phase = ?self.phase(), ?outcome, "{}after poll", self.prefix);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tms_core::{FeedStatus, PortfolioEvent};

    use super::*;
    use crate::loopback::{CallOptions, FailPoint, LoopbackPeer, LoopbackStub, StreamOp};
    use crate::test_util::wait_until;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_config() -> ListenerConfig {
        ListenerConfig {
            poll_timeout_ms: 20,
            ..ListenerConfig::default()
        }
    }

    fn opener(stub: &LoopbackStub) -> StreamOpener {
        let stub = stub.clone();
        Box::new(move |ctx: &CallContext| stub.open_call("test", ctx))
    }

    #[derive(Default)]
    struct Seen {
        data: AtomicUsize,
        disconnects: AtomicUsize,
    }

    /// Consumer that records deliveries and stops after `stop_after` frames.
    fn counting(seen: &Arc<Seen>, stop_after: Option<usize>) -> FrameConsumer {
        let seen = Arc::clone(seen);
        Box::new(move |delivery: Delivery<'_>, _caller: &str| match delivery {
            Delivery::Data(_) => {
                let n = seen.data.fetch_add(1, Ordering::SeqCst) + 1;
                stop_after.is_none_or(|limit| n < limit)
            }
            Delivery::Disconnected => {
                seen.disconnects.fetch_add(1, Ordering::SeqCst);
                true
            }
        })
    }

    fn start(stub: &LoopbackStub, seen: &Arc<Seen>, stop_after: Option<usize>) -> (StreamListener, LoopbackPeer) {
        let listener = StreamListener::new(ListenerId(1000), "test", fast_config());
        listener
            .start(opener(stub), b"{}".to_vec(), counting(seen, stop_after))
            .unwrap();
        let call = stub.accept(WAIT).expect("listener never opened its call");
        (listener, call.peer)
    }

    #[test]
    fn tags_are_distinct() {
        let tags = ListenerTags::from_base(1000);
        let all = [tags.start, tags.subscribe, tags.read, tags.done];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(tags.start, Tag(1001));
        assert_eq!(tags.done, Tag(1004));
    }

    #[test]
    fn second_start_fails_without_spawning() {
        let stub = LoopbackStub::new();
        let seen = Arc::new(Seen::default());
        let (listener, _peer) = start(&stub, &seen, None);

        let err = listener
            .start(opener(&stub), b"{}".to_vec(), counting(&seen, None))
            .unwrap_err();
        assert!(matches!(err, TmsError::AlreadyStarted(_)));
        assert!(stub.accept(Duration::from_millis(100)).is_none());
        assert_eq!(stub.opened_calls(), 1);

        listener.signal_stop("test ");
        listener.wait_for_stop("test ");
        assert_eq!(listener.phase(), Phase::Closed);
    }

    #[test]
    fn protocol_phases_are_ordered() {
        let stub = LoopbackStub::new();
        let seen = Arc::new(Seen::default());
        let (listener, peer) = start(&stub, &seen, None);

        assert!(wait_until(WAIT, || listener.phase() == Phase::Streaming));
        assert!(wait_until(WAIT, || peer.has_pending_read()));
        assert_eq!(peer.ops(), vec![StreamOp::StartCall, StreamOp::Write, StreamOp::Read]);
        assert_eq!(peer.request::<serde_json::Value>().unwrap().unwrap(), serde_json::json!({}));

        listener.signal_stop("test ");
        listener.wait_for_stop("test ");
    }

    #[test]
    fn stop_before_first_event_drains_without_disconnect() {
        let stub = LoopbackStub::new();
        let seen = Arc::new(Seen::default());
        let (listener, peer) = start(&stub, &seen, None);

        assert!(wait_until(WAIT, || peer.has_pending_read()));
        listener.signal_stop("test ");
        listener.wait_for_stop("test ");

        assert_eq!(listener.phase(), Phase::Closed);
        assert!(!listener.is_running());
        assert_eq!(seen.data.load(Ordering::SeqCst), 0);
        assert_eq!(seen.disconnects.load(Ordering::SeqCst), 0);
        assert_eq!(peer.count(StreamOp::WritesDone), 1);
        assert!(peer.is_queue_shut_down());
    }

    #[test]
    fn stop_before_start_exits_without_opening() {
        let stub = LoopbackStub::new();
        let seen = Arc::new(Seen::default());
        let listener = StreamListener::new(ListenerId(1000), "test", fast_config());

        listener.signal_stop("test ");
        listener
            .start(opener(&stub), b"{}".to_vec(), counting(&seen, None))
            .unwrap();
        assert!(!listener.is_running());
        listener.wait_for_stop("test ");

        assert!(!listener.has_thread());
        assert_eq!(listener.phase(), Phase::Closed);
        assert_eq!(stub.opened_calls(), 0);
        assert!(stub.accept(Duration::from_millis(100)).is_none());
        assert_eq!(seen.disconnects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stop_with_completed_read_drops_event() {
        let stub = LoopbackStub::new();
        let seen = Arc::new(Seen::default());
        // Long enough that the read completion, not a timeout, wakes the poll.
        let config = ListenerConfig {
            poll_timeout_ms: 500,
            ..ListenerConfig::default()
        };
        let listener = StreamListener::new(ListenerId(1000), "test", config);
        listener
            .start(opener(&stub), b"{}".to_vec(), counting(&seen, None))
            .unwrap();
        let peer = stub.accept(WAIT).expect("listener never opened its call").peer;

        assert!(wait_until(WAIT, || peer.has_pending_read()));
        let polls = peer.polls();
        listener.signal_stop("test ");
        assert!(peer.push_frame(b"late".to_vec()));
        listener.wait_for_stop("test ");

        assert_eq!(listener.phase(), Phase::Closed);
        assert_eq!(seen.data.load(Ordering::SeqCst), 0);
        assert_eq!(seen.disconnects.load(Ordering::SeqCst), 0);
        assert_eq!(peer.count(StreamOp::Read), 1);
        assert_eq!(peer.count(StreamOp::WritesDone), 1);
        assert_eq!(peer.ops().last(), Some(&StreamOp::WritesDone));
        assert!(peer.polls() > polls);
        assert!(peer.polls_since_half_close().unwrap() >= 1);
    }

    #[test]
    fn consumer_stop_drains_without_rearming() {
        let stub = LoopbackStub::new();
        let seen = Arc::new(Seen::default());
        let (listener, peer) = start(&stub, &seen, Some(3));
        for i in 0..3 {
            assert!(peer.push_frame(format!("{i}").into_bytes()));
        }

        assert!(wait_until(WAIT, || listener.phase() == Phase::Closed));
        listener.wait_for_stop("test ");

        assert_eq!(seen.data.load(Ordering::SeqCst), 3);
        assert_eq!(seen.disconnects.load(Ordering::SeqCst), 0);
        assert_eq!(
            peer.ops(),
            vec![
                StreamOp::StartCall,
                StreamOp::Write,
                StreamOp::Read,
                StreamOp::Read,
                StreamOp::Read,
                StreamOp::WritesDone,
            ]
        );
        assert!(peer.polls_since_half_close().unwrap() >= 1);
        assert!(!listener.is_running());
    }

    #[test]
    fn transport_failure_disconnects_once_in_any_phase() {
        for point in [FailPoint::StartCall, FailPoint::Write, FailPoint::FirstRead] {
            let stub = LoopbackStub::new();
            stub.set_call_options(CallOptions {
                fail_at: Some(point),
                unresponsive: false,
            });
            let seen = Arc::new(Seen::default());
            let (listener, peer) = start(&stub, &seen, None);

            assert!(wait_until(WAIT, || listener.phase() == Phase::Closed), "{point:?}");
            listener.wait_for_stop("test ");
            assert_eq!(seen.disconnects.load(Ordering::SeqCst), 1, "{point:?}");
            assert_eq!(seen.data.load(Ordering::SeqCst), 0, "{point:?}");
            assert_eq!(peer.count(StreamOp::WritesDone), 0, "{point:?}");
        }
    }

    #[test]
    fn broken_call_while_streaming_disconnects_once() {
        let stub = LoopbackStub::new();
        let seen = Arc::new(Seen::default());
        let (listener, peer) = start(&stub, &seen, None);

        assert!(peer.push_frame(b"a".to_vec()));
        assert!(wait_until(WAIT, || seen.data.load(Ordering::SeqCst) == 1));
        assert!(wait_until(WAIT, || peer.has_pending_read()));
        peer.break_call();

        assert!(wait_until(WAIT, || listener.phase() == Phase::Closed));
        listener.wait_for_stop("test ");
        assert_eq!(seen.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(peer.count(StreamOp::WritesDone), 0);
    }

    #[test]
    fn concurrent_stops_join_once() {
        let stub = LoopbackStub::new();
        let seen = Arc::new(Seen::default());
        let (listener, peer) = start(&stub, &seen, None);
        assert!(wait_until(WAIT, || peer.has_pending_read()));

        let listener = Arc::new(listener);
        let callers: Vec<_> = (0..8)
            .map(|i| {
                let listener = Arc::clone(&listener);
                thread::spawn(move || {
                    let caller = format!("[caller {i}] ");
                    listener.signal_stop(&caller);
                    listener.wait_for_stop(&caller);
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }

        listener.wait_for_stop("test ");
        assert!(!listener.has_thread());
        assert!(wait_until(WAIT, || listener.phase() == Phase::Closed));
        assert_eq!(peer.count(StreamOp::WritesDone), 1);
    }

    #[test]
    fn wait_without_start_returns_immediately() {
        let listener = StreamListener::new(ListenerId(1000), "idle", fast_config());
        listener.signal_stop("test ");
        listener.wait_for_stop("test ");
        listener.wait_for_stop("test ");
        assert_eq!(listener.phase(), Phase::Created);
    }

    #[test]
    fn unknown_tag_terminates() {
        let stub = LoopbackStub::new();
        let seen = Arc::new(Seen::default());
        let (listener, peer) = start(&stub, &seen, None);
        assert!(wait_until(WAIT, || peer.has_pending_read()));

        peer.inject(Tag(99_999), true);
        assert!(wait_until(WAIT, || listener.phase() == Phase::Closed));
        listener.wait_for_stop("test ");
        assert_eq!(seen.data.load(Ordering::SeqCst), 0);
        assert_eq!(seen.disconnects.load(Ordering::SeqCst), 0);
        assert!(peer.is_queue_shut_down());
    }

    #[test]
    fn queue_shutdown_forces_close() {
        let stub = LoopbackStub::new();
        let seen = Arc::new(Seen::default());
        let (listener, peer) = start(&stub, &seen, None);
        assert!(wait_until(WAIT, || peer.has_pending_read()));

        peer.tear_down();
        assert!(wait_until(WAIT, || listener.phase() == Phase::Closed));
        listener.wait_for_stop("test ");
        assert_eq!(seen.disconnects.load(Ordering::SeqCst), 0);
        assert_eq!(peer.count(StreamOp::WritesDone), 0);
    }

    #[test]
    fn unresponsive_peer_bounded_by_drain_timeouts() {
        let stub = LoopbackStub::new();
        stub.set_call_options(CallOptions {
            fail_at: None,
            unresponsive: true,
        });
        let config = ListenerConfig {
            poll_timeout_ms: 10,
            max_drain_timeouts: Some(3),
            ..ListenerConfig::default()
        };
        let listener = StreamListener::new(ListenerId(2000), "stubborn", config);
        let seen = Arc::new(Seen::default());
        listener
            .start(opener(&stub), b"{}".to_vec(), counting(&seen, None))
            .unwrap();
        let peer = stub.accept(WAIT).unwrap().peer;
        assert!(wait_until(WAIT, || peer.has_pending_read()));

        listener.signal_stop("test ");
        listener.wait_for_stop("test ");
        assert_eq!(listener.phase(), Phase::Closed);
        assert_eq!(peer.count(StreamOp::WritesDone), 1);
        assert!(peer.polls_since_half_close().unwrap() >= 3);
    }

    #[test]
    fn opener_failure_reports_disconnect() {
        let listener = StreamListener::new(ListenerId(3000), "no-route", fast_config());
        let seen = Arc::new(Seen::default());
        let failing: StreamOpener = Box::new(|_ctx: &CallContext| Err(TmsError::Transport("unreachable".into())));
        listener
            .start(failing, Vec::new(), counting(&seen, None))
            .unwrap();
        listener.wait_for_stop("test ");
        assert_eq!(listener.phase(), Phase::Closed);
        assert_eq!(seen.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn decoding_consumer_maps_frames_and_disconnect() {
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let mut consumer = decoding_consumer(move |event: &PortfolioEvent, _caller: &str| {
            sink.lock().push(event.clone());
            true
        });

        let frame = codec::encode(&PortfolioEvent::Added {
            portfolio_name: "Growth".to_string(),
        })
        .unwrap();
        assert!(consumer(Delivery::Data(&frame), "[t] "));
        assert!(consumer(Delivery::Data(b"garbage"), "[t] "));
        assert!(consumer(Delivery::Disconnected, "[t] "));

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            PortfolioEvent::Added {
                portfolio_name: "Growth".to_string()
            }
        );
        assert_eq!(events[1].feed_status(), Some(FeedStatus::Disconnected));
    }
}
