//! Listener registry: directory of running subscriptions keyed by id.
//!
//! The registry owns the transport stub and every [`StreamListener`] it
//! creates. It is an explicitly constructed context object, shared as
//! `Arc<ListenerRegistry<S>>` with the subscribers that use it.
//!
//! The id map is only touched under its lock, and the lock is never held
//! while calling into a listener: control calls clone the listener's `Arc`
//! out of the map first, so a slow join never blocks other registrations.
//!
//! ```text
//! start_listening ──► next id ──► StreamListener::new ──► map.insert ──► start()
//! stop_listener(id) ──► map.get ──► signal_stop      (outside the lock)
//! terminate(caller) ──► snapshot ──► wait_for_stop × N
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tms_core::config::{ListenerConfig, RegistryConfig};
use tms_core::transport::{CallContext, OpenedStream, StreamOpener};
use tms_core::{FeedEvent, ListenerId, TmsError, codec};
use tracing::{info, warn};

use crate::listener::{Phase, StreamListener, decoding_consumer};

pub struct ListenerRegistry<S> {
    stub: Arc<S>,
    config: RegistryConfig,
    listener_config: ListenerConfig,
    counter: AtomicU64,
    listeners: Mutex<BTreeMap<ListenerId, Arc<StreamListener>>>,
}

impl<S: Send + Sync + 'static> ListenerRegistry<S> {
    /// Create a registry bound to `stub`.
    pub fn new(
        stub: Arc<S>,
        config: RegistryConfig,
        listener_config: ListenerConfig,
    ) -> Result<Self, TmsError> {
        config.validate()?;
        listener_config.validate()?;
        Ok(Self {
            stub,
            config,
            listener_config,
            counter: AtomicU64::new(0),
            listeners: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn stub(&self) -> &Arc<S> {
        &self.stub
    }

    /// Start a new subscription and return its id.
    ///
    /// `method` is the stub's stream-opening RPC; it is bound to the stored
    /// stub and invoked on the listener thread. `request` is sent once the
    /// call is up, and `consumer` receives every decoded event until it
    /// returns `false` or the listener is stopped.
    pub fn start_listening<Req, Ev, M, C>(
        &self,
        method: M,
        request: &Req,
        consumer: C,
        name: &str,
        initial_debug: bool,
    ) -> Result<ListenerId, TmsError>
    where
        Req: Serialize,
        Ev: FeedEvent,
        M: Fn(&S, &CallContext) -> Result<OpenedStream, TmsError> + Send + 'static,
        C: FnMut(&Ev, &str) -> bool + Send + 'static,
    {
        let frame = codec::encode(request)?;
        let id = self.next_id();

        let listener = Arc::new(StreamListener::new(id, name, self.listener_config.clone()));
        listener.set_debug(initial_debug);

        let stub = Arc::clone(&self.stub);
        let opener: StreamOpener = Box::new(move |ctx: &CallContext| method(&*stub, ctx));

        self.listeners.lock().insert(id, Arc::clone(&listener));

        if let Err(e) = listener.start(opener, frame, decoding_consumer::<Ev, C>(consumer)) {
            self.listeners.lock().remove(&id);
            return Err(e);
        }
        info!("[registry] listener {id} '{name}' started");
        Ok(id)
    }

    pub fn set_debug(&self, id: ListenerId, debug: bool) {
        if let Some(listener) = self.get(id) {
            listener.set_debug(debug);
        }
    }

    /// Signal one listener to stop. No-op for unknown ids.
    pub fn stop_listener(&self, id: ListenerId, caller: &str) {
        if let Some(listener) = self.get(id) {
            listener.signal_stop(caller);
        }
    }

    /// Wait for one listener's thread to exit. No-op for unknown ids.
    pub fn terminate_listener(&self, id: ListenerId, caller: &str) {
        if let Some(listener) = self.get(id) {
            listener.wait_for_stop(caller);
        }
    }

    /// Signal every listener to stop.
    pub fn stop_all_listeners(&self, caller: &str) {
        for listener in self.snapshot() {
            listener.signal_stop(caller);
        }
    }

    /// Wait for every listener's thread to exit.
    pub fn terminate(&self, caller: &str) {
        let listeners = self.snapshot();
        for listener in &listeners {
            listener.wait_for_stop(caller);
        }
        info!("{caller}[registry] {} listener(s) terminated", listeners.len());
    }

    pub fn phase(&self, id: ListenerId) -> Option<Phase> {
        self.get(id).map(|l| l.phase())
    }

    pub fn listener_ids(&self) -> Vec<ListenerId> {
        self.listeners.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    fn next_id(&self) -> ListenerId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        ListenerId(self.config.id_base + n * self.config.id_stride)
    }

    fn get(&self, id: ListenerId) -> Option<Arc<StreamListener>> {
        let listener = self.listeners.lock().get(&id).cloned();
        if listener.is_none() {
            warn!("[registry] no listener with id {id}");
        }
        listener
    }

    fn snapshot(&self) -> Vec<Arc<StreamListener>> {
        self.listeners.lock().values().cloned().collect()
    }
}

impl<S> Drop for ListenerRegistry<S> {
    fn drop(&mut self) {
        let caller = "[registry drop] ";
        let listeners: Vec<_> = self.listeners.get_mut().values().cloned().collect();
        for listener in &listeners {
            listener.signal_stop(caller);
        }
        for listener in &listeners {
            listener.wait_for_stop(caller);
        }
    }
}
