//! One-shot snapshot of market targets.
//!
//! Collects `Added` targets until the feed reports `InitialStateReceived`,
//! then returns `false` from the consumer so the listener drains its own
//! call. Streaming target updates after the snapshot are never read.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tms_core::transport::TmsRemote;
use tms_core::{FeedStatus, Fields, ListenerId, SubscribeForTargetsRequest, TargetEvent, TmsError};
use tracing::{debug, info, warn};

use crate::listener::Phase;
use crate::registry::ListenerRegistry;

pub const FIELD_TGT_ID: &str = "TgtID";
pub const FIELD_PORTFOLIO: &str = "Portfolio";
pub const FIELD_INSTRUMENT: &str = "Instrument";
pub const FIELD_TGT_QTY: &str = "TgtQty";
pub const FIELD_FILL_QTY: &str = "FillQty";

/// One market target as reported in the snapshot. Missing fields default.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRow {
    pub target_id: i64,
    pub portfolio: String,
    pub instrument: String,
    pub target_qty: f64,
    pub fill_qty: f64,
}

impl TargetRow {
    pub fn from_fields(fields: &Fields) -> Self {
        Self {
            target_id: fields.numeric(FIELD_TGT_ID).unwrap_or(0.0) as i64,
            portfolio: fields.string(FIELD_PORTFOLIO).unwrap_or_default().to_string(),
            instrument: fields.string(FIELD_INSTRUMENT).unwrap_or_default().to_string(),
            target_qty: fields.numeric(FIELD_TGT_QTY).unwrap_or(0.0),
            fill_qty: fields.numeric(FIELD_FILL_QTY).unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Default)]
struct SnapshotState {
    rows: Mutex<Vec<TargetRow>>,
    complete: AtomicBool,
    disconnected: AtomicBool,
}

impl SnapshotState {
    fn process_target_event(&self, event: &TargetEvent, caller: &str) -> bool {
        match event {
            TargetEvent::Added { fields } => {
                let row = TargetRow::from_fields(fields);
                info!(
                    "{caller}target {}, {}, {}, {}, {}",
                    row.target_id, row.portfolio, row.instrument, row.target_qty, row.fill_qty
                );
                self.rows.lock().push(row);
                true
            }
            TargetEvent::FeedStatus { status } => {
                debug!("{caller}target feed status {status:?}, waiting for InitialStateReceived");
                match status {
                    FeedStatus::InitialStateReceived => {
                        info!("{caller}market targets snapshot completed");
                        self.complete.store(true, Ordering::Release);
                        false
                    }
                    FeedStatus::Disconnected => {
                        warn!("{caller}target feed disconnected before snapshot completed");
                        self.disconnected.store(true, Ordering::Release);
                        true
                    }
                    FeedStatus::Connected | FeedStatus::Reconnected => true,
                }
            }
        }
    }
}

/// Requests the current market targets and stops after the initial snapshot.
pub struct TargetSnapshot<S: TmsRemote> {
    registry: Arc<ListenerRegistry<S>>,
    state: Arc<SnapshotState>,
    listener_id: Mutex<Option<ListenerId>>,
}

impl<S: TmsRemote> TargetSnapshot<S> {
    pub fn new(registry: Arc<ListenerRegistry<S>>) -> Self {
        Self {
            registry,
            state: Arc::new(SnapshotState::default()),
            listener_id: Mutex::new(None),
        }
    }

    /// Subscribe for targets, optionally restricted to one portfolio. Fails
    /// with [`TmsError::AlreadyStarted`] until `terminate` releases the previous
    /// subscription.
    pub fn start(&self, portfolio: Option<&str>, debug: bool) -> Result<ListenerId, TmsError> {
        let mut slot = self.listener_id.lock();
        if slot.is_some() {
            return Err(TmsError::AlreadyStarted("Market Targets Snapshot".to_string()));
        }
        let request = SubscribeForTargetsRequest {
            portfolio: portfolio.map(str::to_string),
        };
        let state = Arc::clone(&self.state);
        let id = self.registry.start_listening(
            S::subscribe_for_targets,
            &request,
            move |event: &TargetEvent, caller: &str| state.process_target_event(event, caller),
            "Market Targets Snapshot",
            debug,
        )?;
        *slot = Some(id);
        Ok(id)
    }

    /// Wait until the snapshot completes, the feed disconnects, or `timeout`
    /// passes. Returns whether the snapshot completed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_complete() {
                return true;
            }
            if self.state.disconnected.load(Ordering::Acquire) || Instant::now() >= deadline {
                return false;
            }
            let closed = self
                .listener_id()
                .and_then(|id| self.registry.phase(id))
                .is_some_and(|phase| phase == Phase::Closed);
            if closed {
                return self.is_complete();
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.complete.load(Ordering::Acquire)
    }

    pub fn listener_id(&self) -> Option<ListenerId> {
        *self.listener_id.lock()
    }

    pub fn rows(&self) -> Vec<TargetRow> {
        self.state.rows.lock().clone()
    }

    /// Stop the listener if still running and join it.
    pub fn terminate(&self, caller: &str) {
        if let Some(id) = self.listener_id.lock().take() {
            self.registry.stop_listener(id, caller);
            self.registry.terminate_listener(id, caller);
        }
    }
}

impl<S: TmsRemote> Drop for TargetSnapshot<S> {
    fn drop(&mut self) {
        self.terminate("[target snapshot drop] ");
    }
}
