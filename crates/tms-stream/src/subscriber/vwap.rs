//! Interval VWAP over one instrument's market data.
//!
//! Market data updates are not all trades, and replaying a non-trade update
//! would count the last trade twice. An update is treated as a trade only when
//! its cumulative size (`AccumSize`) rises above the highest value seen so far.
//! The first update has no watermark to compare against; it counts only if its
//! `TradeTime` is later than the subscription start, which excludes the
//! snapshot of a trade that happened before we subscribed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tms_core::transport::TmsRemote;
use tms_core::{ListenerId, MarketDataEvent, SubscribeForMarketDataRequest, TmsError, time_util};
use tracing::{debug, info, warn};

use crate::registry::ListenerRegistry;

pub const FIELD_LAST_PX: &str = "LastPx";
pub const FIELD_LAST_SIZE: &str = "LastSize";
pub const FIELD_ACCUM_SIZE: &str = "AccumSize";
pub const FIELD_TRADE_TIME: &str = "TradeTime";

#[derive(Debug, Default)]
struct VwapInner {
    accumulated_value: f64,
    accumulated_qty: i64,
    /// Highest `AccumSize` seen. `None` until the first update.
    last_accum_size: Option<f64>,
}

impl VwapInner {
    fn apply(&mut self, last_px: f64, last_size: i64) -> bool {
        if last_px == 0.0 || last_size == 0 {
            return false;
        }
        self.accumulated_value += last_px * last_size as f64;
        self.accumulated_qty += last_size;
        true
    }
}

/// Accumulator shared between a [`VwapSubscriber`] and its listener thread.
#[derive(Debug, Default)]
pub struct VwapState {
    inner: Mutex<VwapInner>,
    start_time_ms: AtomicU64,
}

impl VwapState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the subscription start time, in epoch milliseconds.
    pub fn mark_start(&self, now_ms: u64) {
        self.start_time_ms.store(now_ms, Ordering::Release);
    }

    pub fn start_time_ms(&self) -> u64 {
        self.start_time_ms.load(Ordering::Acquire)
    }

    /// Apply one market data event. Always keeps the subscription alive.
    pub fn process_market_data_event(&self, event: &MarketDataEvent, caller: &str) -> bool {
        let MarketDataEvent::Update { instrument, fields } = event else {
            return true;
        };
        let Some(current) = fields.numeric(FIELD_ACCUM_SIZE) else {
            debug!("{caller}{instrument}: update without {FIELD_ACCUM_SIZE} ignored");
            return true;
        };

        let mut inner = self.inner.lock();
        let previous = inner.last_accum_size;
        inner.last_accum_size = Some(previous.map_or(current, |p| p.max(current)));

        let is_trade = match previous {
            Some(p) => current > p,
            None => fields
                .numeric(FIELD_TRADE_TIME)
                .is_some_and(|t| t > self.start_time_ms() as f64),
        };
        if !is_trade {
            return true;
        }

        let last_px = fields.numeric(FIELD_LAST_PX).unwrap_or(0.0);
        let last_size = fields.numeric(FIELD_LAST_SIZE).unwrap_or(0.0) as i64;
        if inner.apply(last_px, last_size) {
            debug!("{caller}{instrument}: trade {last_size} @ {last_px}");
        }
        true
    }

    /// Volume-weighted average price since start. `None` before any trade.
    pub fn interval_vwap(&self) -> Option<f64> {
        let inner = self.inner.lock();
        (inner.accumulated_qty != 0).then(|| inner.accumulated_value / inner.accumulated_qty as f64)
    }

    pub fn interval_accum_size(&self) -> i64 {
        self.inner.lock().accumulated_qty
    }
}

/// Subscribes to market data for one instrument and tracks its interval VWAP.
///
/// One listener at a time: a second `start` fails until `terminate` releases
/// the first. Stopping and terminating are idempotent; dropping the subscriber
/// does both.
pub struct VwapSubscriber<S: TmsRemote> {
    registry: Arc<ListenerRegistry<S>>,
    record_name: String,
    state: Arc<VwapState>,
    listener_id: Mutex<Option<ListenerId>>,
}

impl<S: TmsRemote> VwapSubscriber<S> {
    pub fn new(registry: Arc<ListenerRegistry<S>>, record_name: &str) -> Self {
        Self {
            registry,
            record_name: record_name.to_string(),
            state: Arc::new(VwapState::new()),
            listener_id: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.record_name
    }

    pub fn state(&self) -> &Arc<VwapState> {
        &self.state
    }

    pub fn listener_id(&self) -> Option<ListenerId> {
        *self.listener_id.lock()
    }

    /// Start listening for the instrument's trades.
    pub fn start(&self, debug: bool) -> Result<ListenerId, TmsError> {
        let mut slot = self.listener_id.lock();
        if let Some(id) = *slot {
            warn!("[vwap] {} already listening as {id}", self.record_name);
            return Err(TmsError::AlreadyStarted(self.record_name.clone()));
        }

        let request = SubscribeForMarketDataRequest {
            instruments: vec![self.record_name.clone()],
            fields: [FIELD_LAST_PX, FIELD_LAST_SIZE, FIELD_ACCUM_SIZE, FIELD_TRADE_TIME]
                .iter()
                .map(|f| f.to_string())
                .collect(),
        };

        self.state.mark_start(time_util::now_ms());
        let state = Arc::clone(&self.state);
        let id = self.registry.start_listening(
            S::subscribe_for_market_data,
            &request,
            move |event: &MarketDataEvent, caller: &str| state.process_market_data_event(event, caller),
            &format!("Market Data Listener for {}", self.record_name),
            debug,
        )?;
        *slot = Some(id);
        info!("[vwap] {} listening as {id}", self.record_name);
        Ok(id)
    }

    pub fn stop(&self, caller: &str) {
        if let Some(id) = self.listener_id() {
            self.registry.stop_listener(id, caller);
        }
    }

    /// Join the listener thread and forget its id.
    pub fn terminate(&self, caller: &str) {
        let id = self.listener_id.lock().take();
        if let Some(id) = id {
            self.registry.terminate_listener(id, caller);
        }
    }

    pub fn interval_vwap(&self) -> Option<f64> {
        self.state.interval_vwap()
    }

    pub fn interval_accum_size(&self) -> i64 {
        self.state.interval_accum_size()
    }
}

impl<S: TmsRemote> Drop for VwapSubscriber<S> {
    fn drop(&mut self) {
        let caller = "[vwap drop] ";
        self.stop(caller);
        self.terminate(caller);
    }
}
