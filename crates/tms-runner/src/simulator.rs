//! Synthetic TMS server on the loopback transport.
//!
//! An acceptor thread takes every call opened through the stub and hands it
//! to a feeder thread that plays the server side: it waits for the client's
//! subscription request, sends an initial snapshot followed by
//! `InitialStateReceived`, then streams updates until the call closes or the
//! simulator stops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::RecvTimeoutError;
use tms_core::config::SimulatorConfig;
use tms_core::{
    FeedStatus, Fields, MarketDataEvent, PortfolioEvent, SubscribeForMarketDataRequest,
    SubscribeForPortfoliosRequest, SubscribeForTargetsRequest, TargetEvent, time_util,
};
use tms_stream::loopback::{IncomingCall, LoopbackPeer, LoopbackStub};
use tms_stream::subscriber::targets::{
    FIELD_FILL_QTY, FIELD_INSTRUMENT, FIELD_PORTFOLIO, FIELD_TGT_ID, FIELD_TGT_QTY,
};
use tms_stream::subscriber::vwap::{FIELD_ACCUM_SIZE, FIELD_LAST_PX, FIELD_LAST_SIZE, FIELD_TRADE_TIME};
use tracing::{debug, info, warn};

const ACCEPT_POLL: Duration = Duration::from_millis(100);

pub struct Simulator {
    running: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl Simulator {
    /// Start serving calls opened through `stub`.
    pub fn start(stub: &LoopbackStub, config: SimulatorConfig) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let incoming = stub.incoming();
        let flag = Arc::clone(&running);

        let acceptor = thread::Builder::new()
            .name("tms-simulator".to_string())
            .spawn(move || {
                let mut feeders: Vec<JoinHandle<()>> = Vec::new();
                while flag.load(Ordering::Acquire) {
                    match incoming.recv_timeout(ACCEPT_POLL) {
                        Ok(call) => match spawn_feeder(call, &config, &flag) {
                            Ok(handle) => feeders.push(handle),
                            Err(e) => warn!("[simulator] failed to spawn feeder: {e}"),
                        },
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    feeders.retain(|h| !h.is_finished());
                }
                for handle in feeders {
                    let _ = handle.join();
                }
                info!("[simulator] acceptor exited");
            })?;

        Ok(Self {
            running,
            acceptor: Some(acceptor),
        })
    }

    /// Stop the acceptor and every feeder, and wait for them.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.acceptor.take()
            && handle.join().is_err()
        {
            warn!("[simulator] acceptor panicked");
        }
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_feeder(call: IncomingCall, config: &SimulatorConfig, running: &Arc<AtomicBool>) -> Result<JoinHandle<()>> {
    let config = config.clone();
    let running = Arc::clone(running);
    let handle = thread::Builder::new()
        .name(format!("tms-feed-{}", call.listener_id))
        .spawn(move || {
            info!("[simulator] serving {} for '{}' ({})", call.method, call.name, call.listener_id);
            let feeder = Feeder {
                peer: call.peer,
                config,
                running,
            };
            let served = match call.method {
                "subscribeForMarketData" => feeder.market_data(),
                "subscribeForMarketPortfolios" => feeder.portfolios(),
                "subscribeForMarketTargets" => feeder.targets(),
                other => {
                    warn!("[simulator] unknown method {other}");
                    feeder.peer.close();
                    Ok(())
                }
            };
            if let Err(e) = served {
                warn!("[simulator] feeder for {} failed: {e}", call.listener_id);
            }
            debug!("[simulator] feeder for {} exited", call.listener_id);
        })?;
    Ok(handle)
}

struct Feeder {
    peer: LoopbackPeer,
    config: SimulatorConfig,
    running: Arc<AtomicBool>,
}

impl Feeder {
    fn live(&self) -> bool {
        self.running.load(Ordering::Acquire) && self.peer.is_open()
    }

    /// Wait for the client's subscription request. `None` if the call ends first.
    fn await_request<T: serde::de::DeserializeOwned>(&self) -> Result<Option<T>> {
        while self.live() {
            if let Some(request) = self.peer.request::<T>() {
                return Ok(Some(request?));
            }
            thread::sleep(Duration::from_millis(5));
        }
        Ok(None)
    }

    fn status<E: serde::Serialize>(&self, event: &E) -> Result<bool> {
        Ok(self.peer.push(event)?)
    }

    /// Stream `next` every update interval while the call is live.
    fn stream(&self, mut next: impl FnMut(u64) -> Result<bool>) -> Result<()> {
        let mut seq = 0;
        while self.live() {
            thread::sleep(self.config.update_interval());
            seq += 1;
            if !next(seq)? {
                break;
            }
        }
        Ok(())
    }

    fn market_data(&self) -> Result<()> {
        let Some(request) = self.await_request::<SubscribeForMarketDataRequest>()? else {
            return Ok(());
        };
        self.status(&MarketDataEvent::FeedStatus {
            status: FeedStatus::Connected,
        })?;

        let mut books: Vec<Book> = request.instruments.iter().map(|i| Book::new(i)).collect();
        // Snapshot of the last trade, made before the subscription.
        for book in &books {
            let trade_time = time_util::now_ms().saturating_sub(60_000) as f64;
            if !self.peer.push(&book.update(trade_time))? {
                return Ok(());
            }
        }
        self.status(&MarketDataEvent::FeedStatus {
            status: FeedStatus::InitialStateReceived,
        })?;

        self.stream(|seq| {
            for book in &mut books {
                // Every third update is a quote refresh that repeats the last trade.
                if seq % 3 != 0 {
                    book.trade(seq);
                }
                if !self.peer.push(&book.update(time_util::now_ms() as f64))? {
                    return Ok(false);
                }
            }
            Ok(true)
        })
    }

    fn portfolios(&self) -> Result<()> {
        if self.await_request::<SubscribeForPortfoliosRequest>()?.is_none() {
            return Ok(());
        }
        self.status(&PortfolioEvent::FeedStatus {
            status: FeedStatus::Connected,
        })?;
        for name in &self.config.portfolios {
            self.peer.push(&PortfolioEvent::Added {
                portfolio_name: name.clone(),
            })?;
        }
        self.status(&PortfolioEvent::FeedStatus {
            status: FeedStatus::InitialStateReceived,
        })?;

        let portfolios = self.config.portfolios.clone();
        self.stream(|seq| {
            let Some(name) = portfolios.get(seq as usize % portfolios.len().max(1)) else {
                return Ok(true);
            };
            self.peer.push(&PortfolioEvent::Updated {
                portfolio_name: name.clone(),
            })
            .map_err(Into::into)
        })
    }

    fn targets(&self) -> Result<()> {
        let Some(request) = self.await_request::<SubscribeForTargetsRequest>()? else {
            return Ok(());
        };
        self.status(&TargetEvent::FeedStatus {
            status: FeedStatus::Connected,
        })?;

        let portfolio = request
            .portfolio
            .or_else(|| self.config.portfolios.first().cloned())
            .unwrap_or_default();
        let instruments = ["IBM", "MSFT", "AAPL", "ORCL", "INTC"];
        for n in 0..self.config.target_count {
            let instrument = instruments[n as usize % instruments.len()];
            let fields = Fields::new()
                .with_numeric(FIELD_TGT_ID, f64::from(n + 1))
                .with_string(FIELD_PORTFOLIO, &portfolio)
                .with_string(FIELD_INSTRUMENT, instrument)
                .with_numeric(FIELD_TGT_QTY, f64::from((n + 1) * 100))
                .with_numeric(FIELD_FILL_QTY, 0.0);
            self.peer.push(&TargetEvent::Added { fields })?;
        }
        self.status(&TargetEvent::FeedStatus {
            status: FeedStatus::InitialStateReceived,
        })?;

        // Live updates; a snapshot client half-closes before reading these.
        self.stream(|seq| {
            let fields = Fields::new()
                .with_numeric(FIELD_TGT_ID, 1.0)
                .with_string(FIELD_PORTFOLIO, &portfolio)
                .with_string(FIELD_INSTRUMENT, instruments[0])
                .with_numeric(FIELD_TGT_QTY, 100.0)
                .with_numeric(FIELD_FILL_QTY, seq as f64);
            self.peer.push(&TargetEvent::Added { fields }).map_err(Into::into)
        })
    }
}

/// Last-trade state of one simulated instrument.
struct Book {
    instrument: String,
    base_px: f64,
    last_px: f64,
    last_size: f64,
    accum_size: f64,
}

impl Book {
    fn new(instrument: &str) -> Self {
        let base_px = 50.0 + instrument.bytes().map(f64::from).sum::<f64>() % 200.0;
        Self {
            instrument: instrument.to_string(),
            base_px,
            last_px: base_px,
            last_size: 100.0,
            accum_size: 100.0,
        }
    }

    fn trade(&mut self, seq: u64) {
        let tick = (seq % 11) as f64 - 5.0;
        self.last_px = self.base_px + tick * 0.05;
        self.last_size = 100.0 * (1 + seq % 4) as f64;
        self.accum_size += self.last_size;
    }

    fn update(&self, trade_time: f64) -> MarketDataEvent {
        MarketDataEvent::Update {
            instrument: self.instrument.clone(),
            fields: Fields::new()
                .with_numeric(FIELD_LAST_PX, self.last_px)
                .with_numeric(FIELD_LAST_SIZE, self.last_size)
                .with_numeric(FIELD_ACCUM_SIZE, self.accum_size)
                .with_numeric(FIELD_TRADE_TIME, trade_time),
        }
    }
}
