//! # tms-runner
//!
//! Runs the TMS streaming subscribers against an in-process simulated server.
//!
//! Loads a JSON configuration file (or defaults), starts the configured
//! portfolio, VWAP and target-snapshot subscriptions through one listener
//! registry, and shuts them all down on Ctrl+C or after a fixed duration.
//!
//! # Usage
//!
//! ```bash
//! tms-runner --config config.json --log-level info --duration-secs 30
//! ```

mod simulator;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tms_core::config::AppConfig;
use tms_stream::ListenerRegistry;
use tms_stream::loopback::LoopbackStub;
use tms_stream::subscriber::{PortfolioSubscriber, TargetSnapshot, VwapSubscriber};
use tracing::{error, info, warn};

use crate::simulator::Simulator;

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);

/// TMS streaming subscription runner.
#[derive(Parser)]
#[command(name = "tms-runner", about = "TMS streaming subscription runner")]
struct Cli {
    /// Configuration file path (JSON). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(short, long)]
    log_level: Option<String>,

    /// Optional log directory for file output. Overrides the config file.
    #[arg(long)]
    log_dir: Option<String>,

    /// Stop after this many seconds instead of waiting for Ctrl+C.
    #[arg(long)]
    duration_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = match &cli.config {
        Some(path) => tms_core::config::load_config(path)?,
        None => AppConfig::default(),
    };

    // 2. Initialize logging
    let log_level = cli.log_level.as_deref().or(config.log.level.as_deref()).unwrap_or("info");
    let log_dir = cli.log_dir.as_deref().or(config.log.dir.as_deref());
    tms_core::logging::init_logging(log_level, log_dir, "tms-runner")?;
    info!(
        "tms-runner starting: config={}, log_level={log_level}",
        cli.config.as_ref().map_or("<defaults>".to_string(), |p| p.display().to_string()),
    );

    // 3. Transport, simulated server and registry
    let stub = LoopbackStub::new();
    let mut simulator = Simulator::start(&stub, config.simulator.clone())?;
    let registry = Arc::new(ListenerRegistry::new(
        Arc::new(stub),
        config.registry.clone(),
        config.listener.clone(),
    )?);

    // 4. Start subscribers
    let debug = config.subscriptions.debug;
    let mut portfolio_ids = Vec::new();
    for n in 0..config.subscriptions.portfolio_listeners {
        let id = PortfolioSubscriber::start(&registry, &format!("Portfolio Listener {n}"), debug)?;
        portfolio_ids.push(id);
    }

    let mut vwaps = Vec::new();
    for instrument in &config.subscriptions.vwap_instruments {
        let subscriber = VwapSubscriber::new(Arc::clone(&registry), instrument);
        subscriber.start(debug)?;
        vwaps.push(subscriber);
    }

    let snapshot = if config.subscriptions.target_snapshot {
        let snapshot = TargetSnapshot::new(Arc::clone(&registry));
        snapshot.start(None, debug)?;
        Some(snapshot)
    } else {
        None
    };

    info!(
        "{} listener(s) started ({} portfolio, {} vwap, snapshot={}), press Ctrl+C to stop",
        registry.len(),
        portfolio_ids.len(),
        vwaps.len(),
        snapshot.is_some(),
    );

    // 5. Report the target snapshot once it completes
    let snapshot = match snapshot {
        Some(snapshot) => {
            let snapshot = tokio::task::spawn_blocking(move || {
                if snapshot.wait(SNAPSHOT_TIMEOUT) {
                    info!("target snapshot: {} target(s)", snapshot.rows().len());
                } else {
                    warn!("target snapshot incomplete after {SNAPSHOT_TIMEOUT:?}");
                }
                snapshot
            })
            .await?;
            Some(snapshot)
        }
        None => None,
    };

    // 6. Wait for shutdown signal or run duration
    let run_for = async {
        match cli.duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("failed to listen for Ctrl+C: {e}");
            }
            info!("shutdown signal received");
        }
        _ = run_for => info!("run duration elapsed"),
    }

    // 7. Stop everything; joins block, so run them off the async workers
    tokio::task::spawn_blocking(move || {
        let caller = "[shutdown] ";
        for id in &portfolio_ids {
            PortfolioSubscriber::stop(&registry, *id, caller);
        }
        for vwap in &vwaps {
            vwap.stop(caller);
        }
        registry.stop_all_listeners(caller);
        registry.terminate(caller);

        for vwap in &vwaps {
            match vwap.interval_vwap() {
                Some(px) => info!(
                    "{}: interval vwap {px:.4} over {} share(s)",
                    vwap.name(),
                    vwap.interval_accum_size()
                ),
                None => info!("{}: no trades in interval", vwap.name()),
            }
        }
        drop(vwaps);
        drop(snapshot);
        drop(registry);
        simulator.stop();
    })
    .await?;

    info!("all listeners stopped, goodbye");
    Ok(())
}
