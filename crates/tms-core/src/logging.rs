//! Logging initialization using the `tracing` ecosystem.
//!
//! Every listener runs on a thread named `tms-listener-<id>` and prefixes its
//! messages with `[<subscription name>] `, so console and file output carry
//! thread names alongside thread ids. A daily-rotating file is added when a
//! log directory is configured.

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter: `level` for everything, read from `RUST_LOG` when set.
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global tracing subscriber.
///
/// - `log_level`: default level if `RUST_LOG` is not set (e.g. `"info"`)
/// - `log_dir`: optional directory for daily-rotating log files
/// - `module_name`: log file prefix (e.g. `"tms-runner"`)
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(log_level: &str, log_dir: Option<&str>, module_name: &str) -> Result<()> {
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true);

    let file_layer = log_dir.map(|dir| {
        fmt::layer()
            .with_writer(tracing_appender::rolling::daily(dir, format!("{module_name}.log")))
            .with_ansi(false)
            .with_thread_names(true)
    });

    tracing_subscriber::registry()
        .with(env_filter(log_level))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("tracing subscriber already installed")
}
