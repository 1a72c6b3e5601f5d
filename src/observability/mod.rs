//! Observability for slackline
//!
//! - Structured logging through `tracing`
//! - Atomic operational counters
//!
//! # Usage
//!
//! ```ignore
//! use slackline::observability::{init_tracing, LogFormat, MetricsRegistry};
//!
//! init_tracing(LogFormat::Json);
//! let metrics = MetricsRegistry::new();
//! metrics.increment_sessions_opened();
//! ```

mod metrics;

pub use metrics::{MetricsRegistry, MetricsSnapshot};

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Install the global subscriber.
///
/// Filtering follows `RUST_LOG`, defaulting to `info`. Safe to call more
/// than once; only the first call has an effect.
pub fn init_tracing(format: LogFormat) {
    TRACING_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(filter);

        let _ = match format {
            LogFormat::Pretty => registry
                .with(tracing_subscriber::fmt::layer().with_target(true))
                .try_init(),
            LogFormat::Json => registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init(),
        };
    });
}
