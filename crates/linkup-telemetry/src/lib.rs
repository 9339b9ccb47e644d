mod logging;
mod metrics;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};
pub use metrics::{HistogramSummary, MetricsQuery, MetricsRecorder, MetricsSnapshot, MetricType};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    /// Path to the log database.
    pub log_db_path: PathBuf,
    /// Whether metrics recording is enabled.
    pub metrics_enabled: bool,
    /// Path to the metrics database.
    pub metrics_db_path: PathBuf,
    /// How often to snapshot metrics to SQLite (seconds).
    pub metrics_snapshot_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            log_level: Level::INFO,
            log_to_sqlite: true,
            log_db_path: data_dir.join("logs.db"),
            metrics_enabled: true,
            metrics_db_path: data_dir.join("metrics.db"),
            metrics_snapshot_interval_secs: 60,
        }
    }
}

/// Handle to the telemetry subsystem. Keep alive for the process lifetime.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    metrics_recorder: Option<Arc<MetricsRecorder>>,
}

impl TelemetryGuard {
    /// Access the metrics recorder for recording and querying.
    pub fn metrics(&self) -> Option<Arc<MetricsRecorder>> {
        self.metrics_recorder.clone()
    }

    /// Access the log sink for querying persisted logs.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.log_level.to_string().to_lowercase())
    });

    // JSON formatting layer for stdout
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_filter(env_filter);

    // Optional SQLite log sink for warn+ logs
    let (sqlite_layer, sqlite_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                let layer = SqliteLogLayer::new(sink.clone());
                (Some(layer), Some(sink))
            }
            Err(e) => {
                eprintln!("linkup-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .init();

    let metrics_recorder = if config.metrics_enabled {
        match MetricsRecorder::new(&config.metrics_db_path) {
            Ok(recorder) => Some(Arc::new(recorder)),
            Err(e) => {
                tracing::warn!("linkup-telemetry: failed to open metrics DB: {e}");
                None
            }
        }
    } else {
        None
    };

    TelemetryGuard {
        log_sink: sqlite_sink,
        metrics_recorder,
    }
}

/// Spawn a background task that snapshots metrics on an interval.
pub fn start_snapshot_task(
    recorder: Arc<MetricsRecorder>,
    interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        ticker.tick().await; // consume first immediate tick
        loop {
            ticker.tick().await;
            if let Err(e) = recorder.snapshot() {
                tracing::warn!("metrics snapshot failed: {e}");
            }
        }
    })
}

/// Fallback data dir for default paths.
fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".linkup")
}
