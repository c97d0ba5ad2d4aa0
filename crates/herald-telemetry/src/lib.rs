mod logging;
mod metrics;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};
pub use metrics::{MetricKind, MetricSample, MetricsRecorder};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Configuration for logging and metrics.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "herald_connectors" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stdout instead of compact text.
    pub json_logs: bool,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
    /// Whether metric snapshots are written to SQLite.
    pub metrics_persist: bool,
    pub metrics_db_path: PathBuf,
    pub metrics_snapshot_interval_secs: u64,
    pub metrics_retention_days: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        let base = herald_home();
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json_logs: false,
            log_to_sqlite: true,
            log_db_path: base.join("database/logs.db"),
            metrics_persist: true,
            metrics_db_path: base.join("database/metrics.db"),
            metrics_snapshot_interval_secs: 60,
            metrics_retention_days: 7,
        }
    }
}

/// Handles kept alive for the life of the process.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    metrics: Arc<MetricsRecorder>,
}

impl TelemetryGuard {
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.metrics)
    }

    /// Persisted warn+ logs, if the SQLite sink opened.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// Build the filter directive string: default level plus module overrides.
pub fn filter_directives(config: &TelemetryConfig) -> String {
    let mut directives = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        directives.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    directives
}

/// Install the global subscriber. Call once at startup; later calls only
/// build a fresh metrics recorder.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().compact().with_target(true).boxed()
    };

    let (sqlite_layer, log_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(Arc::clone(&sink))), Some(sink))
            }
            Err(e) => {
                eprintln!("herald-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    if tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .with(sqlite_layer)
        .try_init()
        .is_err()
    {
        eprintln!("herald-telemetry: global subscriber already set");
    }

    let metrics = if config.metrics_persist {
        match MetricsRecorder::persistent(&config.metrics_db_path) {
            Ok(recorder) => recorder,
            Err(e) => {
                tracing::warn!(error = %e, "failed to open metrics DB, keeping metrics in memory");
                MetricsRecorder::in_memory()
            }
        }
    } else {
        MetricsRecorder::in_memory()
    };

    TelemetryGuard {
        log_sink,
        metrics: Arc::new(metrics),
    }
}

/// `~/.herald`, or `/tmp/.herald` without a home directory.
pub fn herald_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".herald")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("herald_engine".into(), Level::DEBUG)],
            ..Default::default()
        };
        assert_eq!(filter_directives(&config), "warn,herald_engine=debug");
    }

    #[test]
    fn default_paths_live_under_herald_home() {
        let config = TelemetryConfig::default();
        assert!(config.log_db_path.starts_with(herald_home()));
        assert!(config.metrics_db_path.ends_with("database/metrics.db"));
    }

    #[test]
    fn init_without_persistence_keeps_metrics_in_memory() {
        let guard = init_telemetry(&TelemetryConfig {
            log_to_sqlite: false,
            metrics_persist: false,
            ..Default::default()
        });
        assert!(guard.logs().is_none());
        let metrics = guard.metrics();
        metrics.counter_inc("topics.created", &[], 1);
        assert_eq!(metrics.counter_get("topics.created", &[]), 1);
        assert!(!metrics.is_persistent());
    }
}
