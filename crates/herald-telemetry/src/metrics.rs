use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
        }
    }
}

/// Current value of one metric series.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub kind: MetricKind,
    pub value: f64,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct SeriesKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl SeriesKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    fn labels_json(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        let map: serde_json::Map<String, serde_json::Value> = self
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        serde_json::to_string(&map).ok()
    }
}

/// Counters only go up; gauges hold the last value set, stored as f64 bits.
enum Series {
    Counter(AtomicU64),
    Gauge(AtomicI64),
}

impl Series {
    fn value(&self) -> f64 {
        match self {
            Self::Counter(c) => c.load(Ordering::Relaxed) as f64,
            Self::Gauge(g) => f64::from_bits(g.load(Ordering::Relaxed) as u64),
        }
    }

    fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
        }
    }
}

/// In-memory counters and gauges, optionally snapshotted to SQLite.
pub struct MetricsRecorder {
    series: RwLock<HashMap<SeriesKey, Series>>,
    db: Option<Mutex<Connection>>,
}

impl MetricsRecorder {
    pub fn in_memory() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            db: None,
        }
    }

    pub fn persistent(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS metric_snapshots (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 name TEXT NOT NULL,
                 value REAL NOT NULL,
                 labels TEXT,
                 kind TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_metric_snapshots_name ON metric_snapshots(name, timestamp);",
        )?;
        Ok(Self {
            series: RwLock::new(HashMap::new()),
            db: Some(Mutex::new(conn)),
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.db.is_some()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = SeriesKey::new(name, labels);
        if let Some(Series::Counter(c)) = self.series.read().get(&key) {
            c.fetch_add(n, Ordering::Relaxed);
            return;
        }
        let mut series = self.series.write();
        let entry = series
            .entry(key)
            .or_insert_with(|| Series::Counter(AtomicU64::new(0)));
        if let Series::Counter(c) = entry {
            c.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = SeriesKey::new(name, labels);
        let bits = value.to_bits() as i64;
        if let Some(Series::Gauge(g)) = self.series.read().get(&key) {
            g.store(bits, Ordering::Relaxed);
            return;
        }
        self.series
            .write()
            .insert(key, Series::Gauge(AtomicI64::new(bits)));
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        match self.series.read().get(&SeriesKey::new(name, labels)) {
            Some(Series::Counter(c)) => c.load(Ordering::Relaxed),
            _ => 0,
        }
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        match self.series.read().get(&SeriesKey::new(name, labels)) {
            Some(Series::Gauge(g)) => f64::from_bits(g.load(Ordering::Relaxed) as u64),
            _ => 0.0,
        }
    }

    /// Current values, sorted by name then labels.
    pub fn samples(&self) -> Vec<MetricSample> {
        let mut out: Vec<MetricSample> = self
            .series
            .read()
            .iter()
            .map(|(key, series)| MetricSample {
                name: key.name.clone(),
                labels: key.labels.clone(),
                kind: series.kind(),
                value: series.value(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        out
    }

    /// Write every current value to SQLite. Returns rows written; 0 when in-memory.
    pub fn snapshot(&self) -> Result<usize, rusqlite::Error> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let now = Utc::now().to_rfc3339();
        let mut conn = db.lock();
        let tx = conn.transaction()?;
        let mut written = 0;
        for (key, series) in self.series.read().iter() {
            tx.execute(
                "INSERT INTO metric_snapshots (timestamp, name, value, labels, kind)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![now, key.name, series.value(), key.labels_json(), series.kind().as_str()],
            )?;
            written += 1;
        }
        tx.commit()?;
        Ok(written)
    }

    /// Delete snapshots older than `retention_days`.
    pub fn prune(&self, retention_days: u32) -> Result<usize, rusqlite::Error> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let cutoff = (Utc::now() - chrono::Duration::days(i64::from(retention_days))).to_rfc3339();
        db.lock().execute(
            "DELETE FROM metric_snapshots WHERE timestamp < ?1",
            rusqlite::params![cutoff],
        )
    }

    /// Snapshot row count for one metric name.
    pub fn snapshot_count(&self, name: &str) -> Result<i64, rusqlite::Error> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        db.lock().query_row(
            "SELECT COUNT(*) FROM metric_snapshots WHERE name = ?1",
            [name],
            |row| row.get(0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn temp_db() -> PathBuf {
        std::env::temp_dir()
            .join(format!("herald-test-metrics-{}", uuid::Uuid::now_v7()))
            .join("metrics.db")
    }

    #[test]
    fn counters_are_keyed_by_labels() {
        let m = MetricsRecorder::in_memory();
        m.counter_inc("admissions", &[("reason", "forced")], 1);
        m.counter_inc("admissions", &[("reason", "forced")], 2);
        m.counter_inc("admissions", &[("reason", "early")], 1);

        assert_eq!(m.counter_get("admissions", &[("reason", "forced")]), 3);
        assert_eq!(m.counter_get("admissions", &[("reason", "early")]), 1);
        assert_eq!(m.counter_get("admissions", &[]), 0);
    }

    #[test]
    fn label_order_does_not_matter() {
        let m = MetricsRecorder::in_memory();
        m.counter_inc("sent", &[("a", "1"), ("b", "2")], 1);
        m.counter_inc("sent", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(m.counter_get("sent", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn gauge_holds_last_value() {
        let m = MetricsRecorder::in_memory();
        m.gauge_set("pending.sources", &[], 4.0);
        m.gauge_set("pending.sources", &[], 1.0);
        assert_eq!(m.gauge_get("pending.sources", &[]), 1.0);
    }

    #[test]
    fn samples_are_sorted() {
        let m = MetricsRecorder::in_memory();
        m.gauge_set("topics.active", &[], 3.0);
        m.counter_inc("messages.forwarded", &[], 9);
        let samples = m.samples();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].name, "messages.forwarded");
        assert_eq!(samples[0].kind, MetricKind::Counter);
        assert_eq!(samples[1].value, 3.0);
    }

    #[test]
    fn in_memory_snapshot_is_noop() {
        let m = MetricsRecorder::in_memory();
        m.counter_inc("x", &[], 1);
        assert_eq!(m.snapshot().unwrap(), 0);
    }

    #[test]
    fn snapshot_and_prune_persistent() {
        let path = temp_db();
        let m = MetricsRecorder::persistent(&path).unwrap();
        m.counter_inc("topics.created", &[], 2);
        m.gauge_set("topics.active", &[], 2.0);

        assert_eq!(m.snapshot().unwrap(), 2);
        assert_eq!(m.snapshot_count("topics.created").unwrap(), 1);

        assert_eq!(m.prune(0).unwrap(), 2);
        assert_eq!(m.snapshot_count("topics.created").unwrap(), 0);
        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn concurrent_increments() {
        let m = Arc::new(MetricsRecorder::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        m.counter_inc("messages.forwarded", &[], 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.counter_get("messages.forwarded", &[]), 4000);
    }
}
