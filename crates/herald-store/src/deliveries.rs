use chrono::{DateTime, SecondsFormat, Utc};
use tracing::instrument;

use herald_core::provider::DeliveryLedger;
use herald_core::{DeliveryRecord, PersistenceError, SourceName};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Forwarded-event ledger and per-source cursors.
pub struct DeliveryRepo {
    db: Database,
}

impl DeliveryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn contains(&self, event_key: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found: i64 = conn.query_row(
                "SELECT COUNT(*) FROM forwarded WHERE event_key = ?1",
                [event_key],
                |row| row.get(0),
            )?;
            Ok(found > 0)
        })
    }

    /// Insert the delivery and move the cursor forward, never back.
    /// Times are stored fixed-width so the cursor can compare them as text.
    #[instrument(skip(self, delivery), fields(source = %delivery.source, event_key = %delivery.event_key))]
    pub fn insert(&self, delivery: &DeliveryRecord) -> Result<(), StoreError> {
        let event_time = delivery.event_time.to_rfc3339_opts(SecondsFormat::Micros, true);
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO forwarded
                    (event_key, source, thread_id, message_id, event_time, forwarded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    delivery.event_key,
                    delivery.source.as_str(),
                    delivery.thread_id.map(|t| t.get()),
                    delivery.message_id.get(),
                    event_time,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            tx.execute(
                "INSERT INTO cursors (source, last_event_time) VALUES (?1, ?2)
                 ON CONFLICT(source) DO UPDATE SET last_event_time = excluded.last_event_time
                 WHERE excluded.last_event_time > cursors.last_event_time",
                rusqlite::params![delivery.source.as_str(), event_time],
            )?;
            Ok(())
        })
    }

    pub fn last_event_time(&self, source: &SourceName) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT last_event_time FROM cursors WHERE source = ?1")?;
            let mut rows = stmt.query([source.as_str()])?;
            match rows.next()? {
                Some(row) => {
                    let raw: String = row_helpers::get(row, 0, "cursors", "last_event_time")?;
                    Ok(Some(row_helpers::parse_time(&raw, "cursors", "last_event_time")?))
                }
                None => Ok(None),
            }
        })
    }

    /// Number of forwarded events, optionally for one source.
    pub fn count(&self, source: Option<&SourceName>) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = match source {
                Some(s) => conn.query_row(
                    "SELECT COUNT(*) FROM forwarded WHERE source = ?1",
                    [s.as_str()],
                    |row| row.get(0),
                )?,
                None => conn.query_row("SELECT COUNT(*) FROM forwarded", [], |row| row.get(0))?,
            };
            Ok(n.max(0) as u64)
        })
    }
}

impl DeliveryLedger for DeliveryRepo {
    fn is_forwarded(&self, event_key: &str) -> Result<bool, PersistenceError> {
        Ok(self.contains(event_key)?)
    }

    fn record(&self, delivery: &DeliveryRecord) -> Result<(), PersistenceError> {
        Ok(self.insert(delivery)?)
    }

    fn cursor(&self, source: &SourceName) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        Ok(self.last_event_time(source)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use herald_core::{MessageId, ThreadId};

    fn delivery(key: &str, hour: u32) -> DeliveryRecord {
        DeliveryRecord {
            event_key: key.into(),
            source: SourceName::from("Alpha"),
            thread_id: Some(ThreadId::new(7)),
            message_id: MessageId::new(100 + hour as i64),
            event_time: Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap(),
        }
    }

    #[test]
    fn records_and_detects_forwarded() {
        let repo = DeliveryRepo::new(Database::in_memory().unwrap());
        assert!(!repo.is_forwarded("c1:m1").unwrap());
        repo.record(&delivery("c1:m1", 10)).unwrap();
        assert!(repo.is_forwarded("c1:m1").unwrap());
        assert_eq!(repo.count(None).unwrap(), 1);
    }

    #[test]
    fn duplicate_record_is_ignored() {
        let repo = DeliveryRepo::new(Database::in_memory().unwrap());
        repo.record(&delivery("c1:m1", 10)).unwrap();
        repo.record(&delivery("c1:m1", 10)).unwrap();
        assert_eq!(repo.count(Some(&SourceName::from("Alpha"))).unwrap(), 1);
    }

    #[test]
    fn cursor_only_moves_forward() {
        let repo = DeliveryRepo::new(Database::in_memory().unwrap());
        let source = SourceName::from("Alpha");
        assert!(repo.cursor(&source).unwrap().is_none());

        repo.record(&delivery("c1:m2", 12)).unwrap();
        repo.record(&delivery("c1:m1", 10)).unwrap();

        let cursor = repo.cursor(&source).unwrap().unwrap();
        assert_eq!(cursor, Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn unthreaded_delivery_is_recorded() {
        let repo = DeliveryRepo::new(Database::in_memory().unwrap());
        let mut d = delivery("c2:m9", 9);
        d.thread_id = None;
        repo.record(&d).unwrap();
        assert!(repo.is_forwarded("c2:m9").unwrap());
    }
}
