use tracing::{debug, instrument};

use herald_core::provider::TopicPersistence;
use herald_core::{PersistenceError, SourceName, ThreadId, TopicMutation, TopicRecord};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// SQLite-backed source → thread mapping.
pub struct TopicRepo {
    db: Database,
}

impl TopicRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// All mappings, ordered by source name.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<(SourceName, TopicRecord)>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT source, thread_id, display_name, created_at FROM topics ORDER BY source",
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_topic(row)?);
            }
            Ok(out)
        })
    }

    /// Apply a batch in one transaction.
    #[instrument(skip(self, batch), fields(mutations = batch.len()))]
    pub fn apply_batch(&self, batch: &[TopicMutation]) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.db.with_tx(|tx| {
            for mutation in batch {
                match mutation {
                    TopicMutation::Put { source, record } => {
                        tx.execute(
                            "INSERT INTO topics (source, thread_id, display_name, created_at)
                             VALUES (?1, ?2, ?3, ?4)
                             ON CONFLICT(source) DO UPDATE SET
                                thread_id = excluded.thread_id,
                                display_name = excluded.display_name,
                                created_at = excluded.created_at",
                            rusqlite::params![
                                source.as_str(),
                                record.thread_id.get(),
                                record.display_name,
                                record.created_at.to_rfc3339(),
                            ],
                        )?;
                    }
                    TopicMutation::Remove { source } => {
                        tx.execute("DELETE FROM topics WHERE source = ?1", [source.as_str()])?;
                    }
                    TopicMutation::Clear => {
                        tx.execute("DELETE FROM topics", [])?;
                    }
                }
            }
            Ok(())
        })?;
        debug!(mutations = batch.len(), "topic batch committed");
        Ok(())
    }
}

fn row_to_topic(row: &rusqlite::Row<'_>) -> Result<(SourceName, TopicRecord), StoreError> {
    let source: String = row_helpers::get(row, 0, "topics", "source")?;
    let thread_id: i64 = row_helpers::get(row, 1, "topics", "thread_id")?;
    let display_name: String = row_helpers::get(row, 2, "topics", "display_name")?;
    let created_at: String = row_helpers::get(row, 3, "topics", "created_at")?;

    Ok((
        SourceName::from_raw(source),
        TopicRecord {
            thread_id: ThreadId::new(thread_id),
            display_name,
            created_at: row_helpers::parse_time(&created_at, "topics", "created_at")?,
        },
    ))
}

impl TopicPersistence for TopicRepo {
    fn load(&self) -> Result<Vec<(SourceName, TopicRecord)>, PersistenceError> {
        Ok(self.list()?)
    }

    fn apply(&self, batch: &[TopicMutation]) -> Result<(), PersistenceError> {
        Ok(self.apply_batch(batch)?)
    }
}
