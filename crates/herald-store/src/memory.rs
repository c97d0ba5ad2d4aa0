use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use herald_core::provider::{DeliveryLedger, TopicPersistence};
use herald_core::{DeliveryRecord, PersistenceError, SourceName, TopicMutation, TopicRecord};

/// In-memory persistence for tests and dry runs.
///
/// `set_failing(true)` makes every write fail, which lets callers exercise
/// rollback paths without a broken disk.
#[derive(Default)]
pub struct MemoryPersistence {
    topics: Mutex<BTreeMap<SourceName, TopicRecord>>,
    forwarded: Mutex<HashMap<String, DeliveryRecord>>,
    cursors: Mutex<HashMap<SourceName, DateTime<Utc>>>,
    failing: AtomicBool,
    batches: AtomicUsize,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the topic table, bypassing the failure toggle.
    pub fn with_topics(topics: impl IntoIterator<Item = (SourceName, TopicRecord)>) -> Self {
        let store = Self::default();
        store.topics.lock().extend(topics);
        store
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful batches applied so far.
    pub fn batches_applied(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn topics(&self) -> BTreeMap<SourceName, TopicRecord> {
        self.topics.lock().clone()
    }

    fn check_writable(&self) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(PersistenceError::new("write rejected"))
        } else {
            Ok(())
        }
    }
}

impl TopicPersistence for MemoryPersistence {
    fn load(&self) -> Result<Vec<(SourceName, TopicRecord)>, PersistenceError> {
        Ok(self
            .topics
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn apply(&self, batch: &[TopicMutation]) -> Result<(), PersistenceError> {
        self.check_writable()?;
        let mut topics = self.topics.lock();
        for mutation in batch {
            match mutation {
                TopicMutation::Put { source, record } => {
                    topics.insert(source.clone(), record.clone());
                }
                TopicMutation::Remove { source } => {
                    topics.remove(source);
                }
                TopicMutation::Clear => topics.clear(),
            }
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl DeliveryLedger for MemoryPersistence {
    fn is_forwarded(&self, event_key: &str) -> Result<bool, PersistenceError> {
        Ok(self.forwarded.lock().contains_key(event_key))
    }

    fn record(&self, delivery: &DeliveryRecord) -> Result<(), PersistenceError> {
        self.check_writable()?;
        self.forwarded
            .lock()
            .entry(delivery.event_key.clone())
            .or_insert_with(|| delivery.clone());
        let mut cursors = self.cursors.lock();
        let cursor = cursors
            .entry(delivery.source.clone())
            .or_insert(delivery.event_time);
        if delivery.event_time > *cursor {
            *cursor = delivery.event_time;
        }
        Ok(())
    }

    fn cursor(&self, source: &SourceName) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        Ok(self.cursors.lock().get(source).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::{MessageId, ThreadId};

    #[test]
    fn failing_write_leaves_state_untouched() {
        let store = MemoryPersistence::new();
        store
            .apply(&[TopicMutation::Put {
                source: SourceName::from("Alpha"),
                record: TopicRecord::new(ThreadId::new(1), "🏰 Alpha"),
            }])
            .unwrap();

        store.set_failing(true);
        let err = store.apply(&[TopicMutation::Clear]).unwrap_err();
        assert!(err.to_string().contains("write rejected"));
        assert_eq!(store.topics().len(), 1);
        assert_eq!(store.batches_applied(), 1);
    }

    #[test]
    fn ledger_tracks_cursor() {
        let store = MemoryPersistence::new();
        let later = Utc::now();
        let earlier = later - chrono::Duration::minutes(5);
        for (key, at) in [("c1:2", later), ("c1:1", earlier)] {
            store
                .record(&DeliveryRecord {
                    event_key: key.into(),
                    source: SourceName::from("Alpha"),
                    thread_id: None,
                    message_id: MessageId::new(1),
                    event_time: at,
                })
                .unwrap();
        }
        assert!(store.is_forwarded("c1:1").unwrap());
        assert_eq!(store.cursor(&SourceName::from("Alpha")).unwrap(), Some(later));
    }
}
