//! Source → thread mapping with a lock-free read path.
//!
//! Reads hit a `DashMap` cache. Writes take the persistence lock, write the
//! durable copy first and only then touch the cache, so a failed write
//! leaves the in-memory view exactly as it was.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use herald_core::provider::TopicPersistence;
use herald_core::{PersistenceError, SourceName, ThreadId, TopicMutation, TopicRecord};

pub struct TopicStore {
    by_source: DashMap<SourceName, TopicRecord>,
    by_thread: DashMap<ThreadId, SourceName>,
    persistence: Arc<dyn TopicPersistence>,
    write_lock: Mutex<()>,
}

impl TopicStore {
    /// Load the persisted mapping into a new store.
    pub fn load(persistence: Arc<dyn TopicPersistence>) -> Result<Self, PersistenceError> {
        let store = Self {
            by_source: DashMap::new(),
            by_thread: DashMap::new(),
            persistence,
            write_lock: Mutex::new(()),
        };
        for (source, record) in store.persistence.load()? {
            store.cache_put(source, record);
        }
        debug!(topics = store.by_source.len(), "topic store loaded");
        Ok(store)
    }

    pub fn get(&self, source: &SourceName) -> Option<ThreadId> {
        self.by_source.get(source).map(|r| r.thread_id)
    }

    pub fn record(&self, source: &SourceName) -> Option<TopicRecord> {
        self.by_source.get(source).map(|r| r.clone())
    }

    /// Source currently owning `thread`.
    pub fn owner_of(&self, thread: ThreadId) -> Option<SourceName> {
        self.by_thread.get(&thread).map(|s| s.clone())
    }

    pub fn put(&self, source: SourceName, record: TopicRecord) -> Result<(), PersistenceError> {
        self.apply(vec![TopicMutation::Put { source, record }])
    }

    pub fn remove(&self, source: &SourceName) -> Result<Option<TopicRecord>, PersistenceError> {
        let _w = self.write_lock.lock();
        let Some(existing) = self.record(source) else {
            return Ok(None);
        };
        let batch = vec![TopicMutation::Remove {
            source: source.clone(),
        }];
        self.persist_then_cache(&batch)?;
        Ok(Some(existing))
    }

    /// Remove the mapping only if it still points at `thread`.
    pub fn remove_if(&self, source: &SourceName, thread: ThreadId) -> Result<bool, PersistenceError> {
        let _w = self.write_lock.lock();
        if self.get(source) != Some(thread) {
            return Ok(false);
        }
        let batch = vec![TopicMutation::Remove {
            source: source.clone(),
        }];
        self.persist_then_cache(&batch)?;
        Ok(true)
    }

    /// Apply a batch atomically: all mutations land, or none.
    pub fn apply(&self, batch: Vec<TopicMutation>) -> Result<(), PersistenceError> {
        if batch.is_empty() {
            return Ok(());
        }
        let _w = self.write_lock.lock();
        self.persist_then_cache(&batch)
    }

    fn persist_then_cache(&self, batch: &[TopicMutation]) -> Result<(), PersistenceError> {
        if let Err(e) = self.persistence.apply(batch) {
            warn!(error = %e, mutations = batch.len(), "topic write failed, cache unchanged");
            return Err(e);
        }
        for mutation in batch {
            match mutation {
                TopicMutation::Put { source, record } => self.cache_put(source.clone(), record.clone()),
                TopicMutation::Remove { source } => self.cache_remove(source),
                TopicMutation::Clear => {
                    self.by_source.clear();
                    self.by_thread.clear();
                }
            }
        }
        Ok(())
    }

    fn cache_put(&self, source: SourceName, record: TopicRecord) {
        let thread = record.thread_id;
        if let Some(previous) = self.by_source.insert(source.clone(), record) {
            if previous.thread_id != thread {
                self.by_thread.remove_if(&previous.thread_id, |_, owner| owner == &source);
            }
        }
        self.by_thread.insert(thread, source);
    }

    fn cache_remove(&self, source: &SourceName) {
        if let Some((_, record)) = self.by_source.remove(source) {
            self.by_thread.remove_if(&record.thread_id, |_, owner| owner == source);
        }
    }

    /// Read-only copy of source → thread.
    pub fn snapshot(&self) -> BTreeMap<SourceName, ThreadId> {
        self.by_source
            .iter()
            .map(|e| (e.key().clone(), e.value().thread_id))
            .collect()
    }

    /// Read-only copy including titles and creation times.
    pub fn records(&self) -> BTreeMap<SourceName, TopicRecord> {
        self.by_source
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// A mapping filed under a different key whose recorded title equals `display_name`.
    pub fn find_by_display_name(
        &self,
        display_name: &str,
        excluding: &SourceName,
    ) -> Option<(SourceName, TopicRecord)> {
        let wanted = herald_core::naming::normalize_display_name(display_name);
        let mut matches: Vec<(SourceName, TopicRecord)> = self
            .by_source
            .iter()
            .filter(|e| e.key() != excluding)
            .filter(|e| herald_core::naming::normalize_display_name(&e.value().display_name) == wanted)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        matches.sort_by_key(|(_, r)| r.thread_id);
        matches.into_iter().next()
    }

    pub fn len(&self) -> usize {
        self.by_source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_source.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_store::MemoryPersistence;

    fn record(thread: i64, name: &str) -> TopicRecord {
        TopicRecord::new(ThreadId::new(thread), name)
    }

    fn store_with(persistence: Arc<MemoryPersistence>) -> TopicStore {
        TopicStore::load(persistence).unwrap()
    }

    #[test]
    fn loads_persisted_mapping() {
        let persistence = Arc::new(MemoryPersistence::with_topics([(
            SourceName::from("Alpha"),
            record(10, "🏰 Alpha"),
        )]));
        let store = store_with(persistence);
        assert_eq!(store.get(&SourceName::from("Alpha")), Some(ThreadId::new(10)));
        assert_eq!(store.owner_of(ThreadId::new(10)), Some(SourceName::from("Alpha")));
    }

    #[test]
    fn put_persists_before_returning() {
        let persistence = Arc::new(MemoryPersistence::new());
        let store = store_with(Arc::clone(&persistence));
        store.put(SourceName::from("Alpha"), record(1, "🏰 Alpha")).unwrap();
        assert_eq!(persistence.topics().len(), 1);
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn failed_put_leaves_cache_unchanged() {
        let persistence = Arc::new(MemoryPersistence::new());
        let store = store_with(Arc::clone(&persistence));
        store.put(SourceName::from("Alpha"), record(1, "🏰 Alpha")).unwrap();

        persistence.set_failing(true);
        let err = store.put(SourceName::from("Alpha"), record(2, "🏰 Alpha"));
        assert!(err.is_err());
        assert_eq!(store.get(&SourceName::from("Alpha")), Some(ThreadId::new(1)));
        assert!(store.owner_of(ThreadId::new(2)).is_none());

        let err = store.remove(&SourceName::from("Alpha"));
        assert!(err.is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn repoint_updates_inverse() {
        let store = store_with(Arc::new(MemoryPersistence::new()));
        let alpha = SourceName::from("Alpha");
        store.put(alpha.clone(), record(1, "🏰 Alpha")).unwrap();
        store.put(alpha.clone(), record(5, "🏰 Alpha")).unwrap();
        assert!(store.owner_of(ThreadId::new(1)).is_none());
        assert_eq!(store.owner_of(ThreadId::new(5)), Some(alpha));
    }

    #[test]
    fn remove_if_compares_thread() {
        let store = store_with(Arc::new(MemoryPersistence::new()));
        let alpha = SourceName::from("Alpha");
        store.put(alpha.clone(), record(3, "🏰 Alpha")).unwrap();

        assert!(!store.remove_if(&alpha, ThreadId::new(99)).unwrap());
        assert_eq!(store.get(&alpha), Some(ThreadId::new(3)));
        assert!(store.remove_if(&alpha, ThreadId::new(3)).unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn batch_applies_atomically() {
        let persistence = Arc::new(MemoryPersistence::new());
        let store = store_with(Arc::clone(&persistence));
        store
            .apply(vec![
                TopicMutation::Put {
                    source: SourceName::from("A"),
                    record: record(1, "🏰 A"),
                },
                TopicMutation::Put {
                    source: SourceName::from("B"),
                    record: record(2, "🏰 B"),
                },
            ])
            .unwrap();
        assert_eq!(persistence.batches_applied(), 1);

        store.apply(vec![TopicMutation::Clear]).unwrap();
        assert!(store.is_empty());
        assert!(store.owner_of(ThreadId::new(1)).is_none());
    }

    #[test]
    fn finds_title_under_other_key() {
        let store = store_with(Arc::new(MemoryPersistence::new()));
        store.put(SourceName::from("Beta_old"), record(7, "🏰  Beta")).unwrap();
        store.put(SourceName::from("Gamma"), record(8, "🏰 Gamma")).unwrap();

        let found = store.find_by_display_name("🏰 Beta", &SourceName::from("Beta"));
        let (owner, rec) = found.unwrap();
        assert_eq!(owner.as_str(), "Beta_old");
        assert_eq!(rec.thread_id, ThreadId::new(7));

        assert!(store
            .find_by_display_name("🏰 Beta", &SourceName::from("Beta_old"))
            .is_none());
    }
}
