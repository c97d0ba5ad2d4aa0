use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::{DestinationError, PersistenceError, ProbeError, SourceError};
use crate::events::{ChannelRef, Registry, SourceEvent};
use crate::ids::{ChannelId, MessageId, SourceName, ThreadId};
use crate::topic::{DeliveryRecord, TopicMutation, TopicRecord};

/// Lists every source and the channels worth monitoring.
#[async_trait]
pub trait SourceRegistry: Send + Sync {
    async fn list_sources(&self) -> Result<Registry, SourceError>;
}

/// Channels currently visible over the push path.
pub trait PushSnapshot: Send + Sync {
    fn is_visible(&self, channel: &ChannelId) -> bool;
    fn visible_channels(&self) -> HashSet<ChannelId>;
}

/// On-demand reads against a source channel.
#[async_trait]
pub trait PullClient: Send + Sync {
    /// Smallest possible read. `Ok(false)` means the channel is not readable.
    async fn probe_fetch(&self, channel: &ChannelId) -> Result<bool, ProbeError>;

    /// Most recent `limit` events of a channel, in any order.
    async fn fetch_recent(
        &self,
        channel: &ChannelRef,
        limit: usize,
    ) -> Result<Vec<SourceEvent>, SourceError>;
}

/// Thread management in the destination conversation.
#[async_trait]
pub trait ThreadProvider: Send + Sync {
    /// Whether the destination conversation supports threaded topics at all.
    async fn supports_threads(&self) -> Result<bool, DestinationError>;

    async fn create_thread(&self, name: &str) -> Result<ThreadId, DestinationError>;

    /// Non-destructive existence check.
    async fn thread_exists(&self, thread: ThreadId) -> Result<bool, DestinationError>;

    async fn close_thread(&self, thread: ThreadId) -> Result<(), DestinationError>;

    /// Open threads with their titles.
    ///
    /// The default implementation checks only the threads in `known`, for
    /// destinations with no bulk listing. A thread whose check errors is kept:
    /// absence is only concluded from a definite answer.
    async fn list_open_threads(
        &self,
        known: &[TopicRecord],
    ) -> Result<BTreeMap<ThreadId, String>, DestinationError> {
        let mut open = BTreeMap::new();
        for record in known {
            if open.contains_key(&record.thread_id) {
                continue;
            }
            let keep = match self.thread_exists(record.thread_id).await {
                Ok(exists) => exists,
                Err(DestinationError::ThreadNotFound) => false,
                Err(_) => true,
            };
            if keep {
                open.insert(record.thread_id, record.display_name.clone());
            }
        }
        Ok(open)
    }
}

/// Sends formatted text to the destination conversation.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Send to `thread`, or to the main conversation when `None`.
    async fn send_message(
        &self,
        thread: Option<ThreadId>,
        text: &str,
    ) -> Result<MessageId, DestinationError>;
}

/// Durable copy of the source → thread mapping.
pub trait TopicPersistence: Send + Sync {
    fn load(&self) -> Result<Vec<(SourceName, TopicRecord)>, PersistenceError>;

    /// Apply every mutation or none of them.
    fn apply(&self, batch: &[TopicMutation]) -> Result<(), PersistenceError>;
}

/// Record of forwarded events and per-source cursors.
pub trait DeliveryLedger: Send + Sync {
    fn is_forwarded(&self, event_key: &str) -> Result<bool, PersistenceError>;

    /// Record a delivery and advance the source cursor if it moved forward.
    fn record(&self, delivery: &DeliveryRecord) -> Result<(), PersistenceError>;

    fn cursor(&self, source: &SourceName) -> Result<Option<DateTime<Utc>>, PersistenceError>;
}
