use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, SourceName, ThreadId};

/// A destination thread owned by one source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRecord {
    pub thread_id: ThreadId,
    /// Title the thread was created with.
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

impl TopicRecord {
    pub fn new(thread_id: ThreadId, display_name: impl Into<String>) -> Self {
        Self {
            thread_id,
            display_name: display_name.into(),
            created_at: Utc::now(),
        }
    }
}

/// One change to the source → thread mapping. Applied in batches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopicMutation {
    Put {
        source: SourceName,
        record: TopicRecord,
    },
    Remove {
        source: SourceName,
    },
    /// Drop every mapping.
    Clear,
}

impl TopicMutation {
    pub fn source(&self) -> Option<&SourceName> {
        match self {
            Self::Put { source, .. } | Self::Remove { source } => Some(source),
            Self::Clear => None,
        }
    }
}

/// A forwarded event, recorded so later batches skip it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub event_key: String,
    pub source: SourceName,
    pub thread_id: Option<ThreadId>,
    pub message_id: MessageId,
    /// Timestamp of the source event, not of the send.
    pub event_time: DateTime<Utc>,
}
