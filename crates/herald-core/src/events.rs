use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ChannelId, SourceMessageId, SourceName};

/// Channels of one source, keyed by id, valued by display name.
pub type ChannelMap = BTreeMap<ChannelId, String>;

/// Every known source with its monitored channels.
pub type Registry = BTreeMap<SourceName, ChannelMap>;

/// A channel together with the source that owns it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRef {
    pub source: SourceName,
    pub id: ChannelId,
    pub name: String,
}

impl ChannelRef {
    pub fn new(source: SourceName, id: ChannelId, name: impl Into<String>) -> Self {
        Self {
            source,
            id,
            name: name.into(),
        }
    }
}

/// A validated message read from a source channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEvent {
    pub id: SourceMessageId,
    pub source: SourceName,
    pub channel_id: ChannelId,
    pub channel_name: String,
    pub author: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl SourceEvent {
    /// Stable key used by the forwarded-event ledger.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.channel_id, self.id)
    }
}

/// Why a raw event was dropped at the boundary.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EventRejected {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("empty content")]
    EmptyContent,
    #[error("bad timestamp: {0}")]
    BadTimestamp(String),
}

/// Loosely-typed event as received from a connector, before validation.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawEvent {
    pub id: Option<String>,
    pub source: Option<String>,
    pub channel_id: Option<String>,
    pub channel_name: Option<String>,
    pub author: Option<String>,
    pub content: Option<String>,
    /// RFC 3339 timestamp.
    pub timestamp: Option<String>,
}

impl RawEvent {
    pub fn validate(self) -> Result<SourceEvent, EventRejected> {
        let id = non_empty(self.id).ok_or(EventRejected::MissingField("id"))?;
        let source = non_empty(self.source).ok_or(EventRejected::MissingField("source"))?;
        let channel_id =
            non_empty(self.channel_id).ok_or(EventRejected::MissingField("channel_id"))?;
        let raw_ts = non_empty(self.timestamp).ok_or(EventRejected::MissingField("timestamp"))?;
        let content = self.content.unwrap_or_default();
        if content.trim().is_empty() {
            return Err(EventRejected::EmptyContent);
        }
        let timestamp = DateTime::parse_from_rfc3339(&raw_ts)
            .map_err(|_| EventRejected::BadTimestamp(raw_ts.clone()))?
            .with_timezone(&Utc);

        Ok(SourceEvent {
            id: SourceMessageId::from_raw(id),
            source: SourceName::from_raw(source),
            channel_name: non_empty(self.channel_name).unwrap_or_else(|| channel_id.clone()),
            channel_id: ChannelId::from_raw(channel_id),
            author: non_empty(self.author).unwrap_or_else(|| "Unknown".to_string()),
            content,
            timestamp,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Notification delivered to the engine by a connector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundEvent {
    /// A source not seen before, with its candidate channels.
    SourceDiscovered {
        source: SourceName,
        channels: ChannelMap,
    },
    /// A new message on a monitored channel.
    Message(SourceEvent),
}

/// Sort a batch into non-decreasing timestamp order.
/// Ties keep channel and message id order so repeated sorts are stable.
pub fn sort_chronological(events: &mut [SourceEvent]) {
    events.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.channel_id.cmp(&b.channel_id))
            .then_with(|| a.id.cmp(&b.id))
    });
}
