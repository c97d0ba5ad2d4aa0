//! Metric series recorded by the engine.

pub const TOPICS_CREATED: &str = "topics_created";
pub const TOPICS_ADOPTED: &str = "topics_adopted";
pub const TOPICS_STALE_REMOVED: &str = "topics_stale_removed";
pub const DUPLICATES_CLOSED: &str = "duplicates_closed";
pub const MESSAGES_FORWARDED: &str = "messages_forwarded";
pub const DELIVERY_FAILURES: &str = "delivery_failures";
/// Labelled by `reason`.
pub const ADMISSIONS: &str = "admissions";
pub const PENDING_SOURCES: &str = "pending_sources";
