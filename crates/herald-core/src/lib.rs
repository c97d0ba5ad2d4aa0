pub mod access;
pub mod errors;
pub mod events;
pub mod ids;
pub mod naming;
pub mod provider;
pub mod topic;

pub use access::AccessState;
pub use errors::{DestinationError, PersistenceError, ProbeError, SourceError};
pub use events::{ChannelMap, ChannelRef, InboundEvent, Registry, SourceEvent};
pub use ids::{ChannelId, MessageId, SourceMessageId, SourceName, ThreadId};
pub use topic::{DeliveryRecord, TopicMutation, TopicRecord};
