pub mod access;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod format;
pub mod guard;
pub mod metric_names;
pub mod mock;
pub mod pending;
pub mod retry;
pub mod synchronizer;
pub mod topic_store;

pub use access::{AccessVerifier, VerifierConfig};
pub use delivery::{DeliveryMode, DeliveryOutcome, DeliveryReport, Dispatcher};
pub use engine::{
    BackgroundTasks, Collaborators, Engine, EngineConfig, EngineStatus, ReconcileRun, StartupReport,
};
pub use error::EngineError;
pub use format::FormatOptions;
pub use guard::{TopicGuard, TopicLookup};
pub use pending::{Admission, AdmissionConfig, AdmissionReason, PendingQueue, PendingView};
pub use retry::RetryPolicy;
pub use synchronizer::{ReconcileReport, Synchronizer};
pub use topic_store::TopicStore;
