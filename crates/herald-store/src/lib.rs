pub mod database;
pub mod deliveries;
pub mod error;
pub mod memory;
pub mod row_helpers;
pub mod schema;
pub mod topics;

pub use database::Database;
pub use deliveries::DeliveryRepo;
pub use error::StoreError;
pub use memory::MemoryPersistence;
pub use topics::TopicRepo;
