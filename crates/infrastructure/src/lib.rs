pub mod memory_store;
pub mod observability;

pub use memory_store::InMemoryJobStore;
pub use observability::{EngineMetrics, StructuredLogger};
