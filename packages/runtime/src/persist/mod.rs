//! Persistence: store contract, backends, and the write-back service.

pub mod json_store;
pub mod memory_store;
pub mod service;
pub mod store;

pub use json_store::JsonFileStore;
pub use memory_store::MemoryStore;
pub use service::PersistenceService;
pub use store::{DeviceStore, StoreTransaction};
