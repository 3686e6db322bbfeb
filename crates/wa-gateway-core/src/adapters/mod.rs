//! # Infrastructure Adapters
//!
//! Infrastructure implementations of the storage interface.

pub mod memory_store;

pub use memory_store::InMemoryMessageStore;
