//! In-process backing store.
//!
//! Mirrors the Redis data model closely enough that the storage engine, the
//! maintenance loops and the façade can be exercised without a server.

pub mod store;

pub use store::MemoryStore;
