//! Batched clients for multi-key backends.
//!
//! A client wraps a store that can serve many keys per round trip and
//! exposes single-key operations as tasks. Calls made while the run queue
//! drains are coalesced into one store call per operation.

pub mod kv;
pub mod memory;

pub use kv::{BatchKvClient, KvStore};
pub use memory::{MemoryStore, StoreCalls};
