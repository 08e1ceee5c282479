//! Storage backends for the queue.

pub mod backend;
pub mod memory;
pub mod redis;

pub use backend::{QueueBackend, TAKE_DUE_BATCH};
pub use memory::MemoryStore;
pub use redis::RedisStore;
