//! Distributed task queue for agent workloads.

pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod worker;
