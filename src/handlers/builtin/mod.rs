//! Built-in task handlers.

pub mod agent;
pub mod document;
pub mod webhook;
