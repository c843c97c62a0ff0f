//! Outbox store implementations.

pub mod in_memory;
pub mod postgres;
