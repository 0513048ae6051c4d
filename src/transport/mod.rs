//! Broker implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Connection` and `Channel` traits. Broker backends other than the
//! in-memory one are hidden behind feature flags and exposed only through
//! constructor functions.
//!
//! Domain code must not depend on backend-specific types.

mod amqp;
mod memory;

pub use amqp::create_lapin_connection;

pub use memory::{
    //
    create_memory_connection,
    create_memory_connection_with_hub,
    MemoryHub,
    QueueStats,
};
