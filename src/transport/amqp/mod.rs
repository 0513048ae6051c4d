//! AMQP protocol backends.
//!
//! This module contains broker implementations for AMQP-based brokers.
//! Currently supports:
//! - lapin - AMQP 0-9-1 (RabbitMQ)
//!
//! When the `transport_lapin` feature is disabled, [`create_lapin_connection`]
//! is a stub that always fails, so connection builders can reference it
//! unconditionally.

#[cfg(feature = "transport_lapin")]
mod lapin;

#[cfg(feature = "transport_lapin")]
pub use lapin::create_connection as create_lapin_connection;

#[cfg(not(feature = "transport_lapin"))]
pub async fn create_lapin_connection(
    _config: &crate::PubSubConfig,
) -> crate::Result<crate::ConnectionPtr> {
    // ---
    Err(crate::PubSubError::ConfigConflict(
        "AMQP backend requested but the `transport_lapin` feature is not enabled".into(),
    ))
}
