//! Domain layer public interface.
//!
//! This module defines broker-level abstractions that are independent of
//! any AMQP client library.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod broker;

// --- Broker domain re-exports ---

pub use broker::{
    //
    Acknowledger,
    Channel,
    ChannelPtr,
    Connection,
    ConnectionBase,
    ConnectionPtr,
    Delivery,
    DeliveryStream,
    DurabilityMode,
    ExchangeKind,
    OutboundMessage,
    QueueDeclareFlags,
    QueueInfo,
};
