//! Typed publish/subscribe over an AMQP broker connection
//!
//! This library layers typed pub/sub on top of a shared broker connection.
//! Values are published as JSON or bincode with a matching content-type tag.
//! Subscriptions declare and bind their own queue on a dedicated channel,
//! decode each delivery, hand it to a handler, and acknowledge the delivery
//! according to the [`AckType`] the handler returns.
//!

// Import all sub modules once...
mod macros;

mod ack;
mod codec;
mod config;
mod connection_builder;
mod consumer_tag;
mod domain;
mod error;
mod provision;
mod publish;
mod subscribe;
mod transport;

pub mod routing;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use ack::AckType;
pub use codec::{Codec, CONTENT_TYPE_BINCODE, CONTENT_TYPE_JSON};
pub use config::{DecodeFailurePolicy, PubSubConfig, DEFAULT_PREFETCH_COUNT};
pub use connection_builder::ConnectionBuilder;
pub use consumer_tag::ConsumerTag;
pub use error::{PubSubError, Result};

pub use provision::declare_and_bind;
pub use publish::{publish, publish_bincode, publish_json};
pub use subscribe::{
    //
    subscribe,
    subscribe_bincode,
    subscribe_json,
    QueueBinding,
    SubscribeOptions,
    SubscriptionHandle,
};

pub use transport::{
    //
    create_lapin_connection,
    create_memory_connection,
    create_memory_connection_with_hub,
    MemoryHub,
    QueueStats,
};

// --- public re-exports
pub use domain::{
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
