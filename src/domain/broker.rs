// src/domain/broker.rs

//! Broker domain abstractions.
//!
//! This module defines the narrow broker interface the publish, provision
//! and subscribe operations are written against. It mirrors the subset of
//! AMQP 0-9-1 those operations need (channels, queue declaration, bindings,
//! manual acknowledgment) without referring to any client library.
//!
//! Concrete implementations live under `src/transport/`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures::stream::BoxStream;

use crate::{
    // ---
    AckType,
    DecodeFailurePolicy,
    PubSubConfig,
    PubSubError,
    Result,
};

/// Queue durability mode.
///
/// The mode of a queue is fixed by its first declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DurabilityMode {
    /// Survives broker restart, never auto-deleted, shareable between
    /// connections.
    Durable,

    /// Deleted when its last consumer goes away and exclusive to the
    /// declaring connection. Used for per-client inboxes.
    Transient,
}

/// Queue properties sent with `queue.declare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueDeclareFlags {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

impl From<DurabilityMode> for QueueDeclareFlags {
    fn from(mode: DurabilityMode) -> Self {
        // ---
        match mode {
            DurabilityMode::Durable => Self {
                durable: true,
                auto_delete: false,
                exclusive: false,
            },
            DurabilityMode::Transient => Self {
                durable: false,
                auto_delete: true,
                exclusive: true,
            },
        }
    }
}

/// Exchange routing type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routing key must equal the binding key.
    Direct,

    /// Dot-separated pattern match; `*` matches one word, `#` zero or more.
    Topic,

    /// Every bound queue receives every message.
    Fanout,
}

/// Result of a successful queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A message on its way to the broker.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub payload: Bytes,
    pub content_type: Arc<str>,
}

/// Settles a single delivery with the broker.
#[async_trait::async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message handed to a consumer.
///
/// The acknowledger is only reachable through [`Delivery::settle`], which
/// takes the delivery by value, so each delivery is settled at most once.
pub struct Delivery {
    // ---
    /// Raw payload bytes.
    pub payload: Bytes,

    /// Content-type tag set by the publisher, if any.
    pub content_type: Option<Arc<str>>,

    /// Exchange the message was published to.
    pub exchange: String,

    /// Routing key the message was published with.
    pub routing_key: String,

    /// Set when the broker has delivered this message before.
    pub redelivered: bool,

    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        payload: Bytes,
        content_type: Option<Arc<str>>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        // ---
        Self {
            payload,
            content_type,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered,
            acker,
        }
    }

    /// Acknowledge or negatively acknowledge this delivery.
    pub async fn settle(self, ack: AckType) -> Result<()> {
        // ---
        match ack.requeue() {
            None => self.acker.ack().await,
            Some(requeue) => self.acker.nack(requeue).await,
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .field("content_type", &self.content_type)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries for one consumer.
///
/// Ends when the consumer's channel or connection closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// A broker channel.
///
/// Each subscription opens its own channel, so flow control and
/// channel-level errors stay isolated per subscription.
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    // ---
    /// Publish a message to an exchange. No publisher confirms.
    ///
    /// An unroutable message is dropped by the broker and is not an error.
    /// Whether an unknown exchange fails this call or only closes the
    /// channel afterwards depends on the backend.
    async fn publish(&self, exchange: &str, routing_key: &str, msg: OutboundMessage)
        -> Result<()>;

    /// Declare a queue.
    ///
    /// Re-declaring with identical flags succeeds. Conflicting flags fail
    /// with [`PubSubError::Configuration`].
    async fn declare_queue(&self, name: &str, flags: QueueDeclareFlags) -> Result<QueueInfo>;

    /// Bind a queue to an exchange under a routing-key pattern.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Limit unacknowledged deliveries for consumers started afterwards on
    /// this channel. `0` means unlimited.
    async fn set_prefetch(&self, prefetch_count: u16) -> Result<()>;

    /// Start a manual-ack consumer on a queue.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Close the channel. Unacknowledged deliveries return to their queues.
    async fn close(&self) -> Result<()>;
}

/// Shared channel pointer.
pub type ChannelPtr = Arc<dyn Channel>;

/// Shared base state for all connection implementations.
///
/// Each concrete connection embeds this as a field named `base` and returns
/// it from [`Connection::base`].
pub struct ConnectionBase {
    /// Identifier used in logs and consumer tags.
    pub connection_id: String,

    /// Default prefetch limit for subscriptions on this connection.
    pub prefetch_count: u16,

    /// Default decode-failure handling for subscriptions on this connection.
    pub decode_failure: DecodeFailurePolicy,

    declared_queues: Mutex<HashMap<String, DurabilityMode>>,
}

impl ConnectionBase {
    /// Create a new ConnectionBase.
    pub fn new(
        connection_id: impl Into<String>,
        prefetch_count: u16,
        decode_failure: DecodeFailurePolicy,
    ) -> Self {
        // ---
        Self {
            connection_id: connection_id.into(),
            prefetch_count,
            decode_failure,
            declared_queues: Mutex::new(HashMap::new()),
        }
    }

    /// Fail if `queue` was already declared on this connection with a
    /// different mode.
    pub fn check_queue_mode(&self, queue: &str, mode: DurabilityMode) -> Result<()> {
        // ---
        match self.queues().get(queue) {
            Some(existing) if *existing != mode => Err(PubSubError::Configuration(format!(
                "queue {queue} already declared as {existing:?}, cannot redeclare as {mode:?}"
            ))),
            _ => Ok(()),
        }
    }

    /// Record the mode a queue was declared with.
    pub fn record_queue_mode(&self, queue: &str, mode: DurabilityMode) {
        self.queues().insert(queue.to_string(), mode);
    }

    /// Mode a queue was declared with on this connection, if any.
    pub fn queue_mode(&self, queue: &str) -> Option<DurabilityMode> {
        self.queues().get(queue).copied()
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, DurabilityMode>> {
        // Acquire mutex guard, ignoring poisoning
        match self.declared_queues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl From<&PubSubConfig> for ConnectionBase {
    fn from(config: &PubSubConfig) -> Self {
        // ---
        Self::new(
            config.connection_id.clone(),
            config.prefetch_count,
            config.decode_failure,
        )
    }
}

/// Broker connection abstraction.
///
/// A connection is shared between every publisher and subscription of a
/// process; each of them opens its own [`Channel`]. Implementations must
/// allow concurrent channel creation.
///
/// # Notes
///
/// This trait uses `async_trait`; consumers should treat methods as normal
/// `async fn`s.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    // ---
    /// Returns a reference to the shared base state.
    fn base(&self) -> &ConnectionBase;

    /// Returns the connection_id of the connection.
    fn connection_id(&self) -> &str {
        &self.base().connection_id
    }

    /// Open a new channel.
    async fn open_channel(&self) -> Result<ChannelPtr>;

    /// Declare an exchange.
    ///
    /// The pub/sub operations never declare exchanges; this exists for
    /// bootstrap code and tests.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()>;

    /// Close the connection and every channel opened on it.
    async fn close(&self) -> Result<()>;
}

/// Shared connection pointer.
///
/// This is an `Arc<dyn Connection>`; `.clone()` only bumps a reference count
/// and all clones share the same broker connection.
pub type ConnectionPtr = Arc<dyn Connection>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_declare_flags_by_mode() {
        // ---
        let durable = QueueDeclareFlags::from(DurabilityMode::Durable);
        assert!(durable.durable && !durable.auto_delete && !durable.exclusive);

        let transient = QueueDeclareFlags::from(DurabilityMode::Transient);
        assert!(!transient.durable && transient.auto_delete && transient.exclusive);
    }

    #[test]
    fn test_queue_mode_registry() {
        // ---
        let base = ConnectionBase::new("test", 10, DecodeFailurePolicy::Discard);

        base.check_queue_mode("pause.alice", DurabilityMode::Transient)
            .unwrap();
        base.record_queue_mode("pause.alice", DurabilityMode::Transient);

        assert!(base
            .check_queue_mode("pause.alice", DurabilityMode::Transient)
            .is_ok());

        let err = base
            .check_queue_mode("pause.alice", DurabilityMode::Durable)
            .unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(
            base.queue_mode("pause.alice"),
            Some(DurabilityMode::Transient)
        );
    }
}
