//! AMQP broker implementation using `lapin`.
//!
//! This module provides implementations of the `Connection` and `Channel`
//! traits backed by an AMQP 0-9-1 broker (RabbitMQ).
//!
//! ## Concurrency model
//!
//! - One [`LapinConnection`] wraps one `lapin::Connection` and is shared by
//!   every publisher and subscription of the process.
//! - Every call to `open_channel()` creates a new AMQP channel. Subscriptions
//!   each own one, so a channel-level error (e.g. `PRECONDITION_FAILED` on
//!   a conflicting declaration, which makes the broker close the channel)
//!   only affects the subscription that caused it.
//! - `lapin` channels are `Send + Sync` and serialize frames internally, so
//!   no actor task is needed in front of them.
//!
//! ## Connection behavior
//!
//! Connection to the broker happens eagerly in [`create_connection`].
//! Reconnects are not attempted: once the connection drops, every delivery
//! stream ends and further channel operations fail.
//!
//! ## Message delivery semantics
//!
//! - Publishing uses `basic.publish` without publisher confirms and without
//!   the `mandatory` flag; unroutable messages are dropped by the broker.
//! - The content type is carried in the AMQP `content-type` property.
//! - Consumers are started with `no_ack = false`; every delivery is settled
//!   through its `lapin` acker with `basic.ack` or `basic.nack`.
//!
//! ## Error classification
//!
//! The broker reports inequivalent queue arguments as `PRECONDITION_FAILED`
//! and foreign exclusive queues as `RESOURCE_LOCKED`. Both map to
//! [`PubSubError::Configuration`]; every other failure during setup maps to
//! [`PubSubError::Connection`].

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use lapin::{
    //
    acker::Acker,
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicNackOptions,
        BasicPublishOptions,
        BasicQosOptions,
        ExchangeDeclareOptions,
        QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
    ConnectionProperties,
    ExchangeKind as AmqpExchangeKind,
};

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    Acknowledger,
    Channel,
    ChannelPtr,
    Connection,
    ConnectionBase,
    ConnectionPtr,
    Delivery,
    DeliveryStream,
    ExchangeKind,
    OutboundMessage,
    PubSubConfig,
    PubSubError,
    QueueDeclareFlags,
    QueueInfo,
    Result,
};

/// Map a lapin error from a setup operation.
fn setup_error(op: &str, e: lapin::Error) -> PubSubError {
    // ---
    let msg = format!("amqp: {op} failed: {e}");
    if msg.contains("PRECONDITION_FAILED")
        || msg.contains("RESOURCE_LOCKED")
        || msg.contains("inequivalent arg")
    {
        PubSubError::Configuration(msg)
    } else {
        PubSubError::Connection(msg)
    }
}

/// AMQP connection implementation using lapin.
pub struct LapinConnection {
    // ---
    base: ConnectionBase,
    connection: lapin::Connection,
}

/// AMQP channel implementation using lapin.
struct LapinChannel {
    connection_id: String,
    channel: lapin::Channel,
}

/// Settles a lapin delivery.
struct LapinAcker {
    acker: Acker,
}

#[async_trait::async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<()> {
        // ---
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| PubSubError::Connection(format!("amqp: ack failed: {e}")))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        // ---
        let opts = BasicNackOptions {
            multiple: false,
            requeue,
        };
        self.acker
            .nack(opts)
            .await
            .map_err(|e| PubSubError::Connection(format!("amqp: nack failed: {e}")))
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    // ---
    let content_type = delivery
        .properties
        .content_type()
        .as_ref()
        .map(|ct| Arc::from(ct.as_str()));

    Delivery::new(
        Bytes::from(delivery.data),
        content_type,
        delivery.exchange.as_str(),
        delivery.routing_key.as_str(),
        delivery.redelivered,
        Box::new(LapinAcker {
            acker: delivery.acker,
        }),
    )
}

#[async_trait::async_trait]
impl Channel for LapinChannel {
    // ---
    async fn publish(&self, exchange: &str, routing_key: &str, msg: OutboundMessage) -> Result<()> {
        // ---
        let properties =
            BasicProperties::default().with_content_type(msg.content_type.as_ref().into());

        self.channel
            .basic_publish(
                exchange.into(),
                routing_key.into(),
                BasicPublishOptions::default(),
                &msg.payload,
                properties,
            )
            .await
            .map_err(|e| PubSubError::Publish(format!("amqp: publish failed: {e}")))?;

        log_debug!(
            "[{}] published to {exchange}/{routing_key}",
            self.connection_id
        );
        Ok(())
    }

    async fn declare_queue(&self, name: &str, flags: QueueDeclareFlags) -> Result<QueueInfo> {
        // ---
        let queue_opts = QueueDeclareOptions {
            passive: false,
            durable: flags.durable,
            exclusive: flags.exclusive,
            auto_delete: flags.auto_delete,
            nowait: false,
        };

        let queue = self
            .channel
            .queue_declare(name.into(), queue_opts, FieldTable::default())
            .await
            .map_err(|e| setup_error("queue declare", e))?;

        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        // ---
        self.channel
            .queue_bind(
                queue.into(),
                exchange.into(),
                routing_key.into(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| setup_error("queue bind", e))
    }

    async fn set_prefetch(&self, prefetch_count: u16) -> Result<()> {
        // ---
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| setup_error("basic qos", e))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        // ---
        let consumer = self
            .channel
            .basic_consume(
                queue.into(),
                consumer_tag.into(),
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| setup_error("consume", e))?;

        log_info!(
            "[{}] started consuming queue: {queue}",
            self.connection_id
        );

        let stream = consumer.map(|delivery_result| {
            delivery_result
                .map(into_delivery)
                .map_err(|e| PubSubError::Connection(format!("amqp: consumer error: {e}")))
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        // ---
        self.channel
            .close(200, "Normal shutdown".into())
            .await
            .map_err(|e| PubSubError::Connection(format!("amqp: channel close failed: {e}")))
    }
}

#[async_trait::async_trait]
impl Connection for LapinConnection {
    // ---
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    async fn open_channel(&self) -> Result<ChannelPtr> {
        // ---
        let channel = self.connection.create_channel().await.map_err(|e| {
            let msg = format!("amqp: channel creation failed: {e}");
            log_error!("[{}] {msg}", self.connection_id());
            PubSubError::Connection(msg)
        })?;

        log_debug!(
            "[{}] created AMQP channel {}",
            self.connection_id(),
            channel.id()
        );

        Ok(Arc::new(LapinChannel {
            connection_id: self.connection_id().to_string(),
            channel,
        }))
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        // ---
        let kind = match kind {
            ExchangeKind::Direct => AmqpExchangeKind::Direct,
            ExchangeKind::Topic => AmqpExchangeKind::Topic,
            ExchangeKind::Fanout => AmqpExchangeKind::Fanout,
        };

        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| setup_error("channel creation", e))?;

        let opts = ExchangeDeclareOptions {
            durable,
            ..ExchangeDeclareOptions::default()
        };

        let result = channel
            .exchange_declare(name.into(), kind, opts, FieldTable::default())
            .await
            .map_err(|e| setup_error("exchange declare", e));

        if let Err(_err) = channel.close(200, "Normal shutdown".into()).await {
            log_debug!("[{}] exchange declare channel close: {_err}", self.connection_id());
        }
        result
    }

    async fn close(&self) -> Result<()> {
        // ---
        self.connection
            .close(200, "Normal shutdown".into())
            .await
            .map_err(|e| PubSubError::Connection(format!("amqp: connection close failed: {e}")))?;

        log_info!("[{}] AMQP connection closed", self.connection_id());
        Ok(())
    }
}

/// Creates a lapin-based AMQP connection from the given configuration.
///
/// # Errors
///
/// Returns an error if:
/// - The broker URI is missing or cannot be parsed
/// - Connection to the broker fails
pub async fn create_connection(config: &PubSubConfig) -> Result<ConnectionPtr> {
    // ---
    let uri = config
        .broker_uri
        .as_deref()
        .ok_or_else(|| PubSubError::MissingConfig("AMQP backend requires broker_uri".into()))?;

    log_info!("[{}] connecting to AMQP broker: {uri}", config.connection_id);

    let connection = lapin::Connection::connect(uri, ConnectionProperties::default())
        .await
        .map_err(|e| {
            let msg = format!("amqp: connection failed: {e}");
            log_error!("[{}] {msg}", config.connection_id);
            PubSubError::Connection(msg)
        })?;

    log_info!("[{}] connected to AMQP broker", config.connection_id);

    Ok(Arc::new(LapinConnection {
        base: ConnectionBase::from(config),
        connection,
    }))
}
