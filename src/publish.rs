//! Typed publishing.
//!
//! Publishing is fire-and-forget: no publisher confirms are requested, and a
//! message whose routing key matches no binding is dropped by the broker
//! without an error. Failures are returned to the caller and never retried
//! here.

use std::sync::Arc;

use serde::Serialize;

use crate::{
    // ---
    log_debug,
    Channel,
    Codec,
    OutboundMessage,
    Result,
};

/// Publish a value as JSON.
///
/// # Example
///
/// ```
/// # use mom_pubsub::{publish_json, routing, ConnectionBuilder, ExchangeKind};
/// # async fn example() -> mom_pubsub::Result<()> {
/// let connection = ConnectionBuilder::new()
///     .uri("memory://")
///     .connection_id("server")
///     .build()
///     .await?;
/// connection
///     .declare_exchange(routing::EXCHANGE_PERIL_DIRECT, ExchangeKind::Direct, true)
///     .await?;
///
/// let channel = connection.open_channel().await?;
/// publish_json(
///     channel.as_ref(),
///     routing::EXCHANGE_PERIL_DIRECT,
///     routing::PAUSE_KEY,
///     &routing::PlayingState { is_paused: true },
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn publish_json<T>(
    channel: &dyn Channel,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<()>
where
    T: Serialize + ?Sized,
{
    publish(channel, Codec::Json, exchange, routing_key, value).await
}

/// Publish a value as bincode.
pub async fn publish_bincode<T>(
    channel: &dyn Channel,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<()>
where
    T: Serialize + ?Sized,
{
    publish(channel, Codec::Bincode, exchange, routing_key, value).await
}

/// Publish a value with an explicit codec.
///
/// # Errors
///
/// - [`PubSubError::Encode`](crate::PubSubError::Encode) if the value cannot
///   be serialized
/// - [`PubSubError::Publish`](crate::PubSubError::Publish) if the channel is
///   closed or the frame cannot be sent
///
/// Publishing runs without publisher confirms. A broker-side rejection such
/// as an unknown exchange is reported synchronously only by the in-memory
/// broker; an AMQP broker closes the channel afterwards instead, and later
/// operations on that channel fail.
pub async fn publish<T>(
    channel: &dyn Channel,
    codec: Codec,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<()>
where
    T: Serialize + ?Sized,
{
    // ---
    let payload = codec.encode(value)?;
    let msg = OutboundMessage {
        payload,
        content_type: Arc::from(codec.content_type()),
    };

    let len = msg.payload.len();
    channel.publish(exchange, routing_key, msg).await?;

    log_debug!("published {len} bytes ({codec:?}) to {exchange}/{routing_key}");
    Ok(())
}
