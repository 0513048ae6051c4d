//! Queue provisioning.
//!
//! Declares a queue with the flags of its durability mode and binds it to an
//! exchange. Exchanges are never declared here.

use crate::{
    // ---
    log_debug,
    log_info,
    Channel,
    ConnectionBase,
    DurabilityMode,
    QueueDeclareFlags,
    QueueInfo,
    Result,
};

/// Declare `queue` and bind it to `exchange` under `routing_key`.
///
/// Safe to call once per subscription. Re-declaring a queue with the same
/// mode succeeds; re-declaring it with the other mode fails with
/// [`PubSubError::Configuration`](crate::PubSubError::Configuration), either
/// from this connection's own record of earlier declarations or from the
/// broker.
///
/// # Errors
///
/// - `Configuration` on conflicting queue properties
/// - `Connection` on any other declare or bind failure (closed channel,
///   unknown exchange, ...)
pub async fn declare_and_bind(
    base: &ConnectionBase,
    channel: &dyn Channel,
    queue: &str,
    exchange: &str,
    routing_key: &str,
    mode: DurabilityMode,
) -> Result<QueueInfo> {
    // ---
    base.check_queue_mode(queue, mode)?;

    let flags = QueueDeclareFlags::from(mode);
    let info = channel.declare_queue(queue, flags).await?;
    base.record_queue_mode(queue, mode);

    log_info!(
        "[{}] declared queue {queue} ({mode:?}, {} messages)",
        base.connection_id,
        info.message_count
    );

    channel.bind_queue(queue, exchange, routing_key).await?;

    log_debug!(
        "[{}] bound {queue} to {exchange} with {routing_key}",
        base.connection_id
    );

    Ok(info)
}
