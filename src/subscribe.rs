//! Typed subscriptions and the consumer loop.
//!
//! This module provides the glue between a broker [`Connection`](crate::Connection) and a
//! caller-supplied handler:
//!
//! - opening a channel dedicated to the subscription
//! - declaring and binding the subscription's queue
//! - driving a receive loop over the delivery stream
//! - decoding each delivery and dispatching it to the handler
//! - settling each delivery according to the handler's [`AckType`]
//!
//! ## Design notes
//!
//! ### Receive loop
//!
//! [`subscribe`] spawns a long-running task that waits on the broker's
//! delivery stream. The task yields while waiting and does not spin. When the
//! channel or connection closes the stream ends and the loop exits quietly.
//! The loop is detached: dropping the returned [`SubscriptionHandle`] does
//! not stop it. [`SubscriptionHandle::shutdown`] does.
//!
//! Deliveries of one subscription are processed one at a time, in broker
//! order. Handlers of one subscription never run concurrently with each
//! other; handlers of different subscriptions may.
//!
//! Handlers are async. A handler may await other broker operations (e.g.
//! publish a follow-up event on its own channel) and pick the disposition
//! from their outcome. While a handler awaits, other subscriptions keep
//! consuming.
//!
//! ### Error handling
//!
//! Errors before the loop starts (channel open, qos, declare, bind, consume)
//! are returned from [`subscribe`]. Errors inside the loop have nobody to be
//! returned to and are logged instead:
//!
//! - undecodable payload → [`DecodeFailurePolicy`] disposition (default
//!   [`AckType::NackDiscard`]), handler not called
//! - handler panic → [`AckType::NackDiscard`]
//! - failed ack/nack call → logged, loop continues
//! - delivery stream error → logged, loop ends

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::codec::decode_delivery;
use crate::provision::declare_and_bind;
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    AckType,
    Channel,
    ChannelPtr,
    Codec,
    ConnectionPtr,
    ConsumerTag,
    DecodeFailurePolicy,
    Delivery,
    DeliveryStream,
    DurabilityMode,
    PubSubError,
    Result,
};

/// Where a subscription's queue lives and how it is bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub mode: DurabilityMode,
}

impl QueueBinding {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        mode: DurabilityMode,
    ) -> Self {
        // ---
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
            mode,
        }
    }
}

/// Per-subscription overrides of the connection defaults.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Prefetch limit; `None` uses the connection's configured default.
    pub prefetch_count: Option<u16>,

    /// Undecodable-delivery handling; `None` uses the connection default.
    pub decode_failure: Option<DecodeFailurePolicy>,

    /// Explicit consumer tag; `None` generates one.
    pub consumer_tag: Option<String>,
}

impl SubscribeOptions {
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = Some(count);
        self
    }

    pub fn decode_failure(mut self, policy: DecodeFailurePolicy) -> Self {
        self.decode_failure = Some(policy);
        self
    }

    pub fn consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }
}

/// Handle to a running subscription.
///
/// Dropping the handle leaves the consumer running for the life of its
/// channel.
#[derive(Debug)]
pub struct SubscriptionHandle {
    queue: String,
    consumer_tag: ConsumerTag,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    /// Name of the consumed queue.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Consumer tag registered with the broker.
    pub fn consumer_tag(&self) -> &ConsumerTag {
        &self.consumer_tag
    }

    /// Ask the consumer loop to stop and close its channel.
    ///
    /// Deliveries not yet settled are returned to the queue by the broker.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// True once the consumer loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the consumer loop to exit.
    pub async fn join(self) -> Result<()> {
        // ---
        self.task.await.map_err(|e| {
            PubSubError::Connection(format!("consumer task for {} failed: {e}", self.queue))
        })
    }
}

/// Subscribe to JSON messages.
///
/// Declares `queue` with `mode`, binds it to `exchange` under `routing_key`
/// and starts a consumer task calling `handler` for every decoded message.
/// Returns once the consumer is registered.
///
/// # Example
///
/// ```
/// # use mom_pubsub::{routing, subscribe_json, AckType, ConnectionBuilder};
/// # use mom_pubsub::{DurabilityMode, ExchangeKind};
/// # async fn example() -> mom_pubsub::Result<()> {
/// let connection = ConnectionBuilder::new()
///     .uri("memory://")
///     .connection_id("alice")
///     .build()
///     .await?;
/// connection
///     .declare_exchange(routing::EXCHANGE_PERIL_DIRECT, ExchangeKind::Direct, true)
///     .await?;
///
/// subscribe_json(
///     &connection,
///     routing::EXCHANGE_PERIL_DIRECT,
///     &routing::key(routing::PAUSE_KEY, "alice"),
///     routing::PAUSE_KEY,
///     DurabilityMode::Transient,
///     |state: routing::PlayingState| async move {
///         println!("paused: {}", state.is_paused);
///         AckType::Ack
///     },
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn subscribe_json<T, F, Fut>(
    connection: &ConnectionPtr,
    exchange: &str,
    queue: &str,
    routing_key: &str,
    mode: DurabilityMode,
    handler: F,
) -> Result<SubscriptionHandle>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AckType> + Send + 'static,
{
    subscribe(
        connection,
        Codec::Json,
        QueueBinding::new(exchange, queue, routing_key, mode),
        SubscribeOptions::default(),
        handler,
    )
    .await
}

/// Subscribe to bincode messages.
///
/// Same contract as [`subscribe_json`].
pub async fn subscribe_bincode<T, F, Fut>(
    connection: &ConnectionPtr,
    exchange: &str,
    queue: &str,
    routing_key: &str,
    mode: DurabilityMode,
    handler: F,
) -> Result<SubscriptionHandle>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AckType> + Send + 'static,
{
    subscribe(
        connection,
        Codec::Bincode,
        QueueBinding::new(exchange, queue, routing_key, mode),
        SubscribeOptions::default(),
        handler,
    )
    .await
}

/// Subscribe with an explicit codec and options.
///
/// # Errors
///
/// - [`PubSubError::Connection`] if the channel cannot be opened or the
///   prefetch limit, binding or consumer cannot be set up
/// - [`PubSubError::Configuration`] if the queue exists with other
///   properties
///
/// Nothing is returned for failures after the consumer has started.
pub async fn subscribe<T, F, Fut>(
    connection: &ConnectionPtr,
    codec: Codec,
    binding: QueueBinding,
    options: SubscribeOptions,
    handler: F,
) -> Result<SubscriptionHandle>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AckType> + Send + 'static,
{
    // ---
    let base = connection.base();
    let consumer_tag = options
        .consumer_tag
        .clone()
        .map(ConsumerTag::from)
        .unwrap_or_else(|| ConsumerTag::generate(&base.connection_id));
    let prefetch_count = options.prefetch_count.unwrap_or(base.prefetch_count);

    let channel = connection.open_channel().await?;

    let stream = match start_consumer(
        connection,
        channel.as_ref(),
        &binding,
        prefetch_count,
        &consumer_tag,
    )
    .await
    {
        Ok(stream) => stream,
        Err(e) => {
            log_error!(
                "[{}] subscribe to {} failed: {e}",
                base.connection_id,
                binding.queue
            );
            if let Err(_close_err) = channel.close().await {
                log_debug!("[{}] close after failed subscribe: {_close_err}", base.connection_id);
            }
            return Err(e);
        }
    };

    log_info!(
        "[{}] consuming {} as {consumer_tag} ({codec:?}, prefetch {prefetch_count})",
        base.connection_id,
        binding.queue
    );

    let consumer = Consumer {
        connection_id: base.connection_id.clone(),
        queue: binding.queue.clone(),
        codec,
        decode_failure: options.decode_failure.unwrap_or(base.decode_failure),
        handler,
    };

    let shutdown = Arc::new(Notify::new());
    let task = tokio::spawn(consumer.run::<T, Fut>(channel, stream, Arc::clone(&shutdown)));

    Ok(SubscriptionHandle {
        queue: binding.queue,
        consumer_tag,
        shutdown,
        task,
    })
}

// Steps 2-4 of subscribe: qos, declare + bind, consume.
async fn start_consumer(
    connection: &ConnectionPtr,
    channel: &dyn Channel,
    binding: &QueueBinding,
    prefetch_count: u16,
    consumer_tag: &ConsumerTag,
) -> Result<DeliveryStream> {
    // ---
    channel.set_prefetch(prefetch_count).await?;

    declare_and_bind(
        connection.base(),
        channel,
        &binding.queue,
        &binding.exchange,
        &binding.routing_key,
        binding.mode,
    )
    .await?;

    channel.consume(&binding.queue, consumer_tag.as_str()).await
}

/// State owned by one consumer task.
struct Consumer<F> {
    connection_id: String,
    queue: String,
    codec: Codec,
    decode_failure: DecodeFailurePolicy,
    handler: F,
}

impl<F> Consumer<F> {
    async fn run<T, Fut>(
        self,
        channel: ChannelPtr,
        mut stream: DeliveryStream,
        shutdown: Arc<Notify>,
    ) where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AckType> + Send + 'static,
    {
        // ---
        loop {
            let next = tokio::select! {
                _ = shutdown.notified() => {
                    log_debug!("[{}] shutdown requested for {}", self.connection_id, self.queue);
                    break;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.process::<T, Fut>(delivery).await;
                }
                Some(Err(_err)) => {
                    log_error!(
                        "[{}] delivery stream error on {}: {_err}",
                        self.connection_id,
                        self.queue
                    );
                    break;
                }
                None => {
                    log_debug!(
                        "[{}] delivery stream closed for {}",
                        self.connection_id,
                        self.queue
                    );
                    break;
                }
            }
        }

        drop(stream);
        if let Err(_err) = channel.close().await {
            log_debug!("[{}] channel close: {_err}", self.connection_id);
        }

        log_debug!("[{}] consumer stopped for {}", self.connection_id, self.queue);
    }

    /// Decode, dispatch and settle one delivery. Returns the disposition.
    async fn process<T, Fut>(&self, delivery: Delivery) -> AckType
    where
        T: DeserializeOwned,
        F: Fn(T) -> Fut,
        Fut: Future<Output = AckType>,
    {
        // ---
        let decoded =
            decode_delivery::<T>(delivery.content_type.as_deref(), self.codec, &delivery.payload);

        let ack = match decoded {
            Ok(msg) => self.invoke(msg).await,
            Err(_err) => {
                let ack = self.decode_failure.ack_type();
                log_error!(
                    "[{}] dropping undecodable delivery on {} (routing key {}): {_err}; {ack}",
                    self.connection_id,
                    self.queue,
                    delivery.routing_key
                );
                ack
            }
        };

        log_debug!("[{}] {} settled with {ack}", self.connection_id, self.queue);

        if let Err(_err) = delivery.settle(ack).await {
            log_warn!("[{}] failed to {ack} on {}: {_err}", self.connection_id, self.queue);
        }

        ack
    }

    /// Run the handler to completion. A panic, whether raised while
    /// building the future or while polling it, settles as NackDiscard.
    async fn invoke<T, Fut>(&self, msg: T) -> AckType
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = AckType>,
    {
        // ---
        let handled = AssertUnwindSafe(async { (self.handler)(msg).await })
            .catch_unwind()
            .await;

        match handled {
            Ok(ack) => ack,
            Err(_payload) => {
                log_error!(
                    "[{}] handler panicked on {}: {}",
                    self.connection_id,
                    self.queue,
                    panic_message(_payload.as_ref())
                );
                AckType::NackDiscard
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{Acknowledger, CONTENT_TYPE_BINCODE, CONTENT_TYPE_JSON};
    use bytes::Bytes;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Move {
        units: Vec<u32>,
        to_location: String,
    }

    /// Records every settle call.
    struct RecordingAcker(Arc<Mutex<Vec<AckType>>>);

    #[async_trait::async_trait]
    impl Acknowledger for RecordingAcker {
        async fn ack(&self) -> Result<()> {
            self.0.lock().unwrap().push(AckType::Ack);
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> Result<()> {
            let ack = if requeue {
                AckType::NackRequeue
            } else {
                AckType::NackDiscard
            };
            self.0.lock().unwrap().push(ack);
            Ok(())
        }
    }

    fn delivery(payload: Bytes, content_type: &str, log: &Arc<Mutex<Vec<AckType>>>) -> Delivery {
        Delivery::new(
            payload,
            Some(Arc::from(content_type)),
            "peril_topic",
            "army_moves.alice",
            false,
            Box::new(RecordingAcker(Arc::clone(log))),
        )
    }

    fn consumer<F>(codec: Codec, handler: F) -> Consumer<F> {
        Consumer {
            connection_id: "test".into(),
            queue: "army_moves.alice".into(),
            codec,
            decode_failure: DecodeFailurePolicy::Discard,
            handler,
        }
    }

    fn sample() -> Move {
        Move {
            units: vec![1, 2],
            to_location: "asia".into(),
        }
    }

    #[tokio::test]
    async fn test_handler_disposition_is_settled() {
        // ---
        let log = Arc::new(Mutex::new(Vec::new()));
        let payload = Codec::Json.encode(&sample()).unwrap();

        for expected in [AckType::Ack, AckType::NackRequeue, AckType::NackDiscard] {
            let c = consumer(Codec::Json, move |m: Move| async move {
                assert_eq!(m, sample());
                expected
            });
            let ack = c
                .process::<Move, _>(delivery(payload.clone(), CONTENT_TYPE_JSON, &log))
                .await;
            assert_eq!(ack, expected);
        }

        assert_eq!(
            *log.lock().unwrap(),
            vec![AckType::Ack, AckType::NackRequeue, AckType::NackDiscard]
        );
    }

    #[tokio::test]
    async fn test_decode_failure_discards_without_calling_handler() {
        // ---
        let log = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let c = consumer(Codec::Json, move |_m: Move| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            async { AckType::Ack }
        });

        let ack = c
            .process::<Move, _>(delivery(
                Bytes::from_static(b"not json"),
                CONTENT_TYPE_JSON,
                &log,
            ))
            .await;

        assert_eq!(ack, AckType::NackDiscard);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(*log.lock().unwrap(), vec![AckType::NackDiscard]);
    }

    #[tokio::test]
    async fn test_decode_failure_policy_requeue() {
        // ---
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut c = consumer(Codec::Json, |_m: Move| async { AckType::Ack });
        c.decode_failure = DecodeFailurePolicy::Requeue;

        let ack = c
            .process::<Move, _>(delivery(Bytes::from_static(b"{}"), CONTENT_TYPE_JSON, &log))
            .await;

        assert_eq!(ack, AckType::NackRequeue);
    }

    #[tokio::test]
    async fn test_mismatched_content_type_is_a_decode_failure() {
        // ---
        let log = Arc::new(Mutex::new(Vec::new()));
        let payload = Codec::Json.encode(&sample()).unwrap();
        let c = consumer(Codec::Json, |_m: Move| async { AckType::Ack });

        let ack = c
            .process::<Move, _>(delivery(payload, CONTENT_TYPE_BINCODE, &log))
            .await;

        assert_eq!(ack, AckType::NackDiscard);
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_discard() {
        // ---
        let log = Arc::new(Mutex::new(Vec::new()));
        let payload = Codec::Bincode.encode(&sample()).unwrap();
        let c = consumer(Codec::Bincode, |m: Move| async move {
            tokio::task::yield_now().await;
            if m.units.is_empty() {
                AckType::Ack
            } else {
                panic!("move validation exploded");
            }
        });

        let ack = c
            .process::<Move, _>(delivery(payload.clone(), CONTENT_TYPE_BINCODE, &log))
            .await;
        assert_eq!(ack, AckType::NackDiscard);

        // The consumer survives and handles the next delivery.
        let ack = c
            .process::<Move, _>(delivery(payload, CONTENT_TYPE_BINCODE, &log))
            .await;
        assert_eq!(ack, AckType::NackDiscard);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_panic_before_first_poll_becomes_discard() {
        // ---
        let log = Arc::new(Mutex::new(Vec::new()));
        let payload = Codec::Json.encode(&sample()).unwrap();
        let c = consumer(Codec::Json, |_m: Move| -> std::future::Ready<AckType> {
            panic!("rejected before any await");
        });

        let ack = c
            .process::<Move, _>(delivery(payload, CONTENT_TYPE_JSON, &log))
            .await;

        assert_eq!(ack, AckType::NackDiscard);
        assert_eq!(*log.lock().unwrap(), vec![AckType::NackDiscard]);
    }

    #[tokio::test]
    async fn test_handler_awaits_before_deciding() {
        // ---
        let log = Arc::new(Mutex::new(Vec::new()));
        let payload = Codec::Json.encode(&sample()).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Move>(1);

        let c = consumer(Codec::Json, move |m: Move| {
            let tx = tx.clone();
            async move {
                match tx.send(m).await {
                    Ok(()) => AckType::Ack,
                    Err(_) => AckType::NackRequeue,
                }
            }
        });

        let ack = c
            .process::<Move, _>(delivery(payload.clone(), CONTENT_TYPE_JSON, &log))
            .await;
        assert_eq!(ack, AckType::Ack);
        assert_eq!(rx.recv().await, Some(sample()));

        // Follow-up fails once the receiver is gone.
        drop(rx);
        let ack = c
            .process::<Move, _>(delivery(payload, CONTENT_TYPE_JSON, &log))
            .await;
        assert_eq!(ack, AckType::NackRequeue);
    }

    #[test]
    fn test_panic_message() {
        // ---
        let payload = std::panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 1");

        let payload = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");
    }

    #[test]
    fn test_options_builder() {
        // ---
        let opts = SubscribeOptions::default()
            .prefetch_count(1)
            .decode_failure(DecodeFailurePolicy::Requeue)
            .consumer_tag("alice-moves");

        assert_eq!(opts.prefetch_count, Some(1));
        assert_eq!(opts.decode_failure, Some(DecodeFailurePolicy::Requeue));
        assert_eq!(opts.consumer_tag.as_deref(), Some("alice-moves"));
    }
}
