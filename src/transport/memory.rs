//! In-memory broker implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! [`Connection`] and [`Channel`] traits. It is intended primarily for
//! testing, local execution, and as a reference for broker semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory broker models the parts of AMQP 0-9-1 the pub/sub layer
//! relies on:
//!
//! - direct, topic (`*` / `#`) and fanout exchanges, plus the default
//!   exchange (`""`) routing straight to the queue named by the routing key
//! - queue declaration with durable / auto-delete / exclusive flags;
//!   re-declaration with different flags, or of another connection's
//!   exclusive queue, fails with a configuration error
//! - auto-delete once the last consumer of a queue goes away; exclusive
//!   queues are deleted with their connection
//! - round-robin delivery between consumers of one queue (competing
//!   consumers), one copy per bound queue (fan-out)
//! - manual acknowledgment with per-consumer prefetch limits; a requeued or
//!   orphaned delivery goes back to the front of its queue and is flagged as
//!   redelivered
//! - unroutable messages are dropped silently
//!
//! ## Non-Goals
//!
//! Persistence, broker restarts, message TTLs, dead-lettering and
//! publisher confirms are not modelled.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::{
    // ---
    log_debug,
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

type DeliverySender = mpsc::UnboundedSender<Result<Delivery>>;

/// Shared in-process broker.
///
/// All memory connections created from the same hub see the same exchanges
/// and queues, exactly as clients of one real broker would.
///
/// # Testing Only - Subject to Change
///
/// The inspection helpers ([`queue_stats`](Self::queue_stats),
/// [`queue_flags`](Self::queue_flags)) exist for this crate's own tests and
/// may change without a deprecation cycle.
///
/// # Usage in Integration Tests
///
/// Construct a hub per test for isolation and pass it to
/// [`create_memory_connection_with_hub`]:
///
/// ```
/// # use mom_pubsub::{MemoryHub, PubSubConfig};
/// # async fn example() -> mom_pubsub::Result<()> {
/// let hub = MemoryHub::new();
///
/// let server = mom_pubsub::create_memory_connection_with_hub(
///     &PubSubConfig::memory("server"),
///     hub.clone(),
/// )
/// .await?;
/// let client = mom_pubsub::create_memory_connection_with_hub(
///     &PubSubConfig::memory("client"),
///     hub.clone(),
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub struct MemoryHub {
    // ---
    state: Mutex<HubState>,
    ids: AtomicU64,
}

/// Snapshot of a queue's depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages waiting for a consumer.
    pub ready: usize,
    /// Messages delivered but not yet settled.
    pub unacked: usize,
    /// Registered consumers.
    pub consumers: usize,
}

#[derive(Default)]
struct HubState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    next_delivery_tag: u64,
}

struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
}

#[derive(Clone)]
struct Message {
    payload: Bytes,
    content_type: Option<Arc<str>>,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

struct ConsumerSlot {
    id: u64,
    channel_id: u64,
    tag: String,
    prefetch: u16,
    in_flight: usize,
    tx: DeliverySender,
}

struct Unacked {
    message: Message,
    consumer_id: u64,
}

struct QueueState {
    flags: QueueDeclareFlags,
    owner: Option<u64>,
    bindings: Vec<(String, String)>,
    ready: VecDeque<Message>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    unacked: HashMap<u64, Unacked>,
    had_consumers: bool,
}

impl QueueState {
    fn new(flags: QueueDeclareFlags, owner: Option<u64>) -> Self {
        Self {
            flags,
            owner,
            bindings: Vec::new(),
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            unacked: HashMap::new(),
            had_consumers: false,
        }
    }

    fn info(&self, name: &str) -> QueueInfo {
        QueueInfo {
            name: name.to_string(),
            message_count: self.ready.len() as u32,
            consumer_count: self.consumers.len() as u32,
        }
    }

    /// Fail unless `connection_id` may use this queue.
    fn check_owner(&self, name: &str, connection_id: u64) -> Result<()> {
        match self.owner {
            Some(owner) if owner != connection_id => Err(PubSubError::Configuration(format!(
                "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{name}'"
            ))),
            _ => Ok(()),
        }
    }

    /// Round-robin pick of the next consumer with prefetch capacity.
    fn next_ready_consumer(&mut self) -> Option<usize> {
        let n = self.consumers.len();
        for i in 0..n {
            let idx = (self.next_consumer + i) % n;
            let c = &self.consumers[idx];
            if c.prefetch == 0 || c.in_flight < c.prefetch as usize {
                self.next_consumer = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }

    /// Remove a consumer and return its unsettled messages to the front of
    /// the queue, oldest first.
    fn remove_consumer(&mut self, idx: usize) {
        let consumer = self.consumers.remove(idx);

        let mut orphaned: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.consumer_id == consumer.id)
            .map(|(tag, _)| *tag)
            .collect();
        orphaned.sort_unstable();

        for tag in orphaned.into_iter().rev() {
            if let Some(entry) = self.unacked.remove(&tag) {
                let mut message = entry.message;
                message.redelivered = true;
                self.ready.push_front(message);
            }
        }

        if self.next_consumer >= self.consumers.len() {
            self.next_consumer = 0;
        }
    }

    fn should_auto_delete(&self) -> bool {
        self.flags.auto_delete && self.had_consumers && self.consumers.is_empty()
    }
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// AMQP topic match: `*` matches exactly one word, `#` zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    // ---
    fn words_match(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                words_match(&pattern[1..], key)
                    || (!key.is_empty() && words_match(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => words_match(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => words_match(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn routes(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Topic => topic_matches(binding_key, routing_key),
        ExchangeKind::Fanout => true,
    }
}

/// Hand ready messages to consumers with spare prefetch capacity.
fn dispatch(hub: &Weak<MemoryHub>, name: &str, queue: &mut QueueState, next_tag: &mut u64) {
    // ---
    while !queue.ready.is_empty() {
        let Some(idx) = queue.next_ready_consumer() else {
            break;
        };
        let Some(message) = queue.ready.pop_front() else {
            break;
        };

        *next_tag += 1;
        let tag = *next_tag;

        let delivery = Delivery::new(
            message.payload.clone(),
            message.content_type.clone(),
            message.exchange.clone(),
            message.routing_key.clone(),
            message.redelivered,
            Box::new(MemoryAcker {
                hub: hub.clone(),
                queue: name.to_string(),
                tag,
            }),
        );

        let consumer = &mut queue.consumers[idx];
        if consumer.tx.send(Ok(delivery)).is_err() {
            // Receiver dropped without closing its channel.
            log_debug!("memory: consumer {} on {name} is gone", consumer.tag);
            queue.ready.push_front(message);
            queue.remove_consumer(idx);
            continue;
        }

        consumer.in_flight += 1;
        let consumer_id = consumer.id;
        queue.unacked.insert(
            tag,
            Unacked {
                message,
                consumer_id,
            },
        );
    }
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self::default())
    }

    /// Current depth of a queue, or `None` if it does not exist.
    pub fn queue_stats(&self, name: &str) -> Option<QueueStats> {
        // ---
        let state = lock_ignore_poison(&self.state);
        state.queues.get(name).map(|q| QueueStats {
            ready: q.ready.len(),
            unacked: q.unacked.len(),
            consumers: q.consumers.len(),
        })
    }

    /// Flags a queue was declared with, or `None` if it does not exist.
    pub fn queue_flags(&self, name: &str) -> Option<QueueDeclareFlags> {
        let state = lock_ignore_poison(&self.state);
        state.queues.get(name).map(|q| q.flags)
    }

    /// Number of queues currently declared.
    pub fn queue_count(&self) -> usize {
        lock_ignore_poison(&self.state).queues.len()
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind || existing.durable != durable => {
                Err(PubSubError::Configuration(format!(
                    "PRECONDITION_FAILED - inequivalent arg for exchange '{name}'"
                )))
            }
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(name.to_string(), ExchangeState { kind, durable });
                Ok(())
            }
        }
    }

    fn publish(
        self: &Arc<Self>,
        exchange: &str,
        routing_key: &str,
        msg: OutboundMessage,
    ) -> Result<()> {
        // ---
        let mut guard = lock_ignore_poison(&self.state);
        let HubState {
            exchanges,
            queues,
            next_delivery_tag,
        } = &mut *guard;

        let targets: Vec<String> = if exchange.is_empty() {
            queues
                .keys()
                .filter(|name| name.as_str() == routing_key)
                .cloned()
                .collect()
        } else {
            let kind = exchanges
                .get(exchange)
                .map(|e| e.kind)
                .ok_or_else(|| {
                    PubSubError::Publish(format!("NOT_FOUND - no exchange '{exchange}'"))
                })?;

            queues
                .iter()
                .filter(|(_, q)| {
                    q.bindings
                        .iter()
                        .any(|(ex, key)| ex == exchange && routes(kind, key, routing_key))
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        if targets.is_empty() {
            log_debug!("memory: unroutable message {exchange}/{routing_key} dropped");
            return Ok(());
        }

        let message = Message {
            payload: msg.payload,
            content_type: Some(msg.content_type),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            redelivered: false,
        };

        let weak = Arc::downgrade(self);
        for name in targets {
            if let Some(queue) = queues.get_mut(&name) {
                queue.ready.push_back(message.clone());
                dispatch(&weak, &name, queue, next_delivery_tag);
            }
        }

        Ok(())
    }

    fn declare_queue(
        &self,
        connection_id: u64,
        name: &str,
        flags: QueueDeclareFlags,
    ) -> Result<QueueInfo> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        if let Some(queue) = state.queues.get(name) {
            queue.check_owner(name, connection_id)?;
            if queue.flags != flags {
                return Err(PubSubError::Configuration(format!(
                    "PRECONDITION_FAILED - inequivalent arg for queue '{name}': \
                     declared {:?}, requested {flags:?}",
                    queue.flags
                )));
            }
            return Ok(queue.info(name));
        }

        let owner = flags.exclusive.then_some(connection_id);
        let queue = QueueState::new(flags, owner);
        let info = queue.info(name);
        state.queues.insert(name.to_string(), queue);

        log_debug!("memory: created queue {name} {flags:?}");
        Ok(info)
    }

    fn bind_queue(
        &self,
        connection_id: u64,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        if !state.exchanges.contains_key(exchange) {
            return Err(PubSubError::Connection(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }

        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| PubSubError::Connection(format!("NOT_FOUND - no queue '{queue}'")))?;
        q.check_owner(queue, connection_id)?;

        let binding = (exchange.to_string(), routing_key.to_string());
        if !q.bindings.contains(&binding) {
            q.bindings.push(binding);
        }

        Ok(())
    }

    fn consume(
        self: &Arc<Self>,
        connection_id: u64,
        channel_id: u64,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<mpsc::UnboundedReceiver<Result<Delivery>>> {
        // ---
        let consumer_id = self.next_id();

        let mut guard = lock_ignore_poison(&self.state);
        let HubState {
            queues,
            next_delivery_tag,
            ..
        } = &mut *guard;

        let q = queues
            .get_mut(queue)
            .ok_or_else(|| PubSubError::Connection(format!("NOT_FOUND - no queue '{queue}'")))?;
        q.check_owner(queue, connection_id)?;

        if q
            .consumers
            .iter()
            .any(|c| c.channel_id == channel_id && c.tag == consumer_tag)
        {
            return Err(PubSubError::Connection(format!(
                "NOT_ALLOWED - attempt to reuse consumer tag '{consumer_tag}'"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        q.consumers.push(ConsumerSlot {
            id: consumer_id,
            channel_id,
            tag: consumer_tag.to_string(),
            prefetch,
            in_flight: 0,
            tx,
        });
        q.had_consumers = true;

        dispatch(&Arc::downgrade(self), queue, q, next_delivery_tag);

        Ok(rx)
    }

    fn settle(self: &Arc<Self>, queue: &str, tag: u64, requeue: Option<bool>) -> Result<()> {
        // ---
        let mut guard = lock_ignore_poison(&self.state);
        let HubState {
            queues,
            next_delivery_tag,
            ..
        } = &mut *guard;

        let unknown = || {
            PubSubError::Connection(format!(
                "PRECONDITION_FAILED - unknown delivery tag {tag} on '{queue}'"
            ))
        };

        let q = queues.get_mut(queue).ok_or_else(unknown)?;
        let entry = q.unacked.remove(&tag).ok_or_else(unknown)?;

        if let Some(consumer) = q.consumers.iter_mut().find(|c| c.id == entry.consumer_id) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }

        if requeue == Some(true) {
            let mut message = entry.message;
            message.redelivered = true;
            q.ready.push_front(message);
        }

        dispatch(&Arc::downgrade(self), queue, q, next_delivery_tag);
        Ok(())
    }

    fn close_channel(self: &Arc<Self>, channel_id: u64) {
        // ---
        let mut guard = lock_ignore_poison(&self.state);
        let HubState {
            queues,
            next_delivery_tag,
            ..
        } = &mut *guard;

        let weak = Arc::downgrade(self);
        let mut deleted = Vec::new();

        for (name, q) in queues.iter_mut() {
            let before = q.consumers.len();
            while let Some(idx) = q.consumers.iter().position(|c| c.channel_id == channel_id) {
                q.remove_consumer(idx);
            }
            if q.consumers.len() == before {
                continue;
            }

            if q.should_auto_delete() {
                deleted.push(name.clone());
            } else {
                dispatch(&weak, name, q, next_delivery_tag);
            }
        }

        for name in deleted {
            queues.remove(&name);
            log_debug!("memory: auto-deleted queue {name}");
        }
    }

    fn close_connection(self: &Arc<Self>, connection_id: u64, channel_ids: &[u64]) {
        // ---
        for channel_id in channel_ids {
            self.close_channel(*channel_id);
        }

        let mut state = lock_ignore_poison(&self.state);
        state.queues.retain(|_name, q| {
            let keep = q.owner != Some(connection_id);
            if !keep {
                log_debug!("memory: deleted exclusive queue {_name}");
            }
            keep
        });
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        // ---
        Self {
            state: Mutex::new(HubState::default()),
            ids: AtomicU64::new(0),
        }
    }
}

/// Settles one delivery on the hub it came from.
struct MemoryAcker {
    hub: Weak<MemoryHub>,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<()> {
        let hub = self
            .hub
            .upgrade()
            .ok_or_else(|| PubSubError::Connection("memory broker dropped".into()))?;
        hub.settle(&self.queue, self.tag, requeue)
    }
}

#[async_trait::async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(Some(requeue))
    }
}

/// Process-global hub used by [`create_memory_connection`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// In-memory connection.
struct MemoryConnection {
    // ---
    base: ConnectionBase,
    hub: Arc<MemoryHub>,
    id: u64,
    closed: Arc<AtomicBool>,
    channels: Mutex<Vec<u64>>,
}

/// In-memory channel.
struct MemoryChannel {
    hub: Arc<MemoryHub>,
    connection_id: u64,
    channel_id: u64,
    prefetch: AtomicU16,
    closed: AtomicBool,
    connection_closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.connection_closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(PubSubError::Connection(format!(
                "channel {} is closed",
                self.channel_id
            )))
        }
    }
}

#[async_trait::async_trait]
impl Channel for MemoryChannel {
    // ---
    async fn publish(&self, exchange: &str, routing_key: &str, msg: OutboundMessage) -> Result<()> {
        // ---
        if !self.is_open() {
            return Err(PubSubError::Publish(format!(
                "channel {} is closed",
                self.channel_id
            )));
        }
        self.hub.publish(exchange, routing_key, msg)
    }

    async fn declare_queue(&self, name: &str, flags: QueueDeclareFlags) -> Result<QueueInfo> {
        self.ensure_open()?;
        self.hub.declare_queue(self.connection_id, name, flags)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        self.hub
            .bind_queue(self.connection_id, queue, exchange, routing_key)
    }

    async fn set_prefetch(&self, prefetch_count: u16) -> Result<()> {
        self.ensure_open()?;
        self.prefetch.store(prefetch_count, Ordering::Release);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        // ---
        self.ensure_open()?;

        let rx = self.hub.consume(
            self.connection_id,
            self.channel_id,
            queue,
            consumer_tag,
            self.prefetch.load(Ordering::Acquire),
        )?;

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.hub.close_channel(self.channel_id);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
    // ---
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    async fn open_channel(&self) -> Result<ChannelPtr> {
        // ---
        if self.closed.load(Ordering::Acquire) {
            return Err(PubSubError::Connection(format!(
                "[{}] connection is closed",
                self.connection_id()
            )));
        }

        let channel_id = self.hub.next_id();
        lock_ignore_poison(&self.channels).push(channel_id);

        Ok(Arc::new(MemoryChannel {
            hub: Arc::clone(&self.hub),
            connection_id: self.id,
            channel_id,
            prefetch: AtomicU16::new(0),
            closed: AtomicBool::new(false),
            connection_closed: Arc::clone(&self.closed),
        }))
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        self.hub.declare_exchange(name, kind, durable)
    }

    /// Close the connection.
    ///
    /// Closes every channel opened on it, which ends their consumers'
    /// delivery streams, and deletes its exclusive queues.
    async fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        log_debug!("{}: closing memory connection", self.connection_id());

        let channels = std::mem::take(&mut *lock_ignore_poison(&self.channels));
        self.hub.close_connection(self.id, &channels);
        Ok(())
    }
}

/// Create a new in-memory connection on the process-global hub.
///
/// All connections created with this function share one broker. For
/// isolated parallel testing, use [`create_memory_connection_with_hub`].
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_connection(config: &PubSubConfig) -> Result<ConnectionPtr> {
    // ---
    create_memory_connection_with_hub(config, global_hub()).await
}

/// Create a new in-memory connection on the provided hub.
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_connection_with_hub(
    config: &PubSubConfig,
    hub: Arc<MemoryHub>,
) -> Result<ConnectionPtr> {
    // ---
    log_debug!("{}: create memory connection", config.connection_id);

    let connection = MemoryConnection {
        base: ConnectionBase::from(config),
        id: hub.next_id(),
        hub,
        closed: Arc::new(AtomicBool::new(false)),
        channels: Mutex::new(Vec::new()),
    };

    Ok(Arc::new(connection))
}
