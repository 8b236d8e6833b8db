// src/rabbitmq/memory.rs
//
// In-process broker implementing the transport traits. Models the parts of
// RabbitMQ the RPC layer depends on: default-exchange routing by queue name,
// round-robin consumers, ack / nack / reject with requeue, delivery counts,
// per-message and per-queue TTL with dead-lettering, unacked messages
// returning to the queue when their connection drops, and the
// PRECONDITION_FAILED channel close on an inequivalent re-declare.
//
// Prefetch limits and publisher confirms are not modelled; publishes either
// succeed or fail according to `set_reject_publishes`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::errors::{Result, RpcError};
use super::transport::{
    Acknowledger, BrokerChannel, BrokerConnection, ChannelConfig, Connector, DeliveryStream,
    InboundDelivery, OutboundEnvelope, QueueSpec,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Cheap to clone; every clone talks to the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, QueueState>>,
    // Deliveries dropped without being settled. Kept apart from `queues`
    // because they are recorded from `Drop`, which may run while `queues`
    // is already locked.
    abandoned: Mutex<Vec<(String, u64)>>,
    generation: AtomicU64,
    connects: AtomicUsize,
    failing_connects: AtomicUsize,
    reject_publishes: AtomicBool,
    next_delivery: AtomicU64,
    unroutable: AtomicUsize,
}

#[derive(Default)]
struct QueueState {
    spec: Option<QueueSpec>,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
    dead_lettered: usize,
}

#[derive(Clone)]
struct StoredMessage {
    envelope: OutboundEnvelope,
    delivery_count: u32,
    expires_at: Option<Instant>,
}

impl StoredMessage {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct ConsumerSlot {
    tag: String,
    tx: mpsc::UnboundedSender<Result<InboundDelivery>>,
}

/// Point-in-time view of one message held by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSnapshot {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub body: Vec<u8>,
    pub delivery_count: u32,
    pub unacked: bool,
}

impl MessageSnapshot {
    fn from_stored(message: &StoredMessage, unacked: bool) -> Self {
        Self {
            correlation_id: message.envelope.correlation_id.clone(),
            reply_to: message.envelope.reply_to.clone(),
            body: message.envelope.body.clone(),
            delivery_count: message.delivery_count,
            unacked,
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful connections opened so far.
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Make the next `attempts` connection attempts fail.
    pub fn fail_next_connects(&self, attempts: usize) {
        self.state.failing_connects.store(attempts, Ordering::SeqCst);
    }

    pub fn set_reject_publishes(&self, reject: bool) {
        self.state.reject_publishes.store(reject, Ordering::SeqCst);
    }

    /// Simulate the broker dropping every connection: consumers are removed
    /// and unacked messages go back to their queues.
    pub fn disconnect_all(&self) {
        self.state.generation.fetch_add(1, Ordering::SeqCst);
        let mut queues = lock(&self.state.queues);
        for queue in queues.values_mut() {
            queue.consumers.clear();
            let mut returned: Vec<(u64, StoredMessage)> = queue.unacked.drain().collect();
            returned.sort_by_key(|(id, _)| *id);
            for (_, message) in returned.into_iter().rev() {
                queue.ready.push_front(message);
            }
        }
        debug!("In-memory broker dropped all connections");
    }

    /// Declare as an out-of-band party would, e.g. another service that
    /// created the queue first.
    pub fn declare(&self, spec: QueueSpec) -> Result<()> {
        self.state.declare(&spec)
    }

    /// Publish as a third party would, outside any connection.
    pub fn inject(&self, queue: &str, envelope: OutboundEnvelope) {
        self.state.publish(queue, envelope);
    }

    /// Take the first ready message with auto-ack, like `basic.get`.
    pub fn get(&self, queue: &str) -> Option<MessageSnapshot> {
        self.state.reclaim_abandoned();
        let mut queues = lock(&self.state.queues);
        let queue = queues.get_mut(queue)?;
        queue.expire(Instant::now());
        queue.ready.pop_front().map(|mut message| {
            message.delivery_count += 1;
            MessageSnapshot::from_stored(&message, false)
        })
    }

    /// Ready and unacked messages, ready ones first.
    pub fn messages(&self, queue: &str) -> Vec<MessageSnapshot> {
        self.state.reclaim_abandoned();
        let mut queues = lock(&self.state.queues);
        let Some(queue) = queues.get_mut(queue) else {
            return Vec::new();
        };
        queue.expire(Instant::now());
        let mut unacked: Vec<_> = queue.unacked.iter().collect();
        unacked.sort_by_key(|(id, _)| **id);
        queue
            .ready
            .iter()
            .map(|message| MessageSnapshot::from_stored(message, false))
            .chain(
                unacked
                    .into_iter()
                    .map(|(_, message)| MessageSnapshot::from_stored(message, true)),
            )
            .collect()
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.state.reclaim_abandoned();
        let mut queues = lock(&self.state.queues);
        queues.get_mut(queue).map_or(0, |queue| {
            queue.expire(Instant::now());
            queue.ready.len()
        })
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        lock(&self.state.queues)
            .get(queue)
            .map_or(0, |queue| queue.unacked.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        lock(&self.state.queues)
            .get(queue)
            .map_or(0, |queue| queue.consumers.len())
    }

    pub fn dead_lettered(&self, queue: &str) -> usize {
        let mut queues = lock(&self.state.queues);
        queues.get_mut(queue).map_or(0, |queue| {
            queue.expire(Instant::now());
            queue.dead_lettered
        })
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        lock(&self.state.queues).contains_key(queue)
    }

    /// Messages published to a queue nobody declared.
    pub fn unroutable_count(&self) -> usize {
        self.state.unroutable.load(Ordering::SeqCst)
    }
}

impl QueueState {
    fn expire(&mut self, now: Instant) {
        let before = self.ready.len();
        self.ready.retain(|message| !message.is_expired(now));
        self.dead_lettered += before - self.ready.len();
    }
}

impl BrokerState {
    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Queue arguments are fixed by the first declare; a later declare
    /// must match them exactly.
    fn declare(&self, spec: &QueueSpec) -> Result<()> {
        let mut queues = lock(&self.queues);
        let queue = queues.entry(spec.name.clone()).or_default();
        match &queue.spec {
            None => {
                queue.spec = Some(spec.clone());
                Ok(())
            }
            Some(existing) if existing == spec => Ok(()),
            Some(existing) => Err(RpcError::QueueError(format!(
                "PRECONDITION_FAILED - inequivalent arguments for queue '{}' (declared {:?}, requested {:?})",
                spec.name, existing, spec
            ))),
        }
    }

    fn publish(self: &Arc<Self>, routing_key: &str, envelope: OutboundEnvelope) {
        self.reclaim_abandoned();
        let mut queues = lock(&self.queues);
        let Some(queue) = queues.get_mut(routing_key) else {
            // The default exchange silently drops unroutable messages.
            self.unroutable.fetch_add(1, Ordering::SeqCst);
            debug!(queue = %routing_key, "Dropping unroutable message");
            return;
        };

        let now = Instant::now();
        let queue_ttl = queue.spec.as_ref().and_then(|spec| spec.message_ttl);
        let ttl = match (envelope.expiration, queue_ttl) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        queue.ready.push_back(StoredMessage {
            envelope,
            delivery_count: 0,
            expires_at: ttl.map(|ttl| now + ttl),
        });
        self.dispatch(routing_key, queue);
    }

    fn dispatch(self: &Arc<Self>, name: &str, queue: &mut QueueState) {
        let now = Instant::now();
        queue.consumers.retain(|consumer| !consumer.tx.is_closed());

        while !queue.consumers.is_empty() {
            let Some(mut message) = queue.ready.pop_front() else {
                break;
            };
            if message.is_expired(now) {
                queue.dead_lettered += 1;
                trace!(queue = %name, "Message expired before delivery");
                continue;
            }

            let index = queue.cursor % queue.consumers.len();
            queue.cursor = queue.cursor.wrapping_add(1);
            message.delivery_count += 1;

            let delivery_id = self.next_delivery.fetch_add(1, Ordering::SeqCst);
            let delivery = InboundDelivery {
                body: message.envelope.body.clone(),
                correlation_id: message.envelope.correlation_id.clone(),
                reply_to: message.envelope.reply_to.clone(),
                redelivered: message.delivery_count > 1,
                acker: Box::new(MemoryAcker {
                    state: Arc::downgrade(self),
                    queue: name.to_string(),
                    delivery_id,
                    settled: AtomicBool::new(false),
                }),
            };
            queue.unacked.insert(delivery_id, message);

            // A failed send drops the delivery, whose acker records it as
            // abandoned; it is requeued on the next broker operation.
            if queue.consumers[index].tx.send(Ok(delivery)).is_err() {
                queue.consumers.remove(index);
            }
        }
    }

    fn reclaim_abandoned(self: &Arc<Self>) {
        let abandoned = std::mem::take(&mut *lock(&self.abandoned));
        if abandoned.is_empty() {
            return;
        }
        let mut queues = lock(&self.queues);
        for (name, delivery_id) in abandoned {
            if let Some(queue) = queues.get_mut(&name) {
                if let Some(message) = queue.unacked.remove(&delivery_id) {
                    queue.ready.push_front(message);
                    self.dispatch(&name, queue);
                }
            }
        }
    }

    /// `None` acks; `Some(requeue)` nacks or rejects.
    fn settle(
        self: &Arc<Self>,
        name: &str,
        delivery_id: u64,
        requeue: Option<bool>,
    ) -> Result<()> {
        let mut queues = lock(&self.queues);
        let queue = queues
            .get_mut(name)
            .ok_or_else(|| RpcError::AckError(format!("queue {} no longer exists", name)))?;
        let message = queue.unacked.remove(&delivery_id).ok_or_else(|| {
            RpcError::AckError(format!("unknown delivery tag {}", delivery_id))
        })?;

        match requeue {
            Some(true) => {
                queue.ready.push_front(message);
                self.dispatch(name, queue);
            }
            Some(false) => queue.dead_lettered += 1,
            None => {}
        }
        Ok(())
    }
}

struct MemoryAcker {
    state: Weak<BrokerState>,
    queue: String,
    delivery_id: u64,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(RpcError::AckError(format!(
                "delivery {} already settled",
                self.delivery_id
            )));
        }
        let state = self
            .state
            .upgrade()
            .ok_or_else(|| RpcError::AckError("broker is gone".to_string()))?;
        state.settle(&self.queue, self.delivery_id, requeue)
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(Some(requeue))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle(Some(requeue))
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if self.settled.load(Ordering::SeqCst) {
            return;
        }
        if let Some(state) = self.state.upgrade() {
            lock(&state.abandoned).push((self.queue.clone(), self.delivery_id));
        }
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let failing = &self.state.failing_connects;
        if failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RpcError::ConnectionError(
                "in-memory broker refused the connection".to_string(),
            ));
        }

        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            state: self.state.clone(),
            generation: self.state.current_generation(),
            closed: AtomicBool::new(false),
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemoryConnection {
    state: Arc<BrokerState>,
    generation: u64,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(
        &self,
        label: &str,
        _config: &ChannelConfig,
    ) -> Result<Arc<dyn BrokerChannel>> {
        if !self.is_connected() {
            return Err(RpcError::ChannelError(
                "connection is closed".to_string(),
            ));
        }
        trace!(channel = %label, "Opening in-memory channel");
        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
            generation: self.generation,
            tags: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }))
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.generation == self.state.current_generation()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryChannel {
    state: Arc<BrokerState>,
    generation: u64,
    tags: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(RpcError::ChannelError("channel is closed".to_string()))
        }
    }

    fn remove_consumer(&self, consumer_tag: &str) -> bool {
        let mut queues = lock(&self.state.queues);
        let mut removed = false;
        for queue in queues.values_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|consumer| consumer.tag != consumer_tag);
            removed |= queue.consumers.len() != before;
        }
        removed
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        self.ensure_open()?;
        if let Err(e) = self.state.declare(spec) {
            // the broker closes the channel on a failed declare
            self.close().await?;
            return Err(e);
        }
        Ok(())
    }

    async fn publish(&self, routing_key: &str, envelope: OutboundEnvelope) -> Result<()> {
        self.ensure_open()?;
        if self.state.reject_publishes.load(Ordering::SeqCst) {
            return Err(RpcError::PublishError(format!(
                "Broker rejected message routed to {}",
                routing_key
            )));
        }
        self.state.publish(routing_key, envelope);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        self.state.reclaim_abandoned();

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut queues = lock(&self.state.queues);
            let state = queues.get_mut(queue).ok_or_else(|| {
                RpcError::ConsumeError(format!("no queue '{}' in vhost", queue))
            })?;
            if state.consumers.iter().any(|c| c.tag == consumer_tag) {
                return Err(RpcError::ConsumeError(format!(
                    "consumer tag {} already in use",
                    consumer_tag
                )));
            }
            state.consumers.push(ConsumerSlot {
                tag: consumer_tag.to_string(),
                tx,
            });
            self.state.dispatch(queue, state);
        }
        lock(&self.tags).insert(consumer_tag.to_string());

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.ensure_open()?;
        lock(&self.tags).remove(consumer_tag);
        if !self.remove_consumer(consumer_tag) {
            debug!(consumer_tag = %consumer_tag, "Cancel for unknown consumer tag");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.generation == self.state.current_generation()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let tags: Vec<String> = lock(&self.tags).drain().collect();
        for tag in tags {
            self.remove_consumer(&tag);
        }
        Ok(())
    }
}
