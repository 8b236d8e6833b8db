// src/rabbitmq/request_response.rs
//
// Client side of request/reply over the broker. A call publishes to the
// topic's request queue with `reply_to` and `correlation_id` set, then waits on
// its registry slot while the topic's reply dispatcher routes replies. The
// reply subscription is shared by every in-flight call on the topic and is
// cancelled when the last one leaves (unless the policy keeps it alive).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::connection::ConnectionManager;
use super::correlation::{CorrelationId, CorrelationRegistry, SlotState, Waiter};
use super::dispatcher::{DispatchSnapshot, DispatchStats, ReplyDispatcher, Subscription};
use super::errors::{Result, RpcError};
use super::transport::{BrokerChannel, OutboundEnvelope, QueueSpec};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A named request/reply pair of queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    pub request_queue: String,
    pub reply_queue: String,
}

impl Topic {
    pub fn new(
        name: impl Into<String>,
        request_queue: impl Into<String>,
        reply_queue: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            request_queue: request_queue.into(),
            reply_queue: reply_queue.into(),
        }
    }

    pub fn currency_aggregator() -> Self {
        Self::new(
            "currency_aggregator",
            "api_aggregation_queue",
            "reply_api_aggregation_queue",
        )
    }

    pub fn report_builder() -> Self {
        Self::new("report_builder", "report_queue", "reply_report_queue")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionPolicy {
    /// Cancel the reply consumer once no call on the topic is in flight.
    #[default]
    ReleaseWhenIdle,
    /// Keep the reply consumer until the client is closed.
    KeepAlive,
}

#[derive(Debug, Clone)]
pub struct RpcOptions {
    pub subscription_policy: SubscriptionPolicy,
    /// Stamp each request with an AMQP expiration equal to the call timeout.
    pub request_expiration: bool,
    /// `x-message-ttl` for reply queues declared by the client.
    pub reply_message_ttl: Option<Duration>,
    /// `x-dead-letter-exchange` for reply queues declared by the client.
    pub dead_letter_exchange: Option<String>,
    pub registry_grace: Duration,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            subscription_policy: SubscriptionPolicy::ReleaseWhenIdle,
            request_expiration: true,
            reply_message_ttl: Some(Duration::from_secs(60)),
            dead_letter_exchange: None,
            registry_grace: Duration::from_secs(5),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Per-topic subscription state shared by all calls on the topic.
struct TopicHandle {
    topic: Topic,
    subscription: tokio::sync::Mutex<Option<Subscription>>,
    in_flight: AtomicUsize,
    // set once the reply queue turned out to exist without our arguments
    plain_reply_queue: AtomicBool,
    stats: Arc<DispatchStats>,
}

impl TopicHandle {
    fn new(topic: Topic) -> Self {
        Self {
            topic,
            subscription: tokio::sync::Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            plain_reply_queue: AtomicBool::new(false),
            stats: Arc::new(DispatchStats::default()),
        }
    }

    fn reply_queue_spec(&self, options: &RpcOptions) -> QueueSpec {
        QueueSpec::durable(self.topic.reply_queue.clone())
            .with_message_ttl(options.reply_message_ttl)
            .with_dead_letter_exchange(options.dead_letter_exchange.clone())
    }

    /// Declare the reply queue with the configured TTL and dead-letter
    /// exchange. If the queue already exists without them the broker refuses
    /// the declare and closes the channel; fall back to a plain declare on a
    /// fresh channel and leave TTL to a broker policy. Returns the channel
    /// that is still open.
    async fn declare_reply_queue(
        &self,
        connections: &ConnectionManager,
        channel: Arc<dyn BrokerChannel>,
        options: &RpcOptions,
    ) -> Result<Arc<dyn BrokerChannel>> {
        let plain = QueueSpec::durable(self.topic.reply_queue.clone());
        let wanted = self.reply_queue_spec(options);
        if wanted == plain || self.plain_reply_queue.load(Ordering::SeqCst) {
            channel.declare_queue(&plain).await?;
            return Ok(channel);
        }

        match channel.declare_queue(&wanted).await {
            Ok(()) => Ok(channel),
            Err(RpcError::QueueError(reason)) => {
                warn!(
                    topic = %self.topic.name,
                    queue = %self.topic.reply_queue,
                    reason = %reason,
                    "Reply queue exists with different arguments, using it as is; set TTL through a broker policy"
                );
                self.plain_reply_queue.store(true, Ordering::SeqCst);
                let channel = connections.get_channel(&self.topic.name).await?;
                channel.declare_queue(&plain).await?;
                Ok(channel)
            }
            Err(e) => Err(e),
        }
    }

    /// Make sure a live reply consumer exists and count the caller in.
    /// Returns the channel to publish on.
    async fn acquire(
        &self,
        connections: &ConnectionManager,
        registry: &Arc<CorrelationRegistry>,
        options: &RpcOptions,
    ) -> Result<Arc<dyn BrokerChannel>> {
        let mut subscription = self.subscription.lock().await;
        let mut channel = connections.get_channel(&self.topic.name).await?;

        let live = subscription.as_ref().is_some_and(Subscription::is_live);
        if !live {
            if let Some(stale) = subscription.take() {
                debug!(topic = %self.topic.name, consumer_tag = %stale.consumer_tag(), "Replacing dead reply subscription");
                if let Err(e) = stale.cancel().await {
                    debug!(topic = %self.topic.name, error = %e, "Cancel of dead subscription failed");
                }
            }

            channel
                .declare_queue(&QueueSpec::durable(self.topic.request_queue.clone()))
                .await?;
            channel = self.declare_reply_queue(connections, channel, options).await?;

            *subscription = Some(
                ReplyDispatcher::bind(
                    channel.clone(),
                    &self.topic.reply_queue,
                    registry.clone(),
                    self.stats.clone(),
                )
                .await?,
            );
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(channel)
    }

    /// Cancel the reply consumer if nobody is using it. The count is checked
    /// under the subscription lock, so a concurrent `acquire` either counted
    /// itself in already or binds a fresh consumer afterwards.
    async fn release_if_idle(&self, policy: SubscriptionPolicy) {
        if policy == SubscriptionPolicy::KeepAlive {
            return;
        }

        let mut subscription = self.subscription.lock().await;
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            return;
        }
        if let Some(active) = subscription.take() {
            if let Err(e) = active.cancel().await {
                warn!(topic = %self.topic.name, error = %e, "Failed to cancel reply subscription");
            }
        }
    }

    async fn shutdown(&self) {
        if let Some(active) = self.subscription.lock().await.take() {
            if let Err(e) = active.cancel().await {
                warn!(topic = %self.topic.name, error = %e, "Failed to cancel reply subscription");
            }
        }
    }
}

/// Cleanup for one call. `finish` runs it on every normal exit; if the call
/// future is dropped first, `Drop` forgets the waiter and spawns the release.
struct CallGuard {
    registry: Arc<CorrelationRegistry>,
    handle: Arc<TopicHandle>,
    policy: SubscriptionPolicy,
    id: CorrelationId,
    subscribed: bool,
    armed: bool,
}

impl CallGuard {
    fn new(
        registry: Arc<CorrelationRegistry>,
        handle: Arc<TopicHandle>,
        policy: SubscriptionPolicy,
        id: CorrelationId,
    ) -> Self {
        Self {
            registry,
            handle,
            policy,
            id,
            subscribed: false,
            armed: true,
        }
    }

    /// Forget the waiter and give back the subscription. Returns false if
    /// the subscription still has to be released.
    fn disarm(&mut self) -> bool {
        self.armed = false;
        self.registry.forget(self.id.as_str());
        if self.subscribed {
            self.handle.in_flight.fetch_sub(1, Ordering::SeqCst);
            false
        } else {
            true
        }
    }

    async fn finish(mut self) {
        if self.disarm() {
            return;
        }
        let handle = self.handle.clone();
        let policy = self.policy;
        // run the release on its own task so it completes even if this
        // future is dropped halfway
        if let Err(e) = tokio::spawn(async move { handle.release_if_idle(policy).await }).await {
            warn!(correlation_id = %self.id, error = %e, "Subscription release task failed");
        }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if !self.armed || self.disarm() {
            return;
        }
        debug!(correlation_id = %self.id, topic = %self.handle.topic.name, "Call dropped mid-flight, releasing");
        let handle = self.handle.clone();
        let policy = self.policy;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { handle.release_if_idle(policy).await });
            }
            Err(_) => warn!(
                topic = %self.handle.topic.name,
                "No runtime to release reply subscription"
            ),
        }
    }
}

struct ClientInner {
    connections: Arc<ConnectionManager>,
    registry: Arc<CorrelationRegistry>,
    topics: Mutex<HashMap<String, Arc<TopicHandle>>>,
    options: RpcOptions,
}

/// RPC client over a shared connection manager. Cheap to clone; clones share
/// the registry and the reply subscriptions.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self::with_options(connections, RpcOptions::default())
    }

    pub fn with_options(connections: Arc<ConnectionManager>, options: RpcOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                connections,
                registry: Arc::new(CorrelationRegistry::with_grace(options.registry_grace)),
                topics: Mutex::new(HashMap::new()),
                options,
            }),
        }
    }

    pub fn options(&self) -> &RpcOptions {
        &self.inner.options
    }

    fn topic_handle(&self, topic: &Topic) -> Arc<TopicHandle> {
        let mut topics = lock(&self.inner.topics);
        if let Some(handle) = topics.get(&topic.name) {
            if handle.topic != *topic {
                warn!(topic = %topic.name, "Topic already registered with different queues");
            }
            return handle.clone();
        }
        let handle = Arc::new(TopicHandle::new(topic.clone()));
        topics.insert(topic.name.clone(), handle.clone());
        handle
    }

    fn existing_handle(&self, topic: &str) -> Option<Arc<TopicHandle>> {
        lock(&self.inner.topics).get(topic).cloned()
    }

    /// Send `payload` to the topic's request queue and wait up to `timeout`
    /// for the reply carrying the same correlation id.
    pub async fn call(&self, topic: &Topic, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        // connect before registering so an outage leaves no entry behind
        self.inner.connections.get_channel(&topic.name).await?;
        let handle = self.topic_handle(topic);

        let (id, mut waiter) = self.inner.registry.register(timeout);
        let mut guard = CallGuard::new(
            self.inner.registry.clone(),
            handle.clone(),
            self.inner.options.subscription_policy,
            id.clone(),
        );

        let outcome = self
            .exchange(&handle, &mut guard, &mut waiter, payload, timeout)
            .await;
        guard.finish().await;

        match &outcome {
            Ok(reply) => debug!(topic = %topic.name, correlation_id = %id, bytes = reply.len(), "RPC call completed"),
            Err(e) => debug!(topic = %topic.name, correlation_id = %id, error = %e, "RPC call failed"),
        }
        outcome
    }

    async fn exchange(
        &self,
        handle: &TopicHandle,
        guard: &mut CallGuard,
        waiter: &mut Waiter,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let topic = &handle.topic;
        let id = guard.id.clone();

        let channel = handle
            .acquire(&self.inner.connections, &self.inner.registry, &self.inner.options)
            .await?;
        guard.subscribed = true;

        let envelope = OutboundEnvelope::new(payload)
            .with_reply_to(topic.reply_queue.clone())
            .with_correlation_id(id.as_str())
            .with_content_type(JSON_CONTENT_TYPE)
            .with_expiration(self.inner.options.request_expiration.then_some(timeout));

        channel.publish(&topic.request_queue, envelope).await?;
        debug!(topic = %topic.name, correlation_id = %id, queue = %topic.request_queue, "Request published");

        match tokio::time::timeout(timeout, waiter.wait()).await {
            Ok(state) => settled_reply(state, timeout),
            Err(_) => {
                if self.inner.registry.time_out(id.as_str()) {
                    warn!(topic = %topic.name, correlation_id = %id, ?timeout, "RPC call timed out");
                    return Err(RpcError::Timeout(timeout));
                }
                debug!(topic = %topic.name, correlation_id = %id, "Reply arrived as the call timed out");
                settled_reply(waiter.state(), timeout)
            }
        }
    }

    /// `call` with JSON encoding of the request and decoding of the reply.
    pub async fn call_json<T, R>(&self, topic: &Topic, request: &T, timeout: Duration) -> Result<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_vec(request)
            .map_err(|e| RpcError::SerializationError(e.to_string()))?;
        let reply = self.call(topic, payload, timeout).await?;
        serde_json::from_slice(&reply).map_err(|e| RpcError::DeserializationError(e.to_string()))
    }

    pub async fn subscription_active(&self, topic: &str) -> bool {
        match self.existing_handle(topic) {
            Some(handle) => handle
                .subscription
                .lock()
                .await
                .as_ref()
                .is_some_and(Subscription::is_live),
            None => false,
        }
    }

    pub fn in_flight(&self, topic: &str) -> usize {
        self.existing_handle(topic)
            .map_or(0, |handle| handle.in_flight.load(Ordering::SeqCst))
    }

    pub fn stats(&self, topic: &str) -> DispatchSnapshot {
        self.existing_handle(topic)
            .map(|handle| handle.stats.snapshot())
            .unwrap_or_default()
    }

    /// Number of registered waiters across all topics.
    pub fn pending_calls(&self) -> usize {
        self.inner.registry.len()
    }

    /// Cancel every reply subscription. The connection manager is shared and
    /// stays open.
    pub async fn close(&self) {
        let handles: Vec<Arc<TopicHandle>> = lock(&self.inner.topics).values().cloned().collect();
        for handle in handles {
            handle.shutdown().await;
        }
        info!("RPC client closed");
    }
}

fn settled_reply(state: SlotState, timeout: Duration) -> Result<Vec<u8>> {
    match state {
        SlotState::Resolved(body) => Ok(body),
        SlotState::TimedOut => Err(RpcError::Timeout(timeout)),
        SlotState::Cancelled | SlotState::Pending => Err(RpcError::ResponseChannelClosed),
    }
}
