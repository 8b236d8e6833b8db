// src/rabbitmq/dispatcher.rs
//
// Consumes a reply queue and routes each delivery to the waiter registered
// under its correlation id. Replies nobody is waiting for are requeued for
// whichever client owns them; replies without a correlation id are rejected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::correlation::{CorrelationRegistry, Resolution};
use super::errors::Result;
use super::transport::{BrokerChannel, DeliveryStream, InboundDelivery};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// How long a reply that came back unclaimed waits before it is requeued again.
const ORPHAN_REQUEUE_DELAY: Duration = Duration::from_millis(50);

/// Running counters for one reply queue.
#[derive(Debug, Default)]
pub struct DispatchStats {
    delivered: AtomicU64,
    resolved: AtomicU64,
    /// Replies requeued because nobody here waits for them. A reply whose
    /// owner is gone keeps cycling until the queue TTL drops it, at most
    /// once per `ORPHAN_REQUEUE_DELAY` after the first pass, so this grows
    /// steadily while such a reply sits on a queue with a single consumer.
    orphaned: AtomicU64,
    malformed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSnapshot {
    pub delivered: u64,
    pub resolved: u64,
    pub orphaned: u64,
    pub malformed: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// A live consumer on a reply queue together with the task draining it.
pub struct Subscription {
    consumer_tag: String,
    queue: String,
    channel: Arc<dyn BrokerChannel>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// False once the delivery stream has ended, e.g. after the channel died.
    pub fn is_live(&self) -> bool {
        !self.task.is_finished() && self.channel.is_connected()
    }

    /// Cancel the consumer and wait briefly for deliveries already handed to
    /// it to be routed. Anything still buffered after that is returned to the
    /// queue by the broker.
    pub async fn cancel(self) -> Result<()> {
        let Subscription {
            consumer_tag,
            queue,
            channel,
            mut task,
        } = self;

        let cancelled = if channel.is_connected() {
            channel.cancel(&consumer_tag).await
        } else {
            Ok(())
        };

        if tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await.is_err() {
            warn!(consumer_tag = %consumer_tag, queue = %queue, "Reply consumer did not drain, aborting");
            task.abort();
        }

        info!(consumer_tag = %consumer_tag, queue = %queue, "Reply subscription cancelled");
        cancelled
    }
}

pub struct ReplyDispatcher;

impl ReplyDispatcher {
    /// Start consuming `reply_queue` and spawn the routing loop.
    pub async fn bind(
        channel: Arc<dyn BrokerChannel>,
        reply_queue: &str,
        registry: Arc<CorrelationRegistry>,
        stats: Arc<DispatchStats>,
    ) -> Result<Subscription> {
        let consumer_tag = format!("reply-{}", Uuid::new_v4());
        let deliveries = channel.consume(reply_queue, &consumer_tag).await?;

        info!(consumer_tag = %consumer_tag, queue = %reply_queue, "Reply subscription started");

        let task = tokio::spawn(run(
            deliveries,
            registry,
            stats,
            consumer_tag.clone(),
            reply_queue.to_string(),
        ));

        Ok(Subscription {
            consumer_tag,
            queue: reply_queue.to_string(),
            channel,
            task,
        })
    }
}

async fn run(
    mut deliveries: DeliveryStream,
    registry: Arc<CorrelationRegistry>,
    stats: Arc<DispatchStats>,
    consumer_tag: String,
    queue: String,
) {
    while let Some(delivery) = deliveries.next().await {
        match delivery {
            Ok(delivery) => route(delivery, &registry, &stats, &queue).await,
            Err(e) => {
                error!(consumer_tag = %consumer_tag, queue = %queue, error = %e, "Reply consumer failed");
                break;
            }
        }
    }
    debug!(consumer_tag = %consumer_tag, queue = %queue, "Reply consumer stream ended");
}

async fn route(
    delivery: InboundDelivery,
    registry: &CorrelationRegistry,
    stats: &DispatchStats,
    queue: &str,
) {
    stats.delivered.fetch_add(1, Ordering::Relaxed);

    let Some(correlation_id) = delivery.correlation_id.clone() else {
        stats.malformed.fetch_add(1, Ordering::Relaxed);
        warn!(queue = %queue, "Reply without correlation id, rejecting");
        if let Err(e) = delivery.reject(false).await {
            error!(queue = %queue, error = %e, "Failed to reject malformed reply");
        }
        return;
    };

    let redelivered = delivery.redelivered;
    let InboundDelivery { body, acker, .. } = delivery;

    match registry.resolve(&correlation_id, body) {
        Resolution::Delivered => {
            stats.resolved.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id = %correlation_id, queue = %queue, "Reply matched");
            if let Err(e) = acker.ack().await {
                error!(correlation_id = %correlation_id, error = %e, "Failed to ack reply");
            }
        }
        outcome @ (Resolution::Unknown | Resolution::AlreadySettled) => {
            stats.orphaned.fetch_add(1, Ordering::Relaxed);
            warn!(
                correlation_id = %correlation_id,
                queue = %queue,
                redelivered,
                known = outcome == Resolution::AlreadySettled,
                "Orphan reply, requeueing"
            );
            if !redelivered {
                if let Err(e) = acker.nack(true).await {
                    error!(correlation_id = %correlation_id, error = %e, "Failed to requeue orphan reply");
                }
                return;
            }

            // Seen before and still unclaimed: hold it unacked for a moment so
            // a lone consumer does not spin on it, without stalling the loop.
            tokio::spawn(async move {
                tokio::time::sleep(ORPHAN_REQUEUE_DELAY).await;
                if let Err(e) = acker.nack(true).await {
                    debug!(correlation_id = %correlation_id, error = %e, "Delayed requeue of orphan reply failed");
                }
            });
        }
    }
}
