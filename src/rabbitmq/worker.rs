// src/rabbitmq/worker.rs
//
// Worker side of request/reply: consume a request queue, run a handler, and
// publish its output to the request's `reply_to` queue under the same
// correlation id. The real aggregator and report renderer live elsewhere;
// this is what tests and the demo run in their place.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::connection::ConnectionManager;
use super::errors::{Result, RpcError};
use super::request_response::JSON_CONTENT_TYPE;
use super::transport::{BrokerChannel, InboundDelivery, OutboundEnvelope, QueueSpec};

const STOP_TIMEOUT: Duration = Duration::from_secs(1);

pub struct RpcWorker {
    channel: Arc<dyn BrokerChannel>,
    queue: String,
}

/// A running worker. Dropping it leaves the worker running; call `stop`.
pub struct WorkerHandle {
    consumer_tag: String,
    queue: String,
    channel: Arc<dyn BrokerChannel>,
    task: JoinHandle<()>,
}

impl RpcWorker {
    /// Open a dedicated channel named `label` and declare `queue` on it.
    pub async fn bind(connections: &ConnectionManager, label: &str, queue: &str) -> Result<Self> {
        let channel = connections.get_channel(label).await?;
        channel.declare_queue(&QueueSpec::durable(queue)).await?;
        Ok(Self {
            channel,
            queue: queue.to_string(),
        })
    }

    /// Start consuming. Each request is handled on its own task, so a slow
    /// request never holds up the ones behind it.
    pub async fn serve<F, Fut>(self, handler: F) -> Result<WorkerHandle>
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
    {
        let consumer_tag = format!("worker-{}", Uuid::new_v4());
        let mut requests = self.channel.consume(&self.queue, &consumer_tag).await?;

        info!(queue = %self.queue, consumer_tag = %consumer_tag, "RPC worker started");

        let handler = Arc::new(handler);
        let channel = self.channel.clone();
        let queue = self.queue.clone();
        let task = tokio::spawn(async move {
            while let Some(delivery_result) = requests.next().await {
                match delivery_result {
                    Ok(delivery) => {
                        let channel = channel.clone();
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            process_request(channel, delivery, handler).await;
                        });
                    }
                    Err(e) => {
                        error!(queue = %queue, error = %e, "Error receiving request");
                        break;
                    }
                }
            }
            debug!(queue = %queue, "RPC worker stream ended");
        });

        Ok(WorkerHandle {
            consumer_tag,
            queue: self.queue,
            channel: self.channel,
            task,
        })
    }

    /// `serve` with JSON decoding of requests and encoding of replies. A
    /// request that does not decode is rejected.
    pub async fn serve_json<T, R, F, Fut>(self, handler: F) -> Result<WorkerHandle>
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.serve(move |body: Vec<u8>| {
            let handler = handler.clone();
            async move {
                let request: T = serde_json::from_slice(&body)
                    .map_err(|e| RpcError::DeserializationError(e.to_string()))?;
                let reply = handler(request).await?;
                serde_json::to_vec(&reply).map_err(|e| RpcError::SerializationError(e.to_string()))
            }
        })
        .await
    }
}

impl WorkerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn stop(self) -> Result<()> {
        let WorkerHandle {
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
        if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
            task.abort();
        }
        info!(queue = %queue, "RPC worker stopped");
        cancelled
    }
}

async fn process_request<F, Fut>(
    channel: Arc<dyn BrokerChannel>,
    delivery: InboundDelivery,
    handler: Arc<F>,
) where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
{
    let Some(reply_to) = delivery.reply_to.clone() else {
        error!("Received RPC request without reply_to");
        if let Err(e) = delivery.reject(false).await {
            warn!(error = %e, "Failed to reject request");
        }
        return;
    };

    let Some(correlation_id) = delivery.correlation_id.clone() else {
        error!(reply_to = %reply_to, "Received RPC request without correlation_id");
        if let Err(e) = delivery.reject(false).await {
            warn!(error = %e, "Failed to reject request");
        }
        return;
    };

    debug!(correlation_id = %correlation_id, reply_to = %reply_to, "Handling RPC request");

    let payload = match handler(delivery.body.clone()).await {
        Ok(payload) => payload,
        Err(e) => {
            error!(correlation_id = %correlation_id, error = %e, "Error processing request");
            if let Err(e) = delivery.reject(false).await {
                warn!(error = %e, "Failed to reject request");
            }
            return;
        }
    };

    let reply = OutboundEnvelope::new(payload)
        .with_correlation_id(correlation_id.clone())
        .with_content_type(JSON_CONTENT_TYPE);

    match channel.publish(&reply_to, reply).await {
        Ok(()) => {
            debug!(correlation_id = %correlation_id, reply_to = %reply_to, "Sent RPC reply");
            if let Err(e) = delivery.ack().await {
                warn!(correlation_id = %correlation_id, error = %e, "Failed to ack request");
            }
        }
        Err(e) => {
            error!(correlation_id = %correlation_id, error = %e, "Failed to send reply");
            if let Err(e) = delivery.nack(true).await {
                warn!(correlation_id = %correlation_id, error = %e, "Failed to requeue request");
            }
        }
    }
}
