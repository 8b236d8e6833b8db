// src/rabbitmq/amqp.rs
// lapin-backed implementation of the broker seam.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info};

use super::errors::{Result, RpcError};
use super::transport::{
    Acknowledger, BrokerChannel, BrokerConnection, ChannelConfig, Connector, DeliveryStream,
    InboundDelivery, OutboundEnvelope, QueueSpec,
};

const PERSISTENT: u8 = 2;

pub struct AmqpConnector {
    uri: String,
    connect_timeout: Duration,
}

impl AmqpConnector {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

/// Strip user info from an AMQP URI so it can be logged.
pub(crate) fn redact_uri(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}{}", &uri[..scheme_end + 3], &uri[at + 1..])
        }
        _ => uri.to_string(),
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        info!(target_uri = %self.describe(), "Connecting to RabbitMQ");

        let connection = tokio::time::timeout(
            self.connect_timeout,
            Connection::connect(&self.uri, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| {
            RpcError::ConnectionError(format!(
                "connecting to {} timed out after {:?}",
                self.describe(),
                self.connect_timeout
            ))
        })?
        .map_err(|e| RpcError::ConnectionError(format!("Failed to connect: {}", e)))?;

        debug!("Successfully connected to RabbitMQ");
        Ok(Arc::new(AmqpConnection { inner: connection }))
    }

    fn describe(&self) -> String {
        redact_uri(&self.uri)
    }
}

struct AmqpConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(
        &self,
        label: &str,
        config: &ChannelConfig,
    ) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| RpcError::ChannelError(format!("Failed to create channel: {}", e)))?;

        if config.prefetch_count > 0 {
            debug!(channel = %label, prefetch = config.prefetch_count, "Setting channel QoS");
            channel
                .basic_qos(config.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(|e| RpcError::ChannelError(format!("Failed to set QoS: {}", e)))?;
        }

        if config.confirm_mode {
            debug!(channel = %label, "Enabling confirm mode");
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| {
                    RpcError::ChannelError(format!("Failed to enable confirm mode: {}", e))
                })?;
        }

        info!(channel = %label, "Channel created and configured");
        Ok(Arc::new(AmqpChannel {
            inner: channel,
            label: label.to_string(),
        }))
    }

    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if self.is_connected() {
            info!("Closing RabbitMQ connection gracefully");
            self.inner
                .close(200, "Closing connection")
                .await
                .map_err(|e| RpcError::ConnectionError(e.to_string()))?;
        }
        Ok(())
    }
}

struct AmqpChannel {
    inner: Channel,
    label: String,
}

fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(ttl) = spec.message_ttl {
        arguments.insert(
            "x-message-ttl".into(),
            AMQPValue::LongLongInt(ttl.as_millis() as i64),
        );
    }
    if let Some(exchange) = &spec.dead_letter_exchange {
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.clone().into()),
        );
    }
    arguments
}

fn properties_for(envelope: &OutboundEnvelope) -> BasicProperties {
    let mut properties = BasicProperties::default().with_delivery_mode(PERSISTENT);
    if let Some(reply_to) = &envelope.reply_to {
        properties = properties.with_reply_to(reply_to.clone().into());
    }
    if let Some(correlation_id) = &envelope.correlation_id {
        properties = properties.with_correlation_id(correlation_id.clone().into());
    }
    if let Some(content_type) = &envelope.content_type {
        properties = properties.with_content_type(content_type.clone().into());
    }
    if let Some(expiration) = envelope.expiration {
        // AMQP expiration is a decimal string of milliseconds
        properties = properties.with_expiration(expiration.as_millis().to_string().into());
    }
    properties
}

fn into_inbound(delivery: Delivery) -> InboundDelivery {
    let Delivery {
        data,
        properties,
        redelivered,
        acker,
        ..
    } = delivery;

    InboundDelivery {
        body: data,
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        reply_to: properties
            .reply_to()
            .as_ref()
            .map(|reply_to| reply_to.as_str().to_string()),
        redelivered,
        acker: Box::new(AmqpAcker(acker)),
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let queue = self
            .inner
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(spec),
            )
            .await
            .map_err(|e| {
                RpcError::QueueError(format!("Failed to declare queue {}: {}", spec.name, e))
            })?;

        debug!(
            channel = %self.label,
            queue = %spec.name,
            messages = queue.message_count(),
            consumers = queue.consumer_count(),
            "Queue declared"
        );
        Ok(())
    }

    async fn publish(&self, routing_key: &str, envelope: OutboundEnvelope) -> Result<()> {
        let properties = properties_for(&envelope);

        let confirm = self
            .inner
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                &envelope.body,
                properties,
            )
            .await
            .map_err(|e| RpcError::PublishError(format!("Failed to publish request: {}", e)))?;

        let confirmation = confirm
            .await
            .map_err(|e| RpcError::PublishError(format!("Publisher confirm failed: {}", e)))?;

        if confirmation.is_nack() {
            return Err(RpcError::PublishError(format!(
                "Broker rejected message routed to {}",
                routing_key
            )));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::ConsumeError(format!("Failed to create consumer: {}", e)))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(into_inbound)
                    .map_err(|e| RpcError::ConsumeError(e.to_string()))
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| RpcError::ConsumeError(format!("Failed to cancel consumer: {}", e)))
    }

    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if self.is_connected() {
            self.inner
                .close(200, "Closing channel")
                .await
                .map_err(|e| RpcError::ChannelError(e.to_string()))?;
        }
        Ok(())
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| RpcError::AckError(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| RpcError::AckError(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| RpcError::AckError(e.to_string()))
    }
}
