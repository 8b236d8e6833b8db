// src/rabbitmq/mod.rs
// RPC over RabbitMQ: broker seam, connection management, correlation and
// reply dispatch.

pub mod errors;
pub mod transport;
pub mod amqp;
pub mod memory;
pub mod connection;
pub mod correlation;
pub mod dispatcher;
pub mod request_response;
pub mod worker;

// Re-export specific items to simplify imports elsewhere
pub use amqp::AmqpConnector;
pub use connection::ConnectionManager;
pub use correlation::{CorrelationId, CorrelationRegistry, Resolution, SlotState, Waiter};
pub use dispatcher::{DispatchSnapshot, DispatchStats, ReplyDispatcher, Subscription};
pub use errors::{Result, RpcError};
pub use memory::{InMemoryBroker, MessageSnapshot};
pub use request_response::{RpcClient, RpcOptions, SubscriptionPolicy, Topic};
pub use transport::{ChannelConfig, Connector, OutboundEnvelope, QueueSpec};
pub use worker::{RpcWorker, WorkerHandle};
