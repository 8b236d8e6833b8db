// src/lib.rs
//! RPC over RabbitMQ for the finance backend: requests go out on a topic's
//! request queue, replies come back on its shared reply queue and are matched
//! to the waiting call by correlation id.

pub mod config;
pub mod env;
pub mod gateway;
pub mod message;
pub mod models;
pub mod rabbitmq;
pub mod supervisor;

pub use gateway::{FinanceGateway, TimeoutPolicy, NO_RESPONSE};
pub use rabbitmq::{ConnectionManager, RpcClient, RpcError, Topic};
