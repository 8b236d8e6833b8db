// src/rabbitmq/connection.rs
//
// One shared broker connection plus one channel per topic. Both are created
// lazily behind `OnceCell`s, so concurrent first callers share a single
// attempt. A dead connection or channel is replaced by a fresh cell and
// re-established once on the next request; a failed attempt is returned to the
// caller as-is. Retrying belongs to `supervisor`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::errors::{Result, RpcError};
use super::transport::{BrokerChannel, BrokerConnection, ChannelConfig, Connector};

type ConnectionCell = Arc<OnceCell<Arc<dyn BrokerConnection>>>;
type ChannelCell = Arc<OnceCell<Arc<dyn BrokerChannel>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    config: ChannelConfig,
    connection: RwLock<ConnectionCell>,
    channels: Mutex<HashMap<String, ChannelCell>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, config: ChannelConfig) -> Self {
        debug!(
            target_uri = %connector.describe(),
            prefetch = config.prefetch_count,
            confirm = config.confirm_mode,
            "Creating connection manager"
        );

        Self {
            connector,
            config,
            connection: RwLock::new(Arc::new(OnceCell::new())),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn describe(&self) -> String {
        self.connector.describe()
    }

    fn connection_cell(&self) -> ConnectionCell {
        match self.connection.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swap in an empty cell, but only if `stale` is still the current one;
    /// a concurrent caller may already have replaced it.
    fn replace_connection_cell(&self, stale: &ConnectionCell) {
        let mut guard = match self.connection.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if Arc::ptr_eq(&guard, stale) {
            *guard = Arc::new(OnceCell::new());
        }
    }

    async fn init_connection(&self, cell: &ConnectionCell) -> Result<Arc<dyn BrokerConnection>> {
        cell.get_or_try_init(|| async {
            let connection = self.connector.connect().await?;
            info!(target_uri = %self.connector.describe(), "Broker connection established");
            Ok::<_, RpcError>(connection)
        })
        .await
        .cloned()
    }

    /// Get the shared connection, connecting on first use.
    pub async fn connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        let cell = self.connection_cell();
        let connection = self.init_connection(&cell).await?;
        if connection.is_connected() {
            return Ok(connection);
        }

        warn!(target_uri = %self.connector.describe(), "Broker connection lost, reconnecting");
        self.replace_connection_cell(&cell);
        let cell = self.connection_cell();
        self.init_connection(&cell).await
    }

    fn channel_cell(&self, topic: &str) -> ChannelCell {
        lock(&self.channels)
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    fn replace_channel_cell(&self, topic: &str, stale: &ChannelCell) {
        let mut channels = lock(&self.channels);
        if let Some(current) = channels.get(topic) {
            if Arc::ptr_eq(current, stale) {
                channels.insert(topic.to_string(), Arc::new(OnceCell::new()));
            }
        }
    }

    async fn init_channel(&self, topic: &str, cell: &ChannelCell) -> Result<Arc<dyn BrokerChannel>> {
        cell.get_or_try_init(|| async {
            let connection = self.connection().await?;
            debug!(topic = %topic, "Opening channel");
            connection.open_channel(topic, &self.config).await
        })
        .await
        .cloned()
    }

    /// Get the channel dedicated to `topic`, creating it on first request.
    pub async fn get_channel(&self, topic: &str) -> Result<Arc<dyn BrokerChannel>> {
        let cell = self.channel_cell(topic);
        let channel = self.init_channel(topic, &cell).await?;
        if channel.is_connected() {
            return Ok(channel);
        }

        warn!(topic = %topic, "Channel closed, opening a new one");
        self.replace_channel_cell(topic, &cell);
        let cell = self.channel_cell(topic);
        self.init_channel(topic, &cell).await
    }

    /// Check if the connection is established and healthy
    pub fn is_healthy(&self) -> bool {
        self.connection_cell()
            .get()
            .is_some_and(|connection| connection.is_connected())
    }

    /// Close every channel, then the connection. The manager can be used
    /// again afterwards; it will reconnect lazily.
    pub async fn close(&self) -> Result<()> {
        let channels: Vec<(String, ChannelCell)> = lock(&self.channels).drain().collect();
        for (topic, cell) in channels {
            if let Some(channel) = cell.get() {
                if let Err(e) = channel.close().await {
                    warn!(topic = %topic, error = %e, "Failed to close channel");
                }
            }
        }

        let cell = self.connection_cell();
        self.replace_connection_cell(&cell);
        if let Some(connection) = cell.get() {
            info!(target_uri = %self.connector.describe(), "Closing broker connection");
            connection.close().await?;
        }
        Ok(())
    }
}
