use std::env;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    #[serde(rename = "RABBITMQ_HOST")]
    pub host: String,

    #[serde(rename = "RABBITMQ_PORT")]
    pub port: u16,

    #[serde(rename = "RABBITMQ_USER")]
    pub user: String,

    #[serde(rename = "RABBITMQ_PASSWORD")]
    pub password: String,

    #[serde(default)]
    #[serde(rename = "RABBITMQ_VHOST")]
    pub vhost: Option<String>,

    #[serde(default = "default_prefetch_count")]
    #[serde(rename = "RABBITMQ_PREFETCH_COUNT")]
    pub prefetch_count: u16,

    #[serde(default = "default_connect_timeout_seconds")]
    #[serde(rename = "RABBITMQ_CONNECT_TIMEOUT_SECONDS")]
    pub connect_timeout_seconds: u64,

    #[serde(default = "default_rpc_timeout_seconds")]
    #[serde(rename = "RPC_TIMEOUT_SECONDS")]
    pub rpc_timeout_seconds: u64,
}

fn default_prefetch_count() -> u16 {
    10
}

fn default_connect_timeout_seconds() -> u64 {
    10
}

fn default_rpc_timeout_seconds() -> u64 {
    10
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    lookup(key).ok_or_else(|| anyhow!("{} is not set", key))
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(val) => val
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value '{}'", key, val)),
        None => Ok(default),
    }
}

/// Percent-encode everything outside the URI "unreserved" set.
fn encode_component(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

impl EnvConfig {
    /// Read `.env` if present, then the process environment.
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(EnvConfig {
            host: required(&lookup, "RABBITMQ_HOST")?,
            port: parsed(&lookup, "RABBITMQ_PORT", 5672)?,
            user: required(&lookup, "RABBITMQ_USER")?,
            password: required(&lookup, "RABBITMQ_PASSWORD")?,
            vhost: lookup("RABBITMQ_VHOST").filter(|vhost| !vhost.is_empty()),
            prefetch_count: parsed(&lookup, "RABBITMQ_PREFETCH_COUNT", default_prefetch_count())?,
            connect_timeout_seconds: parsed(
                &lookup,
                "RABBITMQ_CONNECT_TIMEOUT_SECONDS",
                default_connect_timeout_seconds(),
            )?,
            rpc_timeout_seconds: parsed(&lookup, "RPC_TIMEOUT_SECONDS", default_rpc_timeout_seconds())?,
        })
    }

    pub fn amqp_uri(&self) -> String {
        let mut uri = format!(
            "amqp://{}:{}@{}:{}",
            encode_component(&self.user),
            encode_component(&self.password),
            self.host,
            self.port
        );
        if let Some(vhost) = &self.vhost {
            uri.push('/');
            uri.push_str(&encode_component(vhost));
        }
        uri
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_seconds)
    }
}
