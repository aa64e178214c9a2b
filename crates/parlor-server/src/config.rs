use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use parlor_crypto::SharedKey;
use parlor_gateway::DEFAULT_HISTORY_LIMIT;

pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub key: SharedKey,
    /// True when no key was configured and one was made up for this run.
    pub key_generated: bool,
    pub history_limit: u32,
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Unset and empty are treated alike.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let (key, key_generated) = match var("PARLOR_SHARED_KEY") {
            Some(encoded) => (
                SharedKey::from_base64(&encoded).context("PARLOR_SHARED_KEY is not a valid key")?,
                false,
            ),
            None => (SharedKey::generate(), true),
        };

        Ok(Self {
            host: var("PARLOR_HOST").unwrap_or_else(|| "127.0.0.1".into()),
            port: parse_or(var("PARLOR_PORT"), "PARLOR_PORT", 12345)?,
            db_path: var("PARLOR_DB_PATH").unwrap_or_else(|| "parlor.db".into()).into(),
            key,
            key_generated,
            history_limit: parse_or(var("PARLOR_HISTORY_LIMIT"), "PARLOR_HISTORY_LIMIT", DEFAULT_HISTORY_LIMIT)?,
            shutdown_grace: Duration::from_secs(parse_or(
                var("PARLOR_SHUTDOWN_GRACE_SECS"),
                "PARLOR_SHUTDOWN_GRACE_SECS",
                5,
            )?),
        })
    }
}

impl Config {
    /// Bind the listening socket. The host may be a name (`localhost`) or a
    /// bare IPv4/IPv6 address.
    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("cannot bind {} port {}", self.host, self.port))
    }
}

fn parse_or<T>(value: Option<String>, name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a number, got {:?}", name, raw)),
        None => Ok(default),
    }
}
