use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SinkError;

/// Top-level configuration file shape, loaded from YAML with `${NAME}`
/// environment substitution (§6, mirroring the original's
/// `newConnectorConfigFromPath`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(rename = "mongodb")]
    pub mongodb: MongoDbConfig,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_metrics_port() -> u16 {
    9090
}

/// Connection details for the stand-in upstream message bus (§10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub nats_url: String,
    pub subject: String,
    pub stream_name: String,
    pub consumer_name: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            nats_url: "nats://localhost:4222".to_string(),
            subject: "dcp.>".to_string(),
            stream_name: "DCP".to_string(),
            consumer_name: "dcp-mongodb-sink".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MongoDbConfig {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(rename = "connectionPool", default)]
    pub connection_pool: ConnectionPoolConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(rename = "collectionMapping", default)]
    pub collection_mapping: Option<HashMap<String, String>>,
    #[serde(rename = "shardKeys", default)]
    pub shard_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(rename = "tickerDuration", with = "humantime_duration", default)]
    pub ticker_duration: Option<Duration>,
    #[serde(rename = "sizeLimit", default)]
    pub size_limit: Option<usize>,
    #[serde(rename = "byteSizeLimit", default)]
    pub byte_size_limit: Option<ByteSize>,
    #[serde(rename = "concurrentRequest", default)]
    pub concurrent_request: Option<usize>,
    #[serde(rename = "commitTickerDuration", with = "humantime_duration", default)]
    pub commit_ticker_duration: Option<Duration>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            ticker_duration: None,
            size_limit: None,
            byte_size_limit: None,
            concurrent_request: None,
            commit_ticker_duration: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPoolConfig {
    #[serde(rename = "maxPoolSize", default)]
    pub max_pool_size: Option<u32>,
    #[serde(rename = "minPoolSize", default)]
    pub min_pool_size: Option<u32>,
    #[serde(rename = "maxIdleTimeMS", default)]
    pub max_idle_time_ms: Option<u64>,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: None,
            min_pool_size: None,
            max_idle_time_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(rename = "connectTimeoutMS", default)]
    pub connect_timeout_ms: Option<u64>,
    #[serde(rename = "serverSelectionTimeoutMS", default)]
    pub server_selection_timeout_ms: Option<u64>,
    #[serde(rename = "socketTimeoutMS", default)]
    pub socket_timeout_ms: Option<u64>,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: None,
            server_selection_timeout_ms: None,
            socket_timeout_ms: None,
        }
    }
}

/// Resolves `"10mb"`-style unit suffixes (`kb`/`mb`/`gb`, case-insensitive)
/// or a bare integer, mirroring the original's
/// `helpers.ResolveUnionIntOrStringValue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ByteSizeRepr", into = "ByteSizeRepr")]
pub struct ByteSize(pub usize);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ByteSizeRepr {
    Int(usize),
    Str(String),
}

impl TryFrom<ByteSizeRepr> for ByteSize {
    type Error = String;

    fn try_from(value: ByteSizeRepr) -> Result<Self, Self::Error> {
        match value {
            ByteSizeRepr::Int(n) => Ok(ByteSize(n)),
            ByteSizeRepr::Str(s) => parse_byte_size(&s).ok_or_else(|| format!("invalid byte size: {s}")),
        }
    }
}

impl From<ByteSize> for ByteSizeRepr {
    fn from(value: ByteSize) -> Self {
        ByteSizeRepr::Int(value.0)
    }
}

fn parse_byte_size(raw: &str) -> Option<ByteSize> {
    let trimmed = raw.trim().to_ascii_lowercase();
    if let Ok(n) = trimmed.parse::<usize>() {
        return Some(ByteSize(n));
    }

    let (number_part, multiplier) = if let Some(n) = trimmed.strip_suffix("gb") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = trimmed.strip_suffix("mb") {
        (n, 1024 * 1024)
    } else if let Some(n) = trimmed.strip_suffix("kb") {
        (n, 1024)
    } else if let Some(n) = trimmed.strip_suffix('b') {
        (n, 1)
    } else {
        return None;
    };

    number_part.trim().parse::<usize>().ok().map(|n| ByteSize(n * multiplier))
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => format!("{}s", d.as_secs()).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(s) => humantime::parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

impl Config {
    /// Loads a config file, substituting `${NAME}` environment references in
    /// the raw text before parsing — exactly the original's two-pass
    /// unmarshal-then-substitute-then-unmarshal-again sequence, except the
    /// substitution happens once since Rust gives us the raw text up front.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let substituted = interpolate_env(&raw);

        let mut config: Config = serde_yaml::from_str(&substituted)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;

        config.apply_defaults();
        config.validate().map_err(|err| anyhow::anyhow!(err))?;
        Ok(config)
    }

    pub fn apply_defaults(&mut self) {
        let batch = &mut self.mongodb.batch;
        batch.ticker_duration.get_or_insert(Duration::from_secs(10));
        batch.size_limit.get_or_insert(1000);
        batch.byte_size_limit.get_or_insert(ByteSize(10 * 1024 * 1024));
        batch.concurrent_request.get_or_insert(1);

        let pool = &mut self.mongodb.connection_pool;
        pool.max_pool_size.get_or_insert(100);
        pool.min_pool_size.get_or_insert(5);
        pool.max_idle_time_ms.get_or_insert(300_000);

        let timeouts = &mut self.mongodb.timeouts;
        timeouts.connect_timeout_ms.get_or_insert(10_000);
        timeouts.server_selection_timeout_ms.get_or_insert(30_000);
        timeouts.socket_timeout_ms.get_or_insert(30_000);
    }

    pub fn validate(&self) -> Result<(), String> {
        self.mongodb
            .validate()
            .map_err(|err| format!("mongodb config validation failed: {err}"))
    }

    /// Resolves the per-source-collection routing table plus a fallback used
    /// when a source collection has no entry in it. A `collection`-only
    /// config (no `collectionMapping`) routes every event to that one
    /// collection via the fallback, with an empty table (§6).
    pub fn resolved_collection_mapping(
        &self,
    ) -> Result<(HashMap<String, String>, Option<String>), SinkError> {
        let mapping = self.mongodb.collection_mapping.clone().unwrap_or_default();
        let default_collection = self.mongodb.collection.clone();

        if mapping.is_empty() && default_collection.is_none() {
            return Err(SinkError::Config(
                "at least one of mongodb.collection or mongodb.collectionMapping is required".to_string(),
            ));
        }

        Ok((mapping, default_collection))
    }
}

impl MongoDbConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.connection
            .validate()
            .map_err(|err| format!("connection validation failed: {err}"))?;
        self.connection_pool
            .validate()
            .map_err(|err| format!("connection pool validation failed: {err}"))?;

        let mapping_is_empty = match &self.collection_mapping {
            None => self.collection.is_none(),
            Some(m) => m.is_empty() && self.collection.is_none(),
        };
        if mapping_is_empty {
            return Err("collectionMapping is required when collection is not set".to_string());
        }

        Ok(())
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if is_empty(&self.uri) {
            return Err("uri is required".to_string());
        }
        if is_empty(&self.database) {
            return Err("database is required".to_string());
        }
        if self.username.is_some() != self.password.is_some() {
            return Err("username and password must be provided together".to_string());
        }
        Ok(())
    }
}

impl ConnectionPoolConfig {
    pub fn validate(&self) -> Result<(), String> {
        if let (Some(max), Some(min)) = (self.max_pool_size, self.min_pool_size) {
            if min > max {
                return Err(format!(
                    "minPoolSize ({min}) cannot be greater than maxPoolSize ({max})"
                ));
            }
        }
        Ok(())
    }
}

fn is_empty(s: &str) -> bool {
    s.trim().is_empty()
}

impl BatchConfig {
    pub fn ticker_duration(&self) -> Duration {
        self.ticker_duration.unwrap_or(Duration::from_secs(10))
    }

    pub fn size_limit(&self) -> usize {
        self.size_limit.unwrap_or(1000)
    }

    pub fn byte_size_limit(&self) -> usize {
        self.byte_size_limit.unwrap_or(ByteSize(10 * 1024 * 1024)).0
    }

    pub fn concurrent_request(&self) -> usize {
        self.concurrent_request.unwrap_or(1)
    }

    pub fn commit_ticker_duration(&self) -> Option<Duration> {
        self.commit_ticker_duration
    }
}

impl ConnectionPoolConfig {
    pub fn max_pool_size(&self) -> u32 {
        self.max_pool_size.unwrap_or(100)
    }

    pub fn min_pool_size(&self) -> u32 {
        self.min_pool_size.unwrap_or(5)
    }

    pub fn max_idle_time_ms(&self) -> u64 {
        self.max_idle_time_ms.unwrap_or(300_000)
    }
}

impl TimeoutsConfig {
    pub fn connect_timeout_ms(&self) -> u64 {
        self.connect_timeout_ms.unwrap_or(10_000)
    }

    pub fn server_selection_timeout_ms(&self) -> u64 {
        self.server_selection_timeout_ms.unwrap_or(30_000)
    }

    pub fn socket_timeout_ms(&self) -> u64 {
        self.socket_timeout_ms.unwrap_or(30_000)
    }
}

/// Substitutes `${NAME}` references with the corresponding environment
/// variable, leaving unresolved names untouched — identical behaviour to
/// the original's `regexp.MustCompile(\`\${([^}]+)}\`)` pass.
fn interpolate_env(raw: &str) -> String {
    let pattern = Regex::new(r"\$\{([^}]+)\}").expect("static regex is valid");
    pattern
        .replace_all(raw, |caps: &regex::Captures| {
            let name = &caps[1];
            std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}
