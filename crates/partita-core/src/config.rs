use std::str::FromStr;
use std::time::Duration;

use crate::error::{PdalError, PdalResult};
use crate::failover::ReadPreference;
use crate::logging::LogFormat;
use crate::model::Role;
use crate::store::Endpoint;

/// The stores backing one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub primary: Endpoint,
    pub replica: Option<Endpoint>,
}

/// Configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// One entry per partition; the length is the partition count.
    pub partitions: Vec<PartitionSpec>,

    /// Connections per pool (default: 5)
    pub pool_size: usize,

    /// How long an acquire may wait for a free connection (default: 5s)
    pub acquire_timeout: Duration,

    /// Connect and per-socket read/write timeout of store connections (default: 30s)
    pub store_timeout: Duration,

    /// Where reads go first (default: replica_first)
    pub read_preference: ReadPreference,

    /// Log output format (default: plain)
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> PdalResult<Self> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from any variable source.
    ///
    /// Recognized variables:
    ///
    /// | variable | default |
    /// |---|---|
    /// | `PARTITION_COUNT` | `2` |
    /// | `POOL_SIZE` | `5` |
    /// | `ACQUIRE_TIMEOUT_MS` | `5000` |
    /// | `STORE_TIMEOUT_MS` | `30000` |
    /// | `STORE_HOST` / `STORE_PORT` | `127.0.0.1` / `5432` |
    /// | `STORE_USER` / `STORE_PASSWORD` | `postgres` / empty |
    /// | `STORE_DATABASE` | `postgres` |
    /// | `REPLICA_HOST` / `REPLICA_PORT` | unset / `STORE_PORT` |
    /// | `PARTITION_<i>_PRIMARY_URL` | built from `STORE_*` |
    /// | `PARTITION_<i>_REPLICA_URL` | built from `REPLICA_*` |
    /// | `PARTITION_<i>_NAMESPACE` | `partition_<i>` |
    /// | `READ_PREFERENCE` | `replica_first` |
    /// | `LOG_FORMAT` | `plain` |
    pub fn from_lookup<F>(lookup: F) -> PdalResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let partition_count: u32 = parse_var(&lookup, "PARTITION_COUNT", 2)?;
        if partition_count == 0 {
            return Err(PdalError::Config("PARTITION_COUNT must be at least 1".to_string()));
        }
        let pool_size: usize = parse_var(&lookup, "POOL_SIZE", 5)?;
        if pool_size == 0 {
            return Err(PdalError::Config("POOL_SIZE must be at least 1".to_string()));
        }
        let acquire_timeout_ms: u64 = parse_var(&lookup, "ACQUIRE_TIMEOUT_MS", 5000)?;
        let store_timeout_ms: u64 = parse_var(&lookup, "STORE_TIMEOUT_MS", 30_000)?;
        if store_timeout_ms == 0 {
            // A zero socket timeout is rejected by the OS.
            return Err(PdalError::Config("STORE_TIMEOUT_MS must be at least 1".to_string()));
        }

        let host = lookup("STORE_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port: u16 = parse_var(&lookup, "STORE_PORT", 5432)?;
        let user = lookup("STORE_USER").unwrap_or_else(|| "postgres".to_string());
        let password = lookup("STORE_PASSWORD").unwrap_or_default();
        let database = lookup("STORE_DATABASE").unwrap_or_else(|| "postgres".to_string());
        let replica_host = lookup("REPLICA_HOST").filter(|h| !h.is_empty());
        let replica_port: u16 = parse_var(&lookup, "REPLICA_PORT", port)?;

        let mut partitions = Vec::with_capacity(partition_count as usize);
        for i in 0..partition_count {
            let namespace = lookup(&format!("PARTITION_{}_NAMESPACE", i))
                .unwrap_or_else(|| format!("partition_{}", i));

            let primary = match lookup(&format!("PARTITION_{}_PRIMARY_URL", i)) {
                Some(url) => Endpoint::from_url(Role::Primary, &url)?,
                None => Endpoint::new(Role::Primary, &host, port)
                    .with_credentials(&user, &password)
                    .with_database(&database),
            }
            .with_namespace(&namespace);

            let replica = match (lookup(&format!("PARTITION_{}_REPLICA_URL", i)), &replica_host) {
                (Some(url), _) => Some(Endpoint::from_url(Role::Replica, &url)?),
                (None, Some(replica_host)) => Some(
                    Endpoint::new(Role::Replica, replica_host, replica_port)
                        .with_credentials(&user, &password)
                        .with_database(&database),
                ),
                (None, None) => None,
            }
            .map(|replica| replica.with_namespace(&namespace));

            partitions.push(PartitionSpec { primary, replica });
        }

        Ok(Config {
            partitions,
            pool_size,
            acquire_timeout: Duration::from_millis(acquire_timeout_ms),
            store_timeout: Duration::from_millis(store_timeout_ms),
            read_preference: parse_var(&lookup, "READ_PREFERENCE", ReadPreference::default())?,
            log_format: parse_var(&lookup, "LOG_FORMAT", LogFormat::default())?,
        })
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    /// Whether any partition has a replica configured.
    pub fn has_replicas(&self) -> bool {
        self.partitions.iter().any(|p| p.replica.is_some())
    }
}

fn parse_var<T, F>(lookup: &F, name: &str, default: T) -> PdalResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| PdalError::Config(format!("{}={:?}: {}", name, raw, e))),
        _ => Ok(default),
    }
}
