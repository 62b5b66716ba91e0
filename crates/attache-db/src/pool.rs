//! Connection pool construction and health logging.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `ATTACHE_DB_MAX_CONNECTIONS` | `10` | Upper bound on open connections |
//! | `ATTACHE_DB_MIN_CONNECTIONS` | `1` | Connections kept open while idle |
//! | `ATTACHE_DB_ACQUIRE_TIMEOUT_SECS` | `30` | Wait for a free connection |

use std::str::FromStr;
use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use attache_core::defaults::{
    POOL_ACQUIRE_TIMEOUT_SECS, POOL_IDLE_TIMEOUT_SECS, POOL_MAX_CONNECTIONS,
    POOL_MAX_LIFETIME_SECS, POOL_MIN_CONNECTIONS,
};
use attache_core::{Error, Result};

/// Sizing and timeouts for the shared Postgres pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: POOL_MAX_CONNECTIONS,
            min_connections: POOL_MIN_CONNECTIONS,
            acquire_timeout: Duration::from_secs(POOL_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(POOL_IDLE_TIMEOUT_SECS),
            max_lifetime: Duration::from_secs(POOL_MAX_LIFETIME_SECS),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read pool settings through an arbitrary lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(n) = parse_var(&lookup, "ATTACHE_DB_MAX_CONNECTIONS")? {
            config.max_connections = n;
        }
        if let Some(n) = parse_var(&lookup, "ATTACHE_DB_MIN_CONNECTIONS")? {
            config.min_connections = n;
        }
        if let Some(secs) = parse_var(&lookup, "ATTACHE_DB_ACQUIRE_TIMEOUT_SECS")? {
            config.acquire_timeout = Duration::from_secs(secs);
        }

        if config.max_connections == 0 {
            return Err(Error::Config("ATTACHE_DB_MAX_CONNECTIONS must be at least 1".into()));
        }
        if config.min_connections > config.max_connections {
            return Err(Error::Config(format!(
                "ATTACHE_DB_MIN_CONNECTIONS ({}) exceeds ATTACHE_DB_MAX_CONNECTIONS ({})",
                config.min_connections, config.max_connections
            )));
        }
        Ok(config)
    }

    fn options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(self.idle_timeout)
            .max_lifetime(self.max_lifetime)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key).filter(|raw| !raw.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} is not a number: {}", key, raw))),
    }
}

/// Create a PostgreSQL pool with default configuration.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    create_pool_with_config(database_url, PoolConfig::default()).await
}

/// Create a PostgreSQL pool with custom configuration.
pub async fn create_pool_with_config(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let start = Instant::now();
    let pool = config
        .options()
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "database",
        component = "pool",
        op = "connect",
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        pool_size = pool.size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Database pool ready"
    );
    Ok(pool)
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolMetrics {
    pub size: u32,
    pub idle: usize,
}

impl PoolMetrics {
    /// Connections currently checked out.
    pub fn in_use(&self) -> usize {
        (self.size as usize).saturating_sub(self.idle)
    }

    /// Every open connection is checked out.
    pub fn saturated(&self) -> bool {
        self.size > 0 && self.idle == 0
    }
}

pub fn pool_metrics(pool: &PgPool) -> PoolMetrics {
    PoolMetrics {
        size: pool.size(),
        idle: pool.num_idle(),
    }
}

/// Log pool occupancy; warns when no connection is idle.
pub fn log_pool_metrics(pool: &PgPool) -> PoolMetrics {
    let metrics = pool_metrics(pool);
    debug!(
        subsystem = "database",
        component = "pool",
        pool_size = metrics.size,
        pool_idle = metrics.idle,
        pool_in_use = metrics.in_use(),
        "Pool metrics"
    );
    if metrics.saturated() {
        warn!(
            subsystem = "database",
            component = "pool",
            pool_size = metrics.size,
            "No idle database connections"
        );
    }
    metrics
}
