//! Environment-driven configuration.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `DATABASE_URL` | none | Postgres connection string |
//! | `ATTACHE_STORAGE_ROOT` | `./storage` | Filesystem content store root |
//! | `ATTACHE_SIGNING_SECRET` | required | HMAC key for signed IDs |
//! | `ATTACHE_SIGNED_ID_TTL_SECS` | none | Expiry for issued signed IDs |
//! | `ATTACHE_SWEEP_MIN_AGE_HOURS` | `48` | Minimum age for orphan sweeping |

use std::path::PathBuf;

use chrono::Duration;
use tracing::debug;

use crate::defaults::{STORAGE_ROOT, SWEEP_MIN_AGE_HOURS};
use crate::error::{Error, Result};
use crate::signed_id::SignedIdCodec;

/// Process-level configuration.
#[derive(Debug, Clone)]
pub struct AttacheConfig {
    pub database_url: Option<String>,
    pub storage_root: PathBuf,
    pub signing_secret: String,
    pub signed_id_ttl: Option<Duration>,
    pub sweep_min_age: Duration,
}

impl AttacheConfig {
    /// Create a config with defaults and the given signing secret.
    pub fn new(signing_secret: impl Into<String>) -> Self {
        Self {
            database_url: None,
            storage_root: PathBuf::from(STORAGE_ROOT),
            signing_secret: signing_secret.into(),
            signed_id_ttl: None,
            sweep_min_age: Duration::hours(SWEEP_MIN_AGE_HOURS),
        }
    }

    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let signing_secret = lookup("ATTACHE_SIGNING_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Config("ATTACHE_SIGNING_SECRET is not set".into()))?;

        let mut config = Self::new(signing_secret);
        config.database_url = lookup("DATABASE_URL").filter(|s| !s.is_empty());

        if let Some(root) = lookup("ATTACHE_STORAGE_ROOT").filter(|s| !s.is_empty()) {
            config.storage_root = PathBuf::from(root);
        }

        if let Some(raw) = lookup("ATTACHE_SIGNED_ID_TTL_SECS") {
            let secs = raw.parse::<i64>().map_err(|_| {
                Error::Config(format!("ATTACHE_SIGNED_ID_TTL_SECS is not a number: {}", raw))
            })?;
            config.signed_id_ttl = (secs > 0).then(|| Duration::seconds(secs));
        }

        if let Some(raw) = lookup("ATTACHE_SWEEP_MIN_AGE_HOURS") {
            let hours = raw.parse::<i64>().map_err(|_| {
                Error::Config(format!("ATTACHE_SWEEP_MIN_AGE_HOURS is not a number: {}", raw))
            })?;
            config.sweep_min_age = Duration::hours(hours.max(0));
        }

        debug!(
            subsystem = "config",
            storage_root = %config.storage_root.display(),
            has_database = config.database_url.is_some(),
            signed_id_ttl_secs = config.signed_id_ttl.map(|d| d.num_seconds()),
            "Loaded attache configuration"
        );
        Ok(config)
    }

    /// Build the signed-ID codec this configuration describes.
    pub fn signed_id_codec(&self) -> Result<SignedIdCodec> {
        Ok(SignedIdCodec::new(&self.signing_secret)?.with_default_ttl(self.signed_id_ttl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_secret_is_config_error() {
        let err = AttacheConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_defaults() {
        let config = AttacheConfig::from_lookup(lookup(&[("ATTACHE_SIGNING_SECRET", "s3cret")]))
            .unwrap();
        assert_eq!(config.storage_root, PathBuf::from(STORAGE_ROOT));
        assert!(config.database_url.is_none());
        assert!(config.signed_id_ttl.is_none());
        assert_eq!(config.sweep_min_age, Duration::hours(SWEEP_MIN_AGE_HOURS));
    }

    #[test]
    fn test_overrides() {
        let config = AttacheConfig::from_lookup(lookup(&[
            ("ATTACHE_SIGNING_SECRET", "s3cret"),
            ("DATABASE_URL", "postgres://localhost/attache"),
            ("ATTACHE_STORAGE_ROOT", "/var/attache"),
            ("ATTACHE_SIGNED_ID_TTL_SECS", "300"),
            ("ATTACHE_SWEEP_MIN_AGE_HOURS", "6"),
        ]))
        .unwrap();
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/attache"));
        assert_eq!(config.storage_root, PathBuf::from("/var/attache"));
        assert_eq!(config.signed_id_ttl, Some(Duration::seconds(300)));
        assert_eq!(config.sweep_min_age, Duration::hours(6));
    }

    #[test]
    fn test_bad_number_is_config_error() {
        let err = AttacheConfig::from_lookup(lookup(&[
            ("ATTACHE_SIGNING_SECRET", "s3cret"),
            ("ATTACHE_SIGNED_ID_TTL_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("ATTACHE_SIGNED_ID_TTL_SECS"));
    }

    #[test]
    fn test_codec_from_config() {
        let config = AttacheConfig::new("s3cret");
        let codec = config.signed_id_codec().unwrap();
        let id = uuid::Uuid::now_v7();
        assert_eq!(codec.decode(&codec.encode(id)).unwrap(), id);
    }
}
