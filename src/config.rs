//! Server configuration from `SYNC_*` environment variables.

use crate::coordinator::SyncLimits;
use crate::diagnostics;
use crate::rate_limit::RateLimitConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
pub const DEFAULT_DB_CONNECTIONS: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: expected {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub db_connections: usize,
    pub limits: SyncLimits,
    pub rate_limit: RateLimitConfig,
    pub gateway_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8787)),
            log_dir: diagnostics::default_log_dir(&data_dir),
            data_dir,
            db_connections: DEFAULT_DB_CONNECTIONS,
            limits: SyncLimits::default(),
            rate_limit: RateLimitConfig::default(),
            gateway_secret: None,
        }
    }
}

impl ServerConfig {
    /// Read the process environment. Unset variables keep their defaults;
    /// set but unparsable ones are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| get(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(raw) = get("SYNC_BIND_ADDR") {
            config.bind_addr = raw.parse().map_err(|_| ConfigError::Invalid {
                var: "SYNC_BIND_ADDR",
                expected: "host:port",
                value: raw.clone(),
            })?;
        }
        if let Some(dir) = get("SYNC_DATA_DIR") {
            config = config.with_data_dir(dir);
        }
        if let Some(dir) = get("SYNC_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }

        config.db_connections = positive(&get, "SYNC_DB_CONNECTIONS", config.db_connections)?;
        config.limits.max_batch = positive(&get, "SYNC_MAX_BATCH", config.limits.max_batch)?;
        config.limits.max_children =
            positive(&get, "SYNC_MAX_CHILDREN", config.limits.max_children)?;
        config.limits.verify_max_ids =
            positive(&get, "SYNC_VERIFY_MAX_IDS", config.limits.verify_max_ids)?;

        let rl = &mut config.rate_limit;
        rl.max_calls = positive(&get, "SYNC_RATE_LIMIT_MAX", rl.max_calls as usize)? as u32;
        rl.window = Duration::from_secs(positive(
            &get,
            "SYNC_RATE_LIMIT_WINDOW_SECS",
            rl.window.as_secs() as usize,
        )? as u64);
        rl.lockout = Duration::from_secs(positive(
            &get,
            "SYNC_RATE_LIMIT_LOCKOUT_SECS",
            rl.lockout.as_secs() as usize,
        )? as u64);

        config.gateway_secret = get("SYNC_GATEWAY_SECRET");
        Ok(config)
    }

    /// Also moves the log directory when it still points at the old default.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if self.log_dir == diagnostics::default_log_dir(&self.data_dir) {
            self.log_dir = diagnostics::default_log_dir(&dir);
        }
        self.data_dir = dir;
        self
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_limits(mut self, limits: SyncLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_gateway_secret(mut self, secret: impl Into<String>) -> Self {
        self.gateway_secret = Some(secret.into());
        self
    }
}

fn positive(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: usize,
) -> Result<usize, ConfigError> {
    match get(var) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0 && *n <= u32::MAX as usize)
            .ok_or(ConfigError::Invalid {
                var,
                expected: "a positive integer",
                value: raw,
            }),
    }
}

/// `$XDG_DATA_HOME/the-small-sync`, falling back to `~/.local/share` and
/// finally the working directory.
fn default_data_dir() -> PathBuf {
    let base = std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(".local").join("share"))
        })
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("the-small-sync")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.db_connections, DEFAULT_DB_CONNECTIONS);
        assert_eq!(config.limits.max_batch, 200);
        assert_eq!(config.limits.max_children, 500);
        assert_eq!(config.limits.verify_max_ids, 500);
        assert_eq!(config.rate_limit, RateLimitConfig::default());
        assert!(config.gateway_secret.is_none());
        assert_eq!(config.log_dir, config.data_dir.join("logs"));
    }

    #[test]
    fn overrides_are_applied() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("SYNC_BIND_ADDR", "0.0.0.0:9000"),
            ("SYNC_DATA_DIR", "/srv/sync"),
            ("SYNC_MAX_BATCH", "50"),
            ("SYNC_RATE_LIMIT_WINDOW_SECS", "30"),
            ("SYNC_GATEWAY_SECRET", "s3cret"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.data_dir, PathBuf::from("/srv/sync"));
        assert_eq!(config.log_dir, PathBuf::from("/srv/sync/logs"));
        assert_eq!(config.limits.max_batch, 50);
        assert_eq!(config.rate_limit.window, Duration::from_secs(30));
        assert_eq!(config.gateway_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn explicit_log_dir_survives_data_dir() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("SYNC_LOG_DIR", "/var/log/sync"),
            ("SYNC_DATA_DIR", "/srv/sync"),
        ]))
        .unwrap();
        assert_eq!(config.log_dir, PathBuf::from("/var/log/sync"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = ServerConfig::from_lookup(lookup(&[("SYNC_MAX_BATCH", "0")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: "SYNC_MAX_BATCH",
                expected: "a positive integer",
                value: "0".into(),
            }
        );
        assert!(ServerConfig::from_lookup(lookup(&[("SYNC_BIND_ADDR", "nope")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("SYNC_DB_CONNECTIONS", "-2")])).is_err());
    }

    #[test]
    #[serial]
    fn reads_process_environment() {
        std::env::set_var("SYNC_VERIFY_MAX_IDS", "25");
        std::env::set_var("SYNC_GATEWAY_SECRET", "   ");
        let config = ServerConfig::from_env();
        std::env::remove_var("SYNC_VERIFY_MAX_IDS");
        std::env::remove_var("SYNC_GATEWAY_SECRET");

        let config = config.unwrap();
        assert_eq!(config.limits.verify_max_ids, 25);
        assert!(config.gateway_secret.is_none());
    }
}
