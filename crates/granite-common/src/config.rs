//! Configuration types for Granite

use crate::types::IsolationLevel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for the transactional core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Unique node identifier
    pub node_id: u64,

    /// Transaction manager configuration
    pub txn: TxnConfig,

    /// Online schema change configuration
    pub ddl: DdlConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            txn: TxnConfig::default(),
            ddl: DdlConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Validate the configuration and return any errors.
    /// Fatal errors are returned as `Err(Vec<String>)`.
    /// Warnings are logged but do not cause failure.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.txn.max_active_txns == 0 {
            errors.push("txn.max_active_txns must be > 0".to_string());
        }
        if self.txn.lock_timeout.is_zero() {
            errors.push("txn.lock_timeout must be > 0".to_string());
        }
        if self.ddl.drain_initial_backoff.is_zero() {
            errors.push("ddl.drain_initial_backoff must be > 0".to_string());
        }
        if self.ddl.drain_initial_backoff > self.ddl.drain_max_wait {
            errors.push(format!(
                "ddl.drain_initial_backoff ({:?}) exceeds ddl.drain_max_wait ({:?})",
                self.ddl.drain_initial_backoff, self.ddl.drain_max_wait
            ));
        }
        if self.ddl.notify_timeout.is_zero() {
            errors.push("ddl.notify_timeout must be > 0".to_string());
        }

        // Warnings (logged but not fatal)
        if self.ddl.drain_max_wait > Duration::from_secs(600) {
            tracing::warn!(
                "ddl.drain_max_wait {:?} is very long; schema changes may hold barriers for minutes",
                self.ddl.drain_max_wait
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Transaction manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnConfig {
    /// Hard cap on concurrently active transactions
    #[serde(default = "default_max_active_txns")]
    pub max_active_txns: usize,

    /// Isolation level assumed when a caller does not request one
    #[serde(default)]
    pub default_isolation: IsolationLevel,

    /// How long a lock request waits before giving up
    #[serde(default = "default_lock_timeout", with = "humantime_serde")]
    pub lock_timeout: Duration,
}

fn default_max_active_txns() -> usize {
    10_000
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            max_active_txns: default_max_active_txns(),
            default_isolation: IsolationLevel::default(),
            lock_timeout: default_lock_timeout(),
        }
    }
}

/// Online schema change configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdlConfig {
    /// First sleep of the drain loop; doubles on every retry
    #[serde(default = "default_drain_initial_backoff", with = "humantime_serde")]
    pub drain_initial_backoff: Duration,

    /// Total budget a schema change may spend waiting for writers to drain
    #[serde(default = "default_drain_max_wait", with = "humantime_serde")]
    pub drain_max_wait: Duration,

    /// How long a blocking metadata notification waits for cluster acks
    #[serde(default = "default_notify_timeout", with = "humantime_serde")]
    pub notify_timeout: Duration,
}

fn default_drain_initial_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_drain_max_wait() -> Duration {
    Duration::from_secs(30)
}

fn default_notify_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for DdlConfig {
    fn default() -> Self {
        Self {
            drain_initial_backoff: default_drain_initial_backoff(),
            drain_max_wait: default_drain_max_wait(),
            notify_timeout: default_notify_timeout(),
        }
    }
}

/// Duration serialization helper
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        s.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
