//! Configuration for the locking and transaction layers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::concurrency::DEFAULT_WAIT_TIMEOUT;
use crate::transaction::IsolationLevel;

/// Lock timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    /// Budget for a mode-based grant. `None` blocks until granted.
    pub acquire_timeout_ms: Option<u64>,
    /// Budget for a queue-position wait.
    pub wait_timeout_ms: u64,
}

impl LockingConfig {
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: None,
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Level used by [`Database::begin_default`](crate::database::Database::begin_default).
    pub default_isolation: IsolationLevel,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            default_isolation: IsolationLevel::Serializable,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub locking: LockingConfig,
    pub transaction: TransactionConfig,
}
