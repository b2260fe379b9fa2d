//! Sync configuration
//!
//! All tunables of the sync pipeline live in [`SyncConfig`]. Every field has a
//! default, so a config file only needs to name what it overrides:
//!
//! ```json
//! { "max_backfill": 500, "poll_interval_secs": 10, "default_minimum": "0.010 HBD" }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::types::Amount;

/// Tunables for one [`SyncEngine`](crate::SyncEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Largest backfill before older operations are skipped
    pub max_backfill: u64,
    /// Operations requested per ledger call (one batch)
    pub page_limit: u32,
    /// Live-tail polling interval
    pub poll_interval_secs: u64,
    /// Threshold applied until the recipient's own minimum is known
    #[serde(with = "amount_string")]
    pub default_minimum: Amount,
    /// How long a fetched minimum stays fresh
    pub minimum_ttl_secs: u64,
    /// How long to wait for the key holder before treating it as unavailable
    pub decrypt_timeout_secs: u64,
    /// Evict incomplete chunk sets older than this; never when unset
    pub chunk_eviction_after_secs: Option<u64>,
    /// Longest memo that fits in one transfer
    pub max_memo_len: usize,
    /// Window for the `trending` discovery ranking
    pub trending_window_days: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_backfill: 1000,
            page_limit: 100,
            poll_interval_secs: 5,
            default_minimum: Amount::hbd_milli(1),
            minimum_ttl_secs: 600,
            decrypt_timeout_secs: 30,
            chunk_eviction_after_secs: None,
            max_memo_len: 2000,
            trending_window_days: 7,
        }
    }
}

impl SyncConfig {
    /// Load a config from a JSON file and validate it.
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: SyncConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot work with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.page_limit == 0 {
            return Err(SyncError::Config("page_limit must be positive".into()));
        }
        if self.max_backfill == 0 {
            return Err(SyncError::Config("max_backfill must be positive".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(SyncError::Config("poll_interval_secs must be positive".into()));
        }
        // Room for the chunk header plus at least one payload character.
        if self.max_memo_len < 64 {
            return Err(SyncError::Config("max_memo_len must be at least 64".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn minimum_ttl(&self) -> Duration {
        Duration::from_secs(self.minimum_ttl_secs)
    }

    pub fn decrypt_timeout(&self) -> Duration {
        Duration::from_secs(self.decrypt_timeout_secs)
    }

    pub fn chunk_eviction_after(&self) -> Option<Duration> {
        self.chunk_eviction_after_secs.map(Duration::from_secs)
    }

    pub fn trending_window_millis(&self) -> i64 {
        i64::from(self.trending_window_days) * 24 * 60 * 60 * 1000
    }
}

/// Amounts are written the way the ledger writes them ("0.001 HBD").
mod amount_string {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::types::Amount;

    pub fn serialize<S: Serializer>(amount: &Amount, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Amount, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
