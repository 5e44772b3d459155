use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the sync engine. Durations are (de)serialized as whole seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub pull_page_size: usize,
    pub push_batch_size: usize,
    #[serde(with = "secs")]
    pub remote_timeout: Duration,
    /// Attempts after which a queue entry is abandoned and flagged.
    pub max_attempts: i64,
    #[serde(with = "secs")]
    pub backoff_base: Duration,
    #[serde(with = "secs")]
    pub backoff_max: Duration,
    pub premium_window_days: i64,
    pub free_window_days: i64,
    #[serde(with = "secs")]
    pub sync_interval: Duration,
    pub delete_local_photo_after_upload: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            pull_page_size: 300,
            push_batch_size: 25,
            remote_timeout: Duration::from_secs(15),
            max_attempts: 8,
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(60 * 60),
            premium_window_days: 90,
            free_window_days: 30,
            sync_interval: Duration::from_secs(5 * 60),
            delete_local_photo_after_upload: false,
        }
    }
}

impl SyncConfig {
    /// Delay before retry number `attempts` (1-based): `base * 2^(attempts-1)`, capped.
    #[must_use]
    pub fn backoff(&self, attempts: i64) -> Duration {
        let exponent = u32::try_from(attempts.saturating_sub(1).clamp(0, 30)).unwrap_or(30);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .map_or(self.backoff_max, |d| d.min(self.backoff_max))
    }

    #[must_use]
    pub fn window_days(&self, premium: bool) -> i64 {
        if premium {
            self.premium_window_days
        } else {
            self.free_window_days
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
