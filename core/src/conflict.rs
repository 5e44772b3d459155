//! Last-writer-wins resolution between a local and a remote version of a record.

use crate::models::{MealRecord, SettingRecord, SurveyRecord, timestamp_millis};

/// A record version that carries a modification timestamp.
pub trait Versioned {
    fn version_stamp(&self) -> &str;
}

impl Versioned for MealRecord {
    fn version_stamp(&self) -> &str {
        &self.updated_at
    }
}

impl Versioned for SettingRecord {
    fn version_stamp(&self) -> &str {
        &self.last_updated
    }
}

impl Versioned for SurveyRecord {
    fn version_stamp(&self) -> &str {
        &self.completed_at
    }
}

impl Versioned for str {
    fn version_stamp(&self) -> &str {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Local is newer; the remote must be overwritten.
    KeepLocal,
    /// Remote is newer; the local copy must be overwritten.
    TakeRemote,
    /// Same timestamp on both sides, nothing to write.
    InSync,
}

/// Compare parsed timestamps. Missing or unparseable stamps count as the epoch.
#[must_use]
pub fn resolve<L, R>(local: &L, remote: &R) -> Resolution
where
    L: Versioned + ?Sized,
    R: Versioned + ?Sized,
{
    let local = timestamp_millis(local.version_stamp());
    let remote = timestamp_millis(remote.version_stamp());
    match local.cmp(&remote) {
        std::cmp::Ordering::Greater => Resolution::KeepLocal,
        std::cmp::Ordering::Less => Resolution::TakeRemote,
        std::cmp::Ordering::Equal => Resolution::InSync,
    }
}
