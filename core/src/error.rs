use std::time::Duration;

use thiserror::Error;

/// Failure reported by a remote collaborator (document store, file store,
/// entitlement lookup).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// No network; the attempt was never made.
    #[error("network unavailable")]
    Offline,

    /// The call did not finish within the configured bound.
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    /// Connectivity loss, 5xx, throttling. Worth retrying.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// The remote refused the payload. Retrying the same payload cannot succeed.
    #[error("remote rejected the request: {0}")]
    Rejected(String),
}

impl RemoteError {
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// A schema migration step failed and was rolled back.
///
/// The store stays at the last committed version; callers of
/// [`crate::db::Database::open`] can `downcast_ref::<MigrationError>()` to
/// refuse to run on a half-migrated store.
#[derive(Debug, Error)]
#[error("schema migration to v{version} ({name}) failed: {source}")]
pub struct MigrationError {
    pub version: u32,
    pub name: &'static str,
    #[source]
    pub source: rusqlite::Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_rejection_is_permanent() {
        assert!(RemoteError::Rejected("bad payload".into()).is_permanent());
        assert!(!RemoteError::Offline.is_permanent());
        assert!(!RemoteError::Timeout(Duration::from_secs(1)).is_permanent());
        assert!(!RemoteError::Transient("503".into()).is_permanent());
    }
}
