//! Initial migration: the first sync on a device seeds the store with a
//! bounded window of recent meals instead of the whole account history.

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::Serialize;

use crate::db::CursorUpdate;
use crate::models::{Collection, PullOutcome, format_millis};
use crate::remote::CursorField;
use crate::sync::SyncEngine;

#[derive(Debug, Clone, Default, Serialize)]
pub struct BootstrapReport {
    pub premium: bool,
    pub window_days: i64,
    /// Meals whose timestamp is at or after this instant were fetched.
    pub since: String,
    pub pages: usize,
    pub outcome: PullOutcome,
    /// True once the one-shot flag is persisted.
    pub completed: bool,
    pub error: Option<String>,
}

impl SyncEngine {
    /// Run the initial migration for `user_uid` unless it already ran on this
    /// store. The flag is only raised after every page has been applied, so
    /// an interrupted run starts over on the next pass.
    pub async fn run_initial_migration(&self, user_uid: &str) -> Result<BootstrapReport> {
        let already = self.store().is_bootstrapped(user_uid)?;
        if already {
            return Ok(BootstrapReport {
                completed: true,
                ..BootstrapReport::default()
            });
        }

        let premium = match self
            .with_timeout(self.remote.entitlements.is_premium(user_uid))
            .await
        {
            Ok(premium) => premium,
            Err(err) => {
                tracing::warn!(user = user_uid, error = %err, "entitlement lookup failed, using the free window");
                false
            }
        };
        let window_days = self.config.window_days(premium);
        let since = (Utc::now() - Duration::days(window_days))
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map_or(0, |start| start.and_utc().timestamp_millis());
        let since = format_millis(since);

        tracing::info!(user = user_uid, premium, window_days, %since, "initial migration started");
        let pull = self
            .pull_pages(
                Collection::Meals,
                user_uid,
                CursorField::Timestamp,
                &since,
                CursorUpdate::Hold,
            )
            .await?;

        let mut report = BootstrapReport {
            premium,
            window_days,
            since,
            pages: pull.pages,
            outcome: pull.outcome,
            completed: false,
            error: pull.error,
        };
        if report.error.is_some() {
            tracing::warn!(user = user_uid, "initial migration interrupted, will restart");
            return Ok(report);
        }

        // An empty window still leaves the cursor at its start.
        let cursor = report
            .outcome
            .max_updated_at
            .as_deref()
            .unwrap_or(report.since.as_str());
        self.store().complete_bootstrap(user_uid, Some(cursor))?;
        report.completed = true;
        tracing::info!(
            user = user_uid,
            meals = report.outcome.inserted + report.outcome.updated,
            "initial migration finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::config::SyncConfig;
    use crate::db::Database;
    use crate::error::RemoteError;
    use crate::memory::{MemoryRemote, RemoteCall};
    use crate::sync::{Collaborators, SyncOutcome};

    fn setup(remote: &Arc<MemoryRemote>) -> (SyncEngine, Arc<Mutex<Database>>) {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let engine = SyncEngine::new(
            db.clone(),
            Collaborators {
                documents: remote.clone(),
                files: remote.clone(),
                entitlements: remote.clone(),
                connectivity: remote.clone(),
            },
            SyncConfig {
                pull_page_size: 2,
                ..SyncConfig::default()
            },
        );
        (engine, db)
    }

    fn days_ago(days: i64) -> String {
        format_millis((Utc::now() - Duration::days(days)).timestamp_millis())
    }

    fn seed(remote: &MemoryRemote) {
        for (id, age) in [("d5", 5), ("d20", 20), ("d45", 45), ("d80", 80), ("d200", 200)] {
            let stamp = days_ago(age);
            remote.put_document(
                Collection::Meals,
                "u1",
                id,
                json!({"userUid": "u1", "type": "lunch", "timestamp": stamp, "updatedAt": stamp}),
            );
        }
    }

    #[tokio::test]
    async fn test_free_window_is_thirty_days() {
        let remote = Arc::new(MemoryRemote::new());
        seed(&remote);
        let (engine, db) = setup(&remote);

        let report = engine.run_initial_migration("u1").await.unwrap();
        assert!(report.completed);
        assert!(!report.premium);
        assert_eq!(report.window_days, 30);
        assert_eq!(report.outcome.inserted, 2);

        let db = db.lock().unwrap();
        assert!(db.is_bootstrapped("u1").unwrap());
        assert!(db.get_meal("d20").unwrap().is_some());
        assert!(db.get_meal("d45").unwrap().is_none());
        assert_eq!(
            db.pull_cursor("u1", Collection::Meals).unwrap(),
            report.outcome.max_updated_at
        );
    }

    #[tokio::test]
    async fn test_premium_window_is_ninety_days() {
        let remote = Arc::new(MemoryRemote::new());
        seed(&remote);
        remote.set_premium("u1", true);
        let (engine, db) = setup(&remote);

        let report = engine.run_initial_migration("u1").await.unwrap();
        assert!(report.premium);
        assert_eq!(report.outcome.inserted, 4);
        assert!(db.lock().unwrap().get_meal("d200").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_runs_only_once() {
        let remote = Arc::new(MemoryRemote::new());
        seed(&remote);
        let (engine, _db) = setup(&remote);

        engine.run_initial_migration("u1").await.unwrap();
        let calls = remote.call_count(RemoteCall::GetSince);
        let again = engine.run_initial_migration("u1").await.unwrap();
        assert!(again.completed);
        assert_eq!(remote.call_count(RemoteCall::GetSince), calls);
    }

    #[tokio::test]
    async fn test_interrupted_run_does_not_set_flag() {
        let remote = Arc::new(MemoryRemote::new());
        seed(&remote);
        remote.set_premium("u1", true);
        let (engine, db) = setup(&remote);
        remote.allow_next(RemoteCall::GetSince);
        remote.fail_next(RemoteCall::GetSince, RemoteError::Transient("reset".into()));

        let report = engine.run_initial_migration("u1").await.unwrap();
        assert!(!report.completed);
        assert_eq!(report.pages, 1);
        {
            let db = db.lock().unwrap();
            assert!(!db.is_bootstrapped("u1").unwrap());
            assert_eq!(db.pull_cursor("u1", Collection::Meals).unwrap(), None);
        }

        let resumed = engine.run_initial_migration("u1").await.unwrap();
        assert!(resumed.completed);
        assert_eq!(resumed.outcome.inserted, 2);
        assert_eq!(resumed.outcome.unchanged, 2);
    }

    #[tokio::test]
    async fn test_empty_window_keeps_older_history_remote() {
        let remote = Arc::new(MemoryRemote::new());
        let stamp = days_ago(400);
        remote.put_document(
            Collection::Meals,
            "u1",
            "d400",
            json!({"userUid": "u1", "type": "dinner", "timestamp": stamp, "updatedAt": stamp}),
        );
        let (engine, db) = setup(&remote);

        let report = match engine.sync_user("u1").await.unwrap() {
            SyncOutcome::Completed(report) => report,
            other => panic!("expected a completed pass, got {other:?}"),
        };
        let bootstrap = report.bootstrap.unwrap();
        assert!(bootstrap.completed);
        assert_eq!(bootstrap.outcome.inserted, 0);
        assert_eq!(report.meals.outcome.inserted, 0);

        let db = db.lock().unwrap();
        assert!(db.is_bootstrapped("u1").unwrap());
        assert!(db.get_meal("d400").unwrap().is_none());
        assert_eq!(
            db.pull_cursor("u1", Collection::Meals).unwrap().as_deref(),
            Some(bootstrap.since.as_str())
        );
    }

    #[tokio::test]
    async fn test_entitlement_failure_falls_back_to_free_window() {
        let remote = Arc::new(MemoryRemote::new());
        seed(&remote);
        remote.set_premium("u1", true);
        remote.fail_next(RemoteCall::IsPremium, RemoteError::Transient("503".into()));
        let (engine, _db) = setup(&remote);

        let report = engine.run_initial_migration("u1").await.unwrap();
        assert!(!report.premium);
        assert_eq!(report.outcome.inserted, 2);
    }
}
