//! Sync engine: push the op queue, pull remote changes, reconcile.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use crate::bootstrap::BootstrapReport;
use crate::config::SyncConfig;
use crate::conflict::{Resolution, resolve};
use crate::db::{CursorUpdate, Database};
use crate::error::RemoteError;
use crate::models::{
    Collection, MealRecord, OpKind, OpQueueEntry, OpStatus, PullOutcome, RemoteRecord,
    SettingRecord, SurveyRecord, SyncState, now_iso, parse_object,
};
use crate::photos::PhotoReport;
use crate::remote::{
    Connectivity, CursorField, Entitlements, FileStore, PullQuery, RemoteDocument,
    RemoteDocumentStore, RemoteResult,
};

/// The remote services the engine depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub documents: Arc<dyn RemoteDocumentStore>,
    pub files: Arc<dyn FileStore>,
    pub entitlements: Arc<dyn Entitlements>,
    pub connectivity: Arc<dyn Connectivity>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PushReport {
    pub applied: usize,
    /// Dropped because the remote already held a newer version.
    pub skipped_stale: usize,
    pub retried: usize,
    pub abandoned: usize,
    /// Entries behind a failed entry for the same record.
    pub held_back: usize,
    /// Connectivity dropped mid-pass.
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PullReport {
    pub pages: usize,
    pub outcome: PullOutcome,
    /// Set when a page request failed; earlier pages stay applied.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub bootstrap: Option<BootstrapReport>,
    pub photos: PhotoReport,
    pub push: PushReport,
    pub meals: PullReport,
    pub settings: PullReport,
    pub surveys: PullReport,
}

#[derive(Debug, Clone)]
pub enum SyncOutcome {
    Completed(SyncReport),
    Offline,
    /// Another pass for the same user is in flight.
    AlreadyRunning,
}

enum Pushed {
    Applied,
    RemoteNewer,
}

pub struct SyncEngine {
    db: Arc<Mutex<Database>>,
    pub(crate) remote: Collaborators,
    pub(crate) config: SyncConfig,
    in_flight: Mutex<HashSet<String>>,
}

impl SyncEngine {
    #[must_use]
    pub fn new(db: Arc<Mutex<Database>>, remote: Collaborators, config: SyncConfig) -> Self {
        SyncEngine {
            db,
            remote,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn connectivity(&self) -> &Arc<dyn Connectivity> {
        &self.remote.connectivity
    }

    /// Lock the store. Callers must drop the guard before the next `.await`.
    pub(crate) fn store(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) async fn with_timeout<T, F>(&self, call: F) -> RemoteResult<T>
    where
        F: Future<Output = RemoteResult<T>>,
    {
        let limit = self.config.remote_timeout;
        tokio::time::timeout(limit, call)
            .await
            .unwrap_or(Err(RemoteError::Timeout(limit)))
    }

    /// One full pass for `user_uid`: initial migration, photos, push, pulls.
    pub async fn sync_user(&self, user_uid: &str) -> Result<SyncOutcome> {
        if !self.remote.connectivity.is_connected() {
            tracing::debug!(user = user_uid, "offline, skipping sync");
            return Ok(SyncOutcome::Offline);
        }
        let Some(_guard) = InFlight::acquire(&self.in_flight, user_uid) else {
            tracing::debug!(user = user_uid, "sync already running");
            return Ok(SyncOutcome::AlreadyRunning);
        };

        tracing::info!(user = user_uid, "sync pass started");
        let mut report = SyncReport::default();

        let bootstrapped = self.store().is_bootstrapped(user_uid)?;
        if !bootstrapped {
            report.bootstrap = Some(self.run_initial_migration(user_uid).await?);
        }
        report.photos = self.upload_pending_photos(user_uid).await?;
        report.push = self.push_pending(user_uid).await?;

        // Until the initial migration has set the meals cursor, an incremental
        // pull would fetch the whole account history.
        let bootstrapped = self.store().is_bootstrapped(user_uid)?;
        if bootstrapped {
            report.meals = self.pull(Collection::Meals, user_uid).await?;
        }
        report.settings = self.pull(Collection::Settings, user_uid).await?;
        report.surveys = self.pull(Collection::Surveys, user_uid).await?;

        tracing::info!(
            user = user_uid,
            pushed = report.push.applied,
            pulled = report.meals.outcome.inserted + report.meals.outcome.updated,
            photos = report.photos.uploaded,
            "sync pass finished"
        );
        Ok(SyncOutcome::Completed(report))
    }

    // --- Push ---

    /// Drain due queue entries oldest first.
    pub async fn push_pending(&self, user_uid: &str) -> Result<PushReport> {
        let mut report = PushReport::default();
        let mut blocked: HashSet<(Collection, String)> = HashSet::new();
        let mut after_id = 0;

        loop {
            let now = now_iso();
            let batch =
                self.store()
                    .pending_ops(user_uid, &now, after_id, self.config.push_batch_size)?;
            if batch.is_empty() {
                break;
            }

            for op in batch {
                after_id = op.id;
                let key = (op.collection, op.cloud_id.clone());
                if blocked.contains(&key) {
                    report.held_back += 1;
                    continue;
                }

                match self.push_op(&op).await {
                    Ok(Pushed::Applied) => {
                        self.store().complete_op(&op, true)?;
                        tracing::debug!(op_id = op.id, cloud_id = %op.cloud_id, "pushed");
                        report.applied += 1;
                    }
                    Ok(Pushed::RemoteNewer) => {
                        self.store().complete_op(&op, false)?;
                        tracing::debug!(
                            op_id = op.id,
                            cloud_id = %op.cloud_id,
                            "remote is newer, dropping queued write"
                        );
                        report.skipped_stale += 1;
                    }
                    Err(RemoteError::Offline) => {
                        report.interrupted = true;
                        return Ok(report);
                    }
                    Err(err) => {
                        blocked.insert(key);
                        let status = self.store().record_op_failure(&op, &err, &self.config)?;
                        match status {
                            OpStatus::Pending => report.retried += 1,
                            OpStatus::Failed => report.abandoned += 1,
                        }
                    }
                }
            }
        }
        Ok(report)
    }

    async fn push_op(&self, op: &OpQueueEntry) -> RemoteResult<Pushed> {
        let documents = &self.remote.documents;
        let existing = self
            .with_timeout(documents.get(op.collection, &op.user_uid, &op.cloud_id))
            .await?;
        if let Some(doc) = existing {
            let remote_stamp = version_stamp(op.collection, &doc);
            if resolve(op.updated_at.as_str(), remote_stamp.as_str()) == Resolution::TakeRemote {
                return Ok(Pushed::RemoteNewer);
            }
        }

        if op.kind == OpKind::Delete {
            self.with_timeout(documents.mark_deleted(
                op.collection,
                &op.user_uid,
                &op.cloud_id,
                &op.updated_at,
            ))
            .await?;
        } else {
            let mut payload = parse_object(&op.payload);
            // Meal payloads are encoded while still pending locally.
            if let Some(fields) = payload.as_object_mut() {
                if fields.contains_key("syncState") {
                    fields.insert("syncState".into(), Value::from(SyncState::Synced.as_str()));
                }
            }
            self.with_timeout(documents.upsert(op.collection, &op.user_uid, &op.cloud_id, &payload))
                .await?;
        }
        Ok(Pushed::Applied)
    }

    // --- Pull ---

    /// Incremental pull of one collection from its stored cursor.
    pub async fn pull(&self, collection: Collection, user_uid: &str) -> Result<PullReport> {
        let since = self
            .store()
            .pull_cursor(user_uid, collection)?
            .unwrap_or_default();
        self.pull_pages(
            collection,
            user_uid,
            CursorField::UpdatedAt,
            &since,
            CursorUpdate::Advance,
        )
        .await
    }

    /// Page through `collection` from `since`, applying each page in its own
    /// transaction. A failed page request ends the loop without error.
    pub(crate) async fn pull_pages(
        &self,
        collection: Collection,
        user_uid: &str,
        field: CursorField,
        since: &str,
        cursor: CursorUpdate,
    ) -> Result<PullReport> {
        let mut report = PullReport::default();
        let key = field.document_key(collection);
        let mut start_after = None;

        loop {
            let query = PullQuery {
                field,
                since: since.to_string(),
                start_after: start_after.take(),
                limit: self.config.pull_page_size,
            };
            let page = match self
                .with_timeout(self.remote.documents.get_since(collection, user_uid, &query))
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    tracing::warn!(
                        user = user_uid,
                        collection = collection.as_str(),
                        error = %err,
                        "pull interrupted"
                    );
                    report.error = Some(err.to_string());
                    break;
                }
            };

            let outcome = self.apply_page(collection, user_uid, &page.documents, cursor)?;
            report.pages += 1;
            report.outcome.absorb(&outcome);

            let Some(last) = page.documents.last() else {
                break;
            };
            if !page.has_more {
                break;
            }
            let last_value = last
                .data
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            start_after = Some((last_value, last.id.clone()));
        }
        Ok(report)
    }

    fn apply_page(
        &self,
        collection: Collection,
        user_uid: &str,
        documents: &[RemoteDocument],
        cursor: CursorUpdate,
    ) -> Result<PullOutcome> {
        let db = self.store();
        match collection {
            Collection::Meals => {
                let meals: Vec<MealRecord> = decode_all(documents);
                db.apply_remote_meals(user_uid, &meals, cursor)
            }
            Collection::Settings => {
                let settings: Vec<SettingRecord> = documents
                    .iter()
                    .map(|doc| SettingRecord::decode_for_user(user_uid, &doc.id, &doc.data))
                    .collect();
                db.apply_remote_settings(user_uid, &settings, cursor)
            }
            Collection::Surveys => {
                let surveys: Vec<SurveyRecord> = decode_all(documents);
                db.apply_remote_surveys(user_uid, &surveys, cursor)
            }
        }
    }
}

fn decode_all<T: RemoteRecord>(documents: &[RemoteDocument]) -> Vec<T> {
    documents
        .iter()
        .map(|doc| T::decode(&doc.id, &doc.data))
        .collect()
}

fn version_stamp(collection: Collection, doc: &RemoteDocument) -> String {
    match collection {
        Collection::Meals => MealRecord::decode(&doc.id, &doc.data).updated_at,
        Collection::Settings => SettingRecord::decode(&doc.id, &doc.data).last_updated,
        Collection::Surveys => SurveyRecord::decode(&doc.id, &doc.data).completed_at,
    }
}

/// Marks a user as having a pass in flight until dropped.
struct InFlight<'a> {
    users: &'a Mutex<HashSet<String>>,
    user_uid: String,
}

impl<'a> InFlight<'a> {
    fn acquire(users: &'a Mutex<HashSet<String>>, user_uid: &str) -> Option<Self> {
        let mut set = users.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(user_uid.to_string()) {
            return None;
        }
        Some(InFlight {
            users,
            user_uid: user_uid.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.user_uid);
    }
}
