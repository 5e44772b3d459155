//! Collaborators the engine talks to. Transport and authentication are the
//! host's business; the engine only sees these traits.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::RemoteError;
use crate::models::Collection;

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Field a pull is ordered and filtered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorField {
    /// Incremental sync: every change since the cursor.
    UpdatedAt,
    /// Initial migration: the meal's own time, bounding the history window.
    Timestamp,
}

impl CursorField {
    /// Document key holding the field for `collection`.
    #[must_use]
    pub fn document_key(self, collection: Collection) -> &'static str {
        match (self, collection) {
            (Self::Timestamp, Collection::Meals) => "timestamp",
            (_, Collection::Meals) => "updatedAt",
            (_, Collection::Settings) => "lastUpdated",
            (_, Collection::Surveys) => "completedAt",
        }
    }
}

/// One page request: documents with `field >= since`, ordered ascending by
/// `(field, id)`, resuming strictly after the `(field value, id)` pair in
/// `start_after` when set.
#[derive(Debug, Clone)]
pub struct PullQuery {
    pub field: CursorField,
    pub since: String,
    pub start_after: Option<(String, String)>,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDocument {
    pub id: String,
    pub data: Value,
}

#[derive(Debug, Clone, Default)]
pub struct RemotePage {
    pub documents: Vec<RemoteDocument>,
    pub has_more: bool,
}

#[async_trait]
pub trait RemoteDocumentStore: Send + Sync {
    async fn get_since(
        &self,
        collection: Collection,
        user_uid: &str,
        query: &PullQuery,
    ) -> RemoteResult<RemotePage>;

    async fn get(
        &self,
        collection: Collection,
        user_uid: &str,
        doc_id: &str,
    ) -> RemoteResult<Option<RemoteDocument>>;

    async fn upsert(
        &self,
        collection: Collection,
        user_uid: &str,
        doc_id: &str,
        data: &Value,
    ) -> RemoteResult<()>;

    /// Soft delete: sets `deleted` and `updatedAt`, never removes the document.
    async fn mark_deleted(
        &self,
        collection: Collection,
        user_uid: &str,
        doc_id: &str,
        updated_at: &str,
    ) -> RemoteResult<()>;
}

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Upload (or overwrite) `remote_path` and return its download URL.
    async fn put_file(&self, remote_path: &str, local_path: &Path) -> RemoteResult<String>;
}

#[async_trait]
pub trait Entitlements: Send + Sync {
    async fn is_premium(&self, user_uid: &str) -> RemoteResult<bool>;
}

pub trait Connectivity: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Receives every connectivity change.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Deterministic storage path for a meal photo, so retries overwrite.
#[must_use]
pub fn photo_remote_path(user_uid: &str, cloud_id: &str) -> String {
    format!("meals/{user_uid}/{cloud_id}.jpg")
}
