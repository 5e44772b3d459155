//! In-memory remote: document store, file store, entitlements and
//! connectivity in one value, with switches for simulating failures.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::watch;

use crate::error::RemoteError;
use crate::models::{Collection, timestamp_millis};
use crate::remote::{
    Connectivity, Entitlements, FileStore, PullQuery, RemoteDocument, RemoteDocumentStore,
    RemotePage, RemoteResult,
};

/// Remote call kinds, for targeting injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteCall {
    GetSince,
    Get,
    Upsert,
    MarkDeleted,
    PutFile,
    IsPremium,
}

/// One successful write, in the order the remote saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteWrite {
    Upsert { collection: Collection, doc_id: String },
    MarkDeleted { collection: Collection, doc_id: String },
    PutFile { path: String },
}

type DocKey = (Collection, String, String);

#[derive(Default)]
struct State {
    documents: BTreeMap<DocKey, Value>,
    files: HashMap<String, Vec<u8>>,
    premium: HashSet<String>,
    /// Scripted results per call kind; `None` lets the call through.
    script: HashMap<RemoteCall, VecDeque<Option<RemoteError>>>,
    writes: Vec<RemoteWrite>,
    calls: HashMap<RemoteCall, usize>,
    latency: Option<Duration>,
}

pub struct MemoryRemote {
    state: Mutex<State>,
    online: watch::Sender<bool>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        let (online, _) = watch::channel(true);
        MemoryRemote {
            state: Mutex::new(State::default()),
            online,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
    }

    pub fn set_premium(&self, user_uid: &str, premium: bool) {
        let mut state = self.state();
        if premium {
            state.premium.insert(user_uid.to_string());
        } else {
            state.premium.remove(user_uid);
        }
    }

    /// Delay every call by `latency` before it is served.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    /// Make the next unscripted call of kind `call` fail with `error`.
    pub fn fail_next(&self, call: RemoteCall, error: RemoteError) {
        self.state()
            .script
            .entry(call)
            .or_default()
            .push_back(Some(error));
    }

    /// Let the next unscripted call of kind `call` through, so a later
    /// `fail_next` hits the call after it.
    pub fn allow_next(&self, call: RemoteCall) {
        self.state().script.entry(call).or_default().push_back(None);
    }

    pub fn put_document(&self, collection: Collection, user_uid: &str, doc_id: &str, data: Value) {
        self.state().documents.insert(
            (collection, user_uid.to_string(), doc_id.to_string()),
            data,
        );
    }

    #[must_use]
    pub fn document(&self, collection: Collection, user_uid: &str, doc_id: &str) -> Option<Value> {
        self.state()
            .documents
            .get(&(collection, user_uid.to_string(), doc_id.to_string()))
            .cloned()
    }

    #[must_use]
    pub fn document_count(&self, collection: Collection, user_uid: &str) -> usize {
        self.state()
            .documents
            .keys()
            .filter(|(c, u, _)| *c == collection && u == user_uid)
            .count()
    }

    #[must_use]
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    #[must_use]
    pub fn writes(&self) -> Vec<RemoteWrite> {
        self.state().writes.clone()
    }

    #[must_use]
    pub fn call_count(&self, call: RemoteCall) -> usize {
        self.state().calls.get(&call).copied().unwrap_or(0)
    }

    /// Common preamble of every call: latency, connectivity, injected failure.
    async fn enter(&self, call: RemoteCall) -> RemoteResult<()> {
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !*self.online.borrow() {
            return Err(RemoteError::Offline);
        }
        let mut state = self.state();
        *state.calls.entry(call).or_default() += 1;
        match state.script.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(Some(err)) => Err(err),
            _ => Ok(()),
        }
    }
}

fn sort_key(data: &Value, key: &str) -> i64 {
    data.get(key)
        .and_then(Value::as_str)
        .map_or(0, timestamp_millis)
}

#[async_trait]
impl RemoteDocumentStore for MemoryRemote {
    async fn get_since(
        &self,
        collection: Collection,
        user_uid: &str,
        query: &PullQuery,
    ) -> RemoteResult<RemotePage> {
        self.enter(RemoteCall::GetSince).await?;
        let key = query.field.document_key(collection);
        let since = timestamp_millis(&query.since);
        let after = query
            .start_after
            .as_ref()
            .map(|(value, id)| (timestamp_millis(value), id.clone()));

        let state = self.state();
        let mut matching: Vec<(i64, &String, &Value)> = state
            .documents
            .iter()
            .filter(|((c, u, _), _)| *c == collection && u == user_uid)
            .map(|((_, _, id), data)| (sort_key(data, key), id, data))
            .filter(|(stamp, _, _)| *stamp >= since)
            .filter(|(stamp, id, _)| {
                after
                    .as_ref()
                    .is_none_or(|(a_stamp, a_id)| (*stamp, *id) > (*a_stamp, a_id))
            })
            .collect();
        matching.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let has_more = matching.len() > query.limit;
        let documents = matching
            .into_iter()
            .take(query.limit)
            .map(|(_, id, data)| RemoteDocument {
                id: id.clone(),
                data: data.clone(),
            })
            .collect();
        Ok(RemotePage {
            documents,
            has_more,
        })
    }

    async fn get(
        &self,
        collection: Collection,
        user_uid: &str,
        doc_id: &str,
    ) -> RemoteResult<Option<RemoteDocument>> {
        self.enter(RemoteCall::Get).await?;
        Ok(self
            .document(collection, user_uid, doc_id)
            .map(|data| RemoteDocument {
                id: doc_id.to_string(),
                data,
            }))
    }

    async fn upsert(
        &self,
        collection: Collection,
        user_uid: &str,
        doc_id: &str,
        data: &Value,
    ) -> RemoteResult<()> {
        self.enter(RemoteCall::Upsert).await?;
        let mut state = self.state();
        state.documents.insert(
            (collection, user_uid.to_string(), doc_id.to_string()),
            data.clone(),
        );
        state.writes.push(RemoteWrite::Upsert {
            collection,
            doc_id: doc_id.to_string(),
        });
        Ok(())
    }

    async fn mark_deleted(
        &self,
        collection: Collection,
        user_uid: &str,
        doc_id: &str,
        updated_at: &str,
    ) -> RemoteResult<()> {
        self.enter(RemoteCall::MarkDeleted).await?;
        let mut state = self.state();
        let doc = state
            .documents
            .entry((collection, user_uid.to_string(), doc_id.to_string()))
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(fields) = doc {
            fields.insert("deleted".into(), json!(true));
            fields.insert("updatedAt".into(), json!(updated_at));
        }
        state.writes.push(RemoteWrite::MarkDeleted {
            collection,
            doc_id: doc_id.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl FileStore for MemoryRemote {
    async fn put_file(&self, remote_path: &str, local_path: &Path) -> RemoteResult<String> {
        self.enter(RemoteCall::PutFile).await?;
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|e| RemoteError::Transient(format!("read {}: {e}", local_path.display())))?;
        let mut state = self.state();
        state.files.insert(remote_path.to_string(), bytes);
        state.writes.push(RemoteWrite::PutFile {
            path: remote_path.to_string(),
        });
        Ok(format!("memory://files/{remote_path}"))
    }
}

#[async_trait]
impl Entitlements for MemoryRemote {
    async fn is_premium(&self, user_uid: &str) -> RemoteResult<bool> {
        self.enter(RemoteCall::IsPremium).await?;
        Ok(self.state().premium.contains(user_uid))
    }
}

impl Connectivity for MemoryRemote {
    fn is_connected(&self) -> bool {
        *self.online.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}
