//! Pending-operation queue and its retry policy.

use anyhow::Result;
use chrono::Utc;
use rusqlite::{Connection, params};
use serde_json::Value;

use crate::config::SyncConfig;
use crate::db::Database;
use crate::error::RemoteError;
use crate::models::{
    Collection, OpKind, OpQueueEntry, OpStatus, QueueStats, SyncState, format_millis,
};

const OP_COLUMNS: &str = "id, cloud_id, user_uid, collection, kind, payload, updated_at, \
     attempts, status, last_error, next_attempt_at";

impl Database {
    /// Due entries for `user_uid` after `after_id`, oldest first.
    ///
    /// An entry is held back while an earlier entry for the same record is
    /// still waiting out its backoff, so one record's changes stay in order.
    pub fn pending_ops(
        &self,
        user_uid: &str,
        now: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<OpQueueEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OP_COLUMNS} FROM op_queue q
             WHERE q.user_uid = ?1 AND q.status = 'pending' AND q.id > ?3
               AND (q.next_attempt_at IS NULL OR q.next_attempt_at <= ?2)
               AND NOT EXISTS (
                   SELECT 1 FROM op_queue e
                   WHERE e.collection = q.collection AND e.cloud_id = q.cloud_id
                     AND e.status = 'pending' AND e.id < q.id
                     AND e.next_attempt_at IS NOT NULL AND e.next_attempt_at > ?2
               )
             ORDER BY q.id
             LIMIT ?4"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let ops = stmt
            .query_map(params![user_uid, now, after_id, limit], op_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ops)
    }

    /// Every entry for the user, pending and failed, in queue order.
    pub fn queue_entries(&self, user_uid: &str) -> Result<Vec<OpQueueEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OP_COLUMNS} FROM op_queue WHERE user_uid = ?1 ORDER BY id"
        ))?;
        let ops = stmt
            .query_map(params![user_uid], op_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ops)
    }

    pub fn failed_ops(&self, user_uid: &str) -> Result<Vec<OpQueueEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OP_COLUMNS} FROM op_queue WHERE user_uid = ?1 AND status = 'failed' ORDER BY id"
        ))?;
        let ops = stmt
            .query_map(params![user_uid], op_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ops)
    }

    pub fn mark_op_done(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM op_queue WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    /// Drop a pushed entry. When `applied`, the record is marked synced,
    /// unless it changed again after this entry was queued.
    pub fn complete_op(&self, op: &OpQueueEntry, applied: bool) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM op_queue WHERE id = ?1", params![op.id])?;
        if applied {
            set_record_state(&tx, op, SyncState::Synced, Some(&op.updated_at))?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Count a failed push attempt and schedule the next one, or abandon the
    /// entry once it is out of attempts or the remote rejected it outright.
    pub fn record_op_failure(
        &self,
        op: &OpQueueEntry,
        error: &RemoteError,
        config: &SyncConfig,
    ) -> Result<OpStatus> {
        let attempts = op.attempts + 1;
        let message = error.to_string();
        let abandon = error.is_permanent() || attempts >= config.max_attempts;

        let tx = self.conn.unchecked_transaction()?;
        if abandon {
            tx.execute(
                "UPDATE op_queue SET attempts = ?1, status = 'failed', last_error = ?2,
                 next_attempt_at = NULL WHERE id = ?3",
                params![attempts, message, op.id],
            )?;
            set_record_state(&tx, op, SyncState::Conflict, None)?;
        } else {
            let delay = chrono::Duration::from_std(config.backoff(attempts))
                .unwrap_or_else(|_| chrono::Duration::hours(1));
            let next = format_millis((Utc::now() + delay).timestamp_millis());
            tx.execute(
                "UPDATE op_queue SET attempts = ?1, last_error = ?2, next_attempt_at = ?3
                 WHERE id = ?4",
                params![attempts, message, next, op.id],
            )?;
        }
        tx.commit()?;

        if abandon {
            tracing::warn!(
                op_id = op.id,
                cloud_id = %op.cloud_id,
                attempts,
                error = %message,
                "giving up on queued operation"
            );
            Ok(OpStatus::Failed)
        } else {
            tracing::warn!(
                op_id = op.id,
                cloud_id = %op.cloud_id,
                attempts,
                error = %message,
                "push failed, will retry"
            );
            Ok(OpStatus::Pending)
        }
    }

    /// Put abandoned entries back in line. Returns how many were reset.
    pub fn requeue_failed(&self, user_uid: &str) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let failed = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {OP_COLUMNS} FROM op_queue WHERE user_uid = ?1 AND status = 'failed'"
            ))?;
            stmt.query_map(params![user_uid], op_from_row)?
                .collect::<Result<Vec<_>, _>>()?
        };
        for op in &failed {
            tx.execute(
                "UPDATE op_queue SET status = 'pending', attempts = 0, last_error = NULL,
                 next_attempt_at = NULL WHERE id = ?1",
                params![op.id],
            )?;
            set_record_state(&tx, op, SyncState::Pending, None)?;
        }
        tx.commit()?;
        Ok(failed.len())
    }

    pub fn queue_stats(&self, user_uid: &str) -> Result<QueueStats> {
        let (pending, failed, oldest_pending) = self.conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                MIN(CASE WHEN status = 'pending' THEN updated_at END)
             FROM op_queue WHERE user_uid = ?1",
            params![user_uid],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(QueueStats {
            pending,
            failed,
            oldest_pending,
        })
    }
}

fn op_from_row(row: &rusqlite::Row) -> rusqlite::Result<OpQueueEntry> {
    let collection: String = row.get(3)?;
    let kind: String = row.get(4)?;
    Ok(OpQueueEntry {
        id: row.get(0)?,
        cloud_id: row.get(1)?,
        user_uid: row.get(2)?,
        collection: Collection::parse(&collection).unwrap_or(Collection::Meals),
        kind: OpKind::parse(&kind).unwrap_or(OpKind::Update),
        payload: row.get(5)?,
        updated_at: row.get(6)?,
        attempts: row.get(7)?,
        status: OpStatus::parse(&row.get::<_, String>(8)?),
        last_error: row.get(9)?,
        next_attempt_at: row.get(10)?,
    })
}

pub(crate) fn enqueue_op(
    conn: &Connection,
    collection: Collection,
    cloud_id: &str,
    user_uid: &str,
    kind: OpKind,
    payload: &Value,
    updated_at: &str,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO op_queue (cloud_id, user_uid, collection, kind, payload, updated_at, attempts, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 'pending')",
        params![
            cloud_id,
            user_uid,
            collection.as_str(),
            kind.as_str(),
            payload.to_string(),
            updated_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Whether the record still has a pending or abandoned entry. Abandoned
/// entries wait for an explicit retry and keep the record in conflict.
pub(crate) fn has_open_op(
    conn: &Connection,
    collection: Collection,
    cloud_id: &str,
) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM op_queue
         WHERE collection = ?1 AND cloud_id = ?2
           AND status IN ('pending', 'failed'))",
        params![collection.as_str(), cloud_id],
        |row| row.get(0),
    )
}

/// Set the sync flag of the record an entry targets. With `only_if_stamp`,
/// the flag changes only while the record still carries that stamp.
fn set_record_state(
    conn: &Connection,
    op: &OpQueueEntry,
    state: SyncState,
    only_if_stamp: Option<&str>,
) -> rusqlite::Result<()> {
    match op.collection {
        Collection::Meals => conn.execute(
            "UPDATE meals SET sync_state = ?1
             WHERE cloud_id = ?2 AND (?3 IS NULL OR updated_at = ?3)",
            params![state.as_str(), op.cloud_id, only_if_stamp],
        )?,
        Collection::Settings => conn.execute(
            "UPDATE settings SET sync_status = ?1
             WHERE user_uid || '_' || key = ?2 AND (?3 IS NULL OR last_updated = ?3)",
            params![state.as_str(), op.cloud_id, only_if_stamp],
        )?,
        Collection::Surveys => conn.execute(
            "UPDATE surveys SET sync_status = ?1
             WHERE user_uid = ?2 AND (?3 IS NULL OR completed_at = ?3)",
            params![state.as_str(), op.cloud_id, only_if_stamp],
        )?,
    };
    Ok(())
}
