//! User settings (one value per key) and onboarding survey snapshots.

use anyhow::{Result, bail};
use rusqlite::{Connection, params};
use serde_json::Value;

use crate::conflict::{Resolution, resolve};
use crate::db::{CursorUpdate, Database, advance_cursor};
use crate::models::{
    Collection, OpKind, PullOutcome, RemoteRecord, SettingRecord, SurveyRecord, SyncState,
    max_timestamp, next_updated_at,
};
use crate::queue::{enqueue_op, has_open_op};

impl Database {
    // --- Settings ---

    pub fn set_setting(&self, user_uid: &str, key: &str, value: &str) -> Result<SettingRecord> {
        if key.trim().is_empty() {
            bail!("Setting key must not be empty");
        }
        let tx = self.conn.unchecked_transaction()?;
        let previous = load_setting(&tx, user_uid, key)?;
        let setting = SettingRecord {
            user_uid: user_uid.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            last_updated: next_updated_at(previous.as_ref().map(|s| s.last_updated.as_str())),
            sync_status: SyncState::Pending,
        };
        write_setting(&tx, &setting)?;
        enqueue_op(
            &tx,
            Collection::Settings,
            &setting.doc_id(),
            user_uid,
            OpKind::Update,
            &setting.encode(),
            &setting.last_updated,
        )?;
        tx.commit()?;
        Ok(setting)
    }

    pub fn get_setting(&self, user_uid: &str, key: &str) -> Result<Option<SettingRecord>> {
        Ok(load_setting(&self.conn, user_uid, key)?)
    }

    pub fn list_settings(&self, user_uid: &str) -> Result<Vec<SettingRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_uid, key, value, last_updated, sync_status
             FROM settings WHERE user_uid = ?1 ORDER BY key",
        )?;
        let settings = stmt
            .query_map(params![user_uid], setting_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(settings)
    }

    /// Merge remote settings per key, last writer wins on `lastUpdated`.
    pub fn apply_remote_settings(
        &self,
        user_uid: &str,
        remote: &[SettingRecord],
        cursor: CursorUpdate,
    ) -> Result<PullOutcome> {
        let tx = self.conn.unchecked_transaction()?;
        let mut outcome = PullOutcome::default();

        for incoming in remote {
            if incoming.key.is_empty() {
                continue;
            }
            let mut incoming = incoming.clone();
            incoming.user_uid = user_uid.to_string();
            incoming.sync_status = SyncState::Synced;
            if !incoming.last_updated.is_empty() {
                outcome.max_updated_at = max_timestamp(
                    outcome.max_updated_at.take(),
                    Some(incoming.last_updated.clone()),
                );
            }

            let Some(local) = load_setting(&tx, user_uid, &incoming.key)? else {
                write_setting(&tx, &incoming)?;
                outcome.inserted += 1;
                continue;
            };
            match resolve(&local, &incoming) {
                Resolution::TakeRemote => {
                    write_setting(&tx, &incoming)?;
                    outcome.updated += 1;
                }
                Resolution::KeepLocal => {
                    if !has_open_op(&tx, Collection::Settings, &local.doc_id())? {
                        enqueue_op(
                            &tx,
                            Collection::Settings,
                            &local.doc_id(),
                            user_uid,
                            OpKind::Update,
                            &local.encode(),
                            &local.last_updated,
                        )?;
                    }
                    outcome.local_newer += 1;
                }
                Resolution::InSync => outcome.unchanged += 1,
            }
        }

        if cursor == CursorUpdate::Advance {
            advance_cursor(&tx, user_uid, Collection::Settings, outcome.max_updated_at.as_deref())?;
        }
        tx.commit()?;
        Ok(outcome)
    }

    // --- Surveys ---

    /// Store a completed questionnaire as the newest snapshot and queue it.
    pub fn save_survey(&self, user_uid: &str, form_data: &Value) -> Result<SurveyRecord> {
        let tx = self.conn.unchecked_transaction()?;
        let latest = load_latest_survey(&tx, user_uid)?;
        let mut survey = SurveyRecord {
            id: 0,
            user_uid: user_uid.to_string(),
            form_data: form_data.to_string(),
            completed_at: next_updated_at(latest.as_ref().map(|s| s.completed_at.as_str())),
            sync_status: SyncState::Pending,
        };
        survey.id = insert_survey(&tx, &survey)?;
        enqueue_op(
            &tx,
            Collection::Surveys,
            &survey.doc_id(),
            user_uid,
            OpKind::Create,
            &survey.encode(),
            &survey.completed_at,
        )?;
        tx.commit()?;
        Ok(survey)
    }

    /// The authoritative snapshot: the most recent by `completed_at`.
    pub fn latest_survey(&self, user_uid: &str) -> Result<Option<SurveyRecord>> {
        Ok(load_latest_survey(&self.conn, user_uid)?)
    }

    pub fn surveys(&self, user_uid: &str) -> Result<Vec<SurveyRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_uid, form_data, completed_at, sync_status
             FROM surveys WHERE user_uid = ?1 ORDER BY completed_at DESC, id DESC",
        )?;
        let surveys = stmt
            .query_map(params![user_uid], survey_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(surveys)
    }

    /// A newer remote snapshot is kept as a new local snapshot; an older one
    /// means the local latest still has to reach the remote.
    pub fn apply_remote_surveys(
        &self,
        user_uid: &str,
        remote: &[SurveyRecord],
        cursor: CursorUpdate,
    ) -> Result<PullOutcome> {
        let tx = self.conn.unchecked_transaction()?;
        let mut outcome = PullOutcome::default();

        for incoming in remote {
            let mut incoming = incoming.clone();
            incoming.user_uid = user_uid.to_string();
            incoming.sync_status = SyncState::Synced;
            if !incoming.completed_at.is_empty() {
                outcome.max_updated_at = max_timestamp(
                    outcome.max_updated_at.take(),
                    Some(incoming.completed_at.clone()),
                );
            }

            let Some(local) = load_latest_survey(&tx, user_uid)? else {
                insert_survey(&tx, &incoming)?;
                outcome.inserted += 1;
                continue;
            };
            match resolve(&local, &incoming) {
                Resolution::TakeRemote => {
                    insert_survey(&tx, &incoming)?;
                    outcome.updated += 1;
                }
                Resolution::KeepLocal => {
                    if !has_open_op(&tx, Collection::Surveys, &local.doc_id())? {
                        enqueue_op(
                            &tx,
                            Collection::Surveys,
                            &local.doc_id(),
                            user_uid,
                            OpKind::Update,
                            &local.encode(),
                            &local.completed_at,
                        )?;
                    }
                    outcome.local_newer += 1;
                }
                Resolution::InSync => outcome.unchanged += 1,
            }
        }

        if cursor == CursorUpdate::Advance {
            advance_cursor(&tx, user_uid, Collection::Surveys, outcome.max_updated_at.as_deref())?;
        }
        tx.commit()?;
        Ok(outcome)
    }
}

fn setting_from_row(row: &rusqlite::Row) -> rusqlite::Result<SettingRecord> {
    Ok(SettingRecord {
        user_uid: row.get(0)?,
        key: row.get(1)?,
        value: row.get(2)?,
        last_updated: row.get(3)?,
        sync_status: SyncState::parse(&row.get::<_, String>(4)?),
    })
}

fn survey_from_row(row: &rusqlite::Row) -> rusqlite::Result<SurveyRecord> {
    Ok(SurveyRecord {
        id: row.get(0)?,
        user_uid: row.get(1)?,
        form_data: row.get(2)?,
        completed_at: row.get(3)?,
        sync_status: SyncState::parse(&row.get::<_, String>(4)?),
    })
}

fn load_setting(
    conn: &Connection,
    user_uid: &str,
    key: &str,
) -> rusqlite::Result<Option<SettingRecord>> {
    let mut stmt = conn.prepare(
        "SELECT user_uid, key, value, last_updated, sync_status
         FROM settings WHERE user_uid = ?1 AND key = ?2",
    )?;
    let mut rows = stmt.query(params![user_uid, key])?;
    if let Some(row) = rows.next()? {
        Ok(Some(setting_from_row(row)?))
    } else {
        Ok(None)
    }
}

fn write_setting(conn: &Connection, setting: &SettingRecord) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO settings (user_uid, key, value, last_updated, sync_status)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(user_uid, key) DO UPDATE SET
            value = excluded.value,
            last_updated = excluded.last_updated,
            sync_status = excluded.sync_status",
        params![
            setting.user_uid,
            setting.key,
            setting.value,
            setting.last_updated,
            setting.sync_status.as_str(),
        ],
    )?;
    Ok(())
}

fn load_latest_survey(conn: &Connection, user_uid: &str) -> rusqlite::Result<Option<SurveyRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_uid, form_data, completed_at, sync_status
         FROM surveys WHERE user_uid = ?1 ORDER BY completed_at DESC, id DESC LIMIT 1",
    )?;
    let mut rows = stmt.query(params![user_uid])?;
    if let Some(row) = rows.next()? {
        Ok(Some(survey_from_row(row)?))
    } else {
        Ok(None)
    }
}

fn insert_survey(conn: &Connection, survey: &SurveyRecord) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO surveys (user_uid, form_data, completed_at, sync_status)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            survey.user_uid,
            survey.form_data,
            survey.completed_at,
            survey.sync_status.as_str(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::timestamp_millis;

    fn remote_setting(key: &str, value: &str, last_updated: &str) -> SettingRecord {
        SettingRecord {
            user_uid: "u1".into(),
            key: key.into(),
            value: value.into(),
            last_updated: last_updated.into(),
            sync_status: SyncState::Synced,
        }
    }

    #[test]
    fn test_set_and_get_setting() {
        let db = Database::open_in_memory().unwrap();
        let first = db.set_setting("u1", "units", "metric").unwrap();
        let second = db.set_setting("u1", "units", "imperial").unwrap();
        assert!(timestamp_millis(&second.last_updated) > timestamp_millis(&first.last_updated));

        let stored = db.get_setting("u1", "units").unwrap().unwrap();
        assert_eq!(stored.value, "imperial");
        assert_eq!(stored.sync_status, SyncState::Pending);
        assert_eq!(db.list_settings("u1").unwrap().len(), 1);
        assert!(db.get_setting("u2", "units").unwrap().is_none());

        let ops = db.queue_entries("u1").unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].collection, Collection::Settings);
        assert_eq!(ops[0].cloud_id, "u1_units");
    }

    #[test]
    fn test_empty_setting_key_rejected() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.set_setting("u1", " ", "x").is_err());
    }

    #[test]
    fn test_remote_setting_newer_wins() {
        let db = Database::open_in_memory().unwrap();
        db.set_setting("u1", "theme", "light").unwrap();

        let outcome = db
            .apply_remote_settings(
                "u1",
                &[
                    remote_setting("theme", "dark", "2999-01-01T00:00:00.000Z"),
                    remote_setting("lang", "fr", "2024-01-01T00:00:00.000Z"),
                ],
                CursorUpdate::Advance,
            )
            .unwrap();
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.inserted, 1);

        let theme = db.get_setting("u1", "theme").unwrap().unwrap();
        assert_eq!(theme.value, "dark");
        assert_eq!(theme.sync_status, SyncState::Synced);
        assert_eq!(
            db.pull_cursor("u1", Collection::Settings).unwrap().as_deref(),
            Some("2999-01-01T00:00:00.000Z")
        );
    }

    #[test]
    fn test_remote_setting_older_is_requeued_once() {
        let db = Database::open_in_memory().unwrap();
        let local = db.set_setting("u1", "theme", "light").unwrap();
        let ops = db.queue_entries("u1").unwrap();
        db.mark_op_done(ops[0].id).unwrap();

        let stale = [remote_setting("theme", "dark", "2000-01-01T00:00:00.000Z")];
        db.apply_remote_settings("u1", &stale, CursorUpdate::Advance)
            .unwrap();
        db.apply_remote_settings("u1", &stale, CursorUpdate::Advance)
            .unwrap();

        assert_eq!(db.get_setting("u1", "theme").unwrap().unwrap().value, "light");
        let ops = db.queue_entries("u1").unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].updated_at, local.last_updated);
    }

    #[test]
    fn test_save_survey_latest_wins() {
        let db = Database::open_in_memory().unwrap();
        db.save_survey("u1", &json!({"goal": "maintain"})).unwrap();
        let second = db.save_survey("u1", &json!({"goal": "gain"})).unwrap();

        let latest = db.latest_survey("u1").unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(db.surveys("u1").unwrap().len(), 2);

        let ops = db.queue_entries("u1").unwrap();
        assert!(ops.iter().all(|o| o.collection == Collection::Surveys && o.cloud_id == "u1"));
    }

    #[test]
    fn test_remote_survey_newer_becomes_latest() {
        let db = Database::open_in_memory().unwrap();
        db.save_survey("u1", &json!({"goal": "maintain"})).unwrap();
        let remote = SurveyRecord::decode(
            "u1",
            &json!({"formData": {"goal": "lose"}, "completedAt": "2999-01-01T00:00:00.000Z"}),
        );

        let outcome = db
            .apply_remote_surveys("u1", std::slice::from_ref(&remote), CursorUpdate::Advance)
            .unwrap();
        assert_eq!(outcome.updated, 1);
        let latest = db.latest_survey("u1").unwrap().unwrap();
        assert_eq!(latest.completed_at, "2999-01-01T00:00:00.000Z");
        assert_eq!(latest.sync_status, SyncState::Synced);

        let again = db
            .apply_remote_surveys("u1", &[remote], CursorUpdate::Advance)
            .unwrap();
        assert_eq!(again.unchanged, 1);
        assert_eq!(db.surveys("u1").unwrap().len(), 2);
    }
}
