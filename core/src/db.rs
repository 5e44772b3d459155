use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{Duration, Local, NaiveDate};
use rusqlite::{Connection, params};
use uuid::Uuid;

use crate::conflict::{Resolution, resolve};
use crate::migrate;
use crate::models::{
    Collection, ImageRecord, ImageStatus, MealRecord, MealSource, MealUpdate, NewMeal,
    NutritionTotals, OpKind, PhotoState, PullOutcome, RemoteRecord, SyncState, SyncStatus,
    UploadState, format_millis, max_timestamp, next_updated_at, normalize_timestamp, now_iso,
    timestamp_millis, validate_meal_type,
};
use crate::queue::{enqueue_op, has_open_op};

/// Whether applying a pulled page also moves the collection's pull cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorUpdate {
    Advance,
    /// Used by the initial migration, which sets the cursor once at the end.
    Hold,
}

pub struct Database {
    pub(crate) conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        // In-memory databases answer "memory"; only file stores switch to WAL.
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        let applied = migrate::run_migrations(&conn)?;
        tracing::debug!(journal_mode = %mode, applied, "database ready");
        Ok(Database { conn })
    }

    pub fn schema_version(&self) -> Result<u32> {
        Ok(migrate::schema_version(&self.conn)?)
    }

    // --- Meals ---

    /// Record a new meal and queue its creation, atomically.
    pub fn insert_meal(&self, new: &NewMeal) -> Result<MealRecord> {
        if new.user_uid.trim().is_empty() {
            bail!("A user id is required to log a meal");
        }
        let meal_type = validate_meal_type(&new.meal_type)?;
        let now = now_iso();
        let id = Uuid::new_v4().to_string();
        let photo = new
            .local_photo
            .clone()
            .map_or(PhotoState::None, |local_uri| PhotoState::Pending { local_uri });

        let meal = MealRecord {
            cloud_id: id.clone(),
            meal_id: id,
            user_uid: new.user_uid.clone(),
            timestamp: new
                .timestamp
                .as_deref()
                .map_or_else(|| now.clone(), normalize_timestamp),
            meal_type,
            name: new.name.clone(),
            totals: new
                .totals
                .unwrap_or_else(|| NutritionTotals::from_ingredients(&new.ingredients)),
            ingredients: new.ingredients.clone(),
            image_id: new.local_photo.as_ref().map(|_| Uuid::new_v4().to_string()),
            photo,
            notes: new.notes.clone(),
            tags: new.tags.clone(),
            deleted: false,
            created_at: now.clone(),
            updated_at: now,
            source: new.source,
            sync_state: SyncState::Pending,
        };

        let tx = self.conn.unchecked_transaction()?;
        write_meal(&tx, &meal)?;
        if let (Some(image_id), Some(path)) = (&meal.image_id, meal.photo.local_uri()) {
            insert_image(&tx, image_id, &meal.user_uid, path)?;
        }
        enqueue_op(
            &tx,
            Collection::Meals,
            &meal.cloud_id,
            &meal.user_uid,
            OpKind::Create,
            &meal.encode(),
            &meal.updated_at,
        )?;
        tx.commit()?;

        tracing::debug!(cloud_id = %meal.cloud_id, "meal logged");
        Ok(meal)
    }

    pub fn update_meal(&self, cloud_id: &str, update: &MealUpdate) -> Result<MealRecord> {
        let tx = self.conn.unchecked_transaction()?;
        let mut meal =
            load_meal(&tx, cloud_id)?.with_context(|| format!("Meal {cloud_id} not found"))?;
        if meal.deleted {
            bail!("Meal {cloud_id} has been deleted");
        }
        if update.is_empty() {
            return Ok(meal);
        }

        if let Some(ref timestamp) = update.timestamp {
            meal.timestamp = normalize_timestamp(timestamp);
        }
        if let Some(ref meal_type) = update.meal_type {
            meal.meal_type = validate_meal_type(meal_type)?;
        }
        if let Some(ref name) = update.name {
            meal.name = Some(name.clone());
        }
        if let Some(ref notes) = update.notes {
            meal.notes = Some(notes.clone());
        }
        if let Some(ref tags) = update.tags {
            meal.tags.clone_from(tags);
        }
        if let Some(ref ingredients) = update.ingredients {
            meal.ingredients.clone_from(ingredients);
            meal.totals = NutritionTotals::from_ingredients(ingredients);
        }
        if let Some(totals) = update.totals {
            meal.totals = totals;
        }
        meal.updated_at = next_updated_at(Some(&meal.updated_at));
        meal.sync_state = SyncState::Pending;

        write_meal(&tx, &meal)?;
        enqueue_op(
            &tx,
            Collection::Meals,
            &meal.cloud_id,
            &meal.user_uid,
            OpKind::Update,
            &meal.encode(),
            &meal.updated_at,
        )?;
        tx.commit()?;
        Ok(meal)
    }

    /// Flag a meal deleted and queue the remote soft delete. Returns false
    /// when there is no such meal or it is already deleted.
    pub fn soft_delete_meal(&self, cloud_id: &str) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let Some(mut meal) = load_meal(&tx, cloud_id)? else {
            return Ok(false);
        };
        if meal.deleted {
            return Ok(false);
        }
        meal.deleted = true;
        meal.updated_at = next_updated_at(Some(&meal.updated_at));
        meal.sync_state = SyncState::Pending;

        write_meal(&tx, &meal)?;
        enqueue_op(
            &tx,
            Collection::Meals,
            &meal.cloud_id,
            &meal.user_uid,
            OpKind::Delete,
            &meal.encode(),
            &meal.updated_at,
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn get_meal(&self, cloud_id: &str) -> Result<Option<MealRecord>> {
        Ok(load_meal(&self.conn, cloud_id)?)
    }

    /// Live meals whose timestamp falls on `date` in local time, newest first.
    pub fn meals_for_day(&self, user_uid: &str, date: NaiveDate) -> Result<Vec<MealRecord>> {
        let start = local_midnight_millis(date);
        let end = local_midnight_millis(date + Duration::days(1));
        self.meals_between(user_uid, &format_millis(start), &format_millis(end))
    }

    pub fn meals_between(&self, user_uid: &str, start: &str, end: &str) -> Result<Vec<MealRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MEAL_COLUMNS} FROM meals
             WHERE user_uid = ?1 AND deleted = 0 AND timestamp >= ?2 AND timestamp < ?3
             ORDER BY timestamp DESC"
        ))?;
        let (start, end) = (normalize_timestamp(start), normalize_timestamp(end));
        let meals = stmt
            .query_map(params![user_uid, start, end], meal_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(meals)
    }

    /// Live meals older than `before` (or all), newest first.
    pub fn meal_history(
        &self,
        user_uid: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MealRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MEAL_COLUMNS} FROM meals
             WHERE user_uid = ?1 AND deleted = 0 AND (?2 IS NULL OR timestamp < ?2)
             ORDER BY timestamp DESC
             LIMIT ?3"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let before = before.map(normalize_timestamp);
        let meals = stmt
            .query_map(params![user_uid, before, limit], meal_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(meals)
    }

    pub fn meals_with_pending_photos(&self, user_uid: &str) -> Result<Vec<MealRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MEAL_COLUMNS} FROM meals
             WHERE user_uid = ?1 AND deleted = 0 AND upload_state = 'pending'
               AND image_local IS NOT NULL AND image_local != ''
             ORDER BY updated_at"
        ))?;
        let meals = stmt
            .query_map(params![user_uid], meal_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(meals)
    }

    // --- Photos ---

    /// Point a meal at a freshly captured local photo.
    ///
    /// The remote document does not change until the upload finishes, so this
    /// neither bumps `updated_at` nor queues a push; [`Self::complete_photo_upload`]
    /// does both.
    pub fn attach_local_photo(&self, cloud_id: &str, local_path: &str) -> Result<MealRecord> {
        let tx = self.conn.unchecked_transaction()?;
        let mut meal =
            load_meal(&tx, cloud_id)?.with_context(|| format!("Meal {cloud_id} not found"))?;
        if meal.deleted {
            bail!("Meal {cloud_id} has been deleted");
        }
        let image_id = Uuid::new_v4().to_string();
        insert_image(&tx, &image_id, &meal.user_uid, local_path)?;
        meal.image_id = Some(image_id);
        meal.photo = PhotoState::Pending {
            local_uri: local_path.to_string(),
        };
        write_meal(&tx, &meal)?;
        tx.commit()?;
        Ok(meal)
    }

    /// Record a finished upload: remote URL in, local path out, meal queued
    /// for push. Returns false if the meal no longer points at `local_uri`.
    pub fn complete_photo_upload(&self, cloud_id: &str, local_uri: &str, url: &str) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let Some(mut meal) = load_meal(&tx, cloud_id)? else {
            return Ok(false);
        };
        if meal.photo.local_uri() != Some(local_uri) {
            return Ok(false);
        }

        let now = now_iso();
        if let Some(ref image_id) = meal.image_id {
            tx.execute(
                "UPDATE images SET status = ?1, cloud_url = ?2, updated_at = ?3 WHERE image_id = ?4",
                params![ImageStatus::Uploaded.as_str(), url, now, image_id],
            )?;
        }
        meal.photo = PhotoState::Uploaded {
            url: url.to_string(),
        };
        meal.updated_at = next_updated_at(Some(&meal.updated_at));
        meal.sync_state = SyncState::Pending;
        write_meal(&tx, &meal)?;
        enqueue_op(
            &tx,
            Collection::Meals,
            &meal.cloud_id,
            &meal.user_uid,
            OpKind::Update,
            &meal.encode(),
            &meal.updated_at,
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// The local file behind a pending photo is gone; stop trying to upload it.
    pub fn mark_photo_missing(&self, cloud_id: &str, local_uri: &str) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        let Some(mut meal) = load_meal(&tx, cloud_id)? else {
            return Ok(());
        };
        if meal.photo.local_uri() != Some(local_uri) {
            return Ok(());
        }
        if let Some(ref image_id) = meal.image_id {
            tx.execute(
                "UPDATE images SET status = ?1, updated_at = ?2 WHERE image_id = ?3",
                params![ImageStatus::Failed.as_str(), now_iso(), image_id],
            )?;
        }
        meal.photo = PhotoState::None;
        write_meal(&tx, &meal)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_image(&self, image_id: &str) -> Result<Option<ImageRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT image_id, user_uid, local_path, cloud_url, status, updated_at
             FROM images WHERE image_id = ?1",
        )?;
        let mut rows = stmt.query(params![image_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(ImageRecord {
                image_id: row.get(0)?,
                user_uid: row.get(1)?,
                local_path: row.get(2)?,
                cloud_url: row.get(3)?,
                status: ImageStatus::parse(&row.get::<_, String>(4)?),
                updated_at: row.get(5)?,
            }))
        } else {
            Ok(None)
        }
    }

    // --- Reconciliation ---

    /// Merge one page of remote meals, last writer wins, in a single
    /// transaction that also moves the pull cursor when asked to.
    pub fn apply_remote_meals(
        &self,
        user_uid: &str,
        remote: &[MealRecord],
        cursor: CursorUpdate,
    ) -> Result<PullOutcome> {
        let tx = self.conn.unchecked_transaction()?;
        let mut outcome = PullOutcome::default();

        for incoming in remote {
            if incoming.cloud_id.is_empty() {
                continue;
            }
            let mut incoming = incoming.clone();
            if incoming.user_uid.is_empty() {
                incoming.user_uid = user_uid.to_string();
            }
            if !incoming.updated_at.is_empty() {
                outcome.max_updated_at =
                    max_timestamp(outcome.max_updated_at.take(), Some(incoming.updated_at.clone()));
            }

            let Some(local) = load_meal(&tx, &incoming.cloud_id)? else {
                incoming.sync_state = SyncState::Synced;
                write_meal(&tx, &incoming)?;
                outcome.inserted += 1;
                continue;
            };

            match resolve(&local, &incoming) {
                Resolution::TakeRemote => {
                    incoming.sync_state = SyncState::Synced;
                    // A photo still waiting for upload survives until the pipeline is done with it.
                    if incoming.photo == PhotoState::None && local.photo.local_uri().is_some() {
                        incoming.photo = local.photo.clone();
                        incoming.image_id = incoming.image_id.take().or_else(|| local.image_id.clone());
                    }
                    write_meal(&tx, &incoming)?;
                    outcome.updated += 1;
                }
                Resolution::KeepLocal => {
                    if !has_open_op(&tx, Collection::Meals, &local.cloud_id)? {
                        let kind = if local.deleted {
                            OpKind::Delete
                        } else {
                            OpKind::Update
                        };
                        enqueue_op(
                            &tx,
                            Collection::Meals,
                            &local.cloud_id,
                            &local.user_uid,
                            kind,
                            &local.encode(),
                            &local.updated_at,
                        )?;
                        tx.execute(
                            "UPDATE meals SET sync_state = ?1 WHERE cloud_id = ?2",
                            params![SyncState::Pending.as_str(), local.cloud_id],
                        )?;
                    }
                    outcome.local_newer += 1;
                }
                Resolution::InSync => outcome.unchanged += 1,
            }
        }

        if cursor == CursorUpdate::Advance {
            advance_cursor(&tx, user_uid, Collection::Meals, outcome.max_updated_at.as_deref())?;
        }
        tx.commit()?;

        tracing::debug!(
            inserted = outcome.inserted,
            updated = outcome.updated,
            unchanged = outcome.unchanged,
            local_newer = outcome.local_newer,
            "applied remote meals"
        );
        Ok(outcome)
    }

    // --- Sync metadata ---

    pub fn pull_cursor(&self, user_uid: &str, collection: Collection) -> Result<Option<String>> {
        Ok(read_cursor(&self.conn, user_uid, collection)?)
    }

    pub fn is_bootstrapped(&self, user_uid: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare("SELECT bootstrapped FROM device_state WHERE user_uid = ?1")?;
        let mut rows = stmt.query(params![user_uid])?;
        if let Some(row) = rows.next()? {
            Ok(row.get(0)?)
        } else {
            Ok(false)
        }
    }

    /// Set the meals cursor from the initial migration and raise the one-shot flag.
    pub fn complete_bootstrap(&self, user_uid: &str, max_updated_at: Option<&str>) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        advance_cursor(&tx, user_uid, Collection::Meals, max_updated_at)?;
        tx.execute(
            "INSERT INTO device_state (user_uid, bootstrapped, bootstrapped_at) VALUES (?1, 1, ?2)
             ON CONFLICT(user_uid) DO UPDATE SET bootstrapped = 1, bootstrapped_at = excluded.bootstrapped_at",
            params![user_uid, now_iso()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn sync_status(&self, user_uid: &str) -> Result<SyncStatus> {
        let count = |sql: &str| -> Result<i64> {
            Ok(self.conn.query_row(sql, params![user_uid], |row| row.get(0))?)
        };
        Ok(SyncStatus {
            user_uid: user_uid.to_string(),
            schema_version: self.schema_version()?,
            meals: count("SELECT COUNT(*) FROM meals WHERE user_uid = ?1 AND deleted = 0")?,
            deleted_meals: count("SELECT COUNT(*) FROM meals WHERE user_uid = ?1 AND deleted = 1")?,
            unsynced_meals: count(
                "SELECT COUNT(*) FROM meals WHERE user_uid = ?1 AND sync_state = 'pending'",
            )?,
            conflicted_meals: count(
                "SELECT COUNT(*) FROM meals WHERE user_uid = ?1 AND sync_state = 'conflict'",
            )?,
            pending_photos: count(
                "SELECT COUNT(*) FROM meals WHERE user_uid = ?1 AND deleted = 0 AND upload_state = 'pending'",
            )?,
            queue: self.queue_stats(user_uid)?,
            bootstrapped: self.is_bootstrapped(user_uid)?,
            meals_cursor: self.pull_cursor(user_uid, Collection::Meals)?,
        })
    }
}

// --- Row mapping helpers ---

const MEAL_COLUMNS: &str = "cloud_id, meal_id, user_uid, timestamp, type, name, photo_url, \
     image_local, upload_state, image_id, totals_kcal, totals_protein, totals_carbs, totals_fat, \
     ingredients, notes, tags, deleted, created_at, updated_at, source, sync_state";

fn meal_from_row(row: &rusqlite::Row) -> rusqlite::Result<MealRecord> {
    let upload_state: Option<String> = row.get(8)?;
    let ingredients: String = row.get(14)?;
    let tags: String = row.get(16)?;
    Ok(MealRecord {
        cloud_id: row.get(0)?,
        meal_id: row.get(1)?,
        user_uid: row.get(2)?,
        timestamp: row.get(3)?,
        meal_type: row.get(4)?,
        name: row.get(5)?,
        photo: PhotoState::from_columns(row.get(6)?, row.get(7)?, upload_state.as_deref()),
        image_id: row.get(9)?,
        totals: NutritionTotals {
            kcal: row.get(10)?,
            protein: row.get(11)?,
            carbs: row.get(12)?,
            fat: row.get(13)?,
        },
        ingredients: serde_json::from_str(&ingredients).unwrap_or_default(),
        notes: row.get(15)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        deleted: row.get(17)?,
        created_at: row.get::<_, Option<String>>(18)?.unwrap_or_default(),
        updated_at: row.get(19)?,
        source: MealSource::parse(&row.get::<_, String>(20)?),
        sync_state: SyncState::parse(&row.get::<_, String>(21)?),
    })
}

pub(crate) fn load_meal(conn: &Connection, cloud_id: &str) -> rusqlite::Result<Option<MealRecord>> {
    let mut stmt = conn.prepare(&format!("SELECT {MEAL_COLUMNS} FROM meals WHERE cloud_id = ?1"))?;
    let mut rows = stmt.query(params![cloud_id])?;
    if let Some(row) = rows.next()? {
        Ok(Some(meal_from_row(row)?))
    } else {
        Ok(None)
    }
}

/// Insert or fully replace a meal row.
fn write_meal(conn: &Connection, meal: &MealRecord) -> rusqlite::Result<()> {
    let ingredients = serde_json::to_string(&meal.ingredients).unwrap_or_else(|_| "[]".into());
    let tags = serde_json::to_string(&meal.tags).unwrap_or_else(|_| "[]".into());
    conn.execute(
        &format!(
            "INSERT INTO meals ({MEAL_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)
             ON CONFLICT(cloud_id) DO UPDATE SET
                meal_id = excluded.meal_id, user_uid = excluded.user_uid,
                timestamp = excluded.timestamp, type = excluded.type, name = excluded.name,
                photo_url = excluded.photo_url, image_local = excluded.image_local,
                upload_state = excluded.upload_state, image_id = excluded.image_id,
                totals_kcal = excluded.totals_kcal, totals_protein = excluded.totals_protein,
                totals_carbs = excluded.totals_carbs, totals_fat = excluded.totals_fat,
                ingredients = excluded.ingredients, notes = excluded.notes, tags = excluded.tags,
                deleted = excluded.deleted, created_at = excluded.created_at,
                updated_at = excluded.updated_at, source = excluded.source,
                sync_state = excluded.sync_state"
        ),
        params![
            meal.cloud_id,
            meal.meal_id,
            meal.user_uid,
            meal.timestamp,
            meal.meal_type,
            meal.name,
            meal.photo.url(),
            meal.photo.local_uri(),
            meal.photo.upload_state().map(UploadState::as_str),
            meal.image_id,
            meal.totals.kcal,
            meal.totals.protein,
            meal.totals.carbs,
            meal.totals.fat,
            ingredients,
            meal.notes,
            tags,
            meal.deleted,
            meal.created_at,
            meal.updated_at,
            meal.source.as_str(),
            meal.sync_state.as_str(),
        ],
    )?;
    Ok(())
}

fn insert_image(conn: &Connection, image_id: &str, user_uid: &str, local_path: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO images (image_id, user_uid, local_path, cloud_url, status, updated_at)
         VALUES (?1, ?2, ?3, NULL, ?4, ?5)",
        params![image_id, user_uid, local_path, ImageStatus::Pending.as_str(), now_iso()],
    )?;
    Ok(())
}

pub(crate) fn read_cursor(
    conn: &Connection,
    user_uid: &str,
    collection: Collection,
) -> rusqlite::Result<Option<String>> {
    let mut stmt =
        conn.prepare("SELECT cursor FROM sync_cursors WHERE user_uid = ?1 AND collection = ?2")?;
    let mut rows = stmt.query(params![user_uid, collection.as_str()])?;
    if let Some(row) = rows.next()? {
        Ok(Some(row.get(0)?))
    } else {
        Ok(None)
    }
}

/// Move the cursor forward to `candidate`; never moves it back.
pub(crate) fn advance_cursor(
    conn: &Connection,
    user_uid: &str,
    collection: Collection,
    candidate: Option<&str>,
) -> rusqlite::Result<()> {
    let Some(candidate) = candidate else {
        return Ok(());
    };
    if let Some(current) = read_cursor(conn, user_uid, collection)? {
        if timestamp_millis(candidate) <= timestamp_millis(&current) {
            return Ok(());
        }
    }
    conn.execute(
        "INSERT INTO sync_cursors (user_uid, collection, cursor) VALUES (?1, ?2, ?3)
         ON CONFLICT(user_uid, collection) DO UPDATE SET cursor = excluded.cursor",
        params![user_uid, collection.as_str(), candidate],
    )?;
    Ok(())
}

fn local_midnight_millis(date: NaiveDate) -> i64 {
    let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    midnight
        .and_local_timezone(Local)
        .earliest()
        .map_or_else(|| midnight.and_utc().timestamp_millis(), |dt| dt.timestamp_millis())
}
