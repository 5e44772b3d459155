//! Schema migrator.
//!
//! The schema version lives in `PRAGMA user_version`. Each step runs in its
//! own transaction together with the version bump, so a failed step leaves
//! the store at the last committed version. Steps check for existing
//! tables and columns first and can therefore be re-run safely when the
//! version counter and the actual schema disagree.

use rusqlite::{Connection, params};

use crate::error::MigrationError;
use crate::models::now_iso;

pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub up: fn(&Connection) -> rusqlite::Result<()>,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial",
        up: v1_initial,
    },
    Migration {
        version: 2,
        name: "meal_notes",
        up: v2_meal_notes,
    },
    Migration {
        version: 3,
        name: "sync_metadata",
        up: v3_sync_metadata,
    },
];

pub const LATEST_VERSION: u32 = 3;

pub fn schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

/// Bring the store up to [`LATEST_VERSION`]. Returns the number of steps applied.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    apply(conn, MIGRATIONS)
}

/// Apply every step in `migrations` newer than the stored version, in order.
pub fn apply(conn: &Connection, migrations: &[Migration]) -> Result<usize, MigrationError> {
    let current = schema_version(conn).map_err(|source| MigrationError {
        version: 0,
        name: "read_version",
        source,
    })?;
    let target = migrations.last().map_or(current, |m| m.version);

    tracing::info!(
        current_version = current,
        target_version = target,
        "checking database migrations"
    );

    let mut applied = 0;
    for migration in migrations.iter().filter(|m| m.version > current) {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "applying migration"
        );
        apply_step(conn, migration).map_err(|source| {
            tracing::error!(
                version = migration.version,
                name = migration.name,
                error = %source,
                "migration failed, rolled back"
            );
            MigrationError {
                version: migration.version,
                name: migration.name,
                source,
            }
        })?;
        applied += 1;
    }
    Ok(applied)
}

fn apply_step(conn: &Connection, migration: &Migration) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    (migration.up)(&tx)?;
    tx.pragma_update(None, "user_version", migration.version)?;
    tx.commit()
}

pub(crate) fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names.iter().any(|n| n == column))
}

fn add_column(conn: &Connection, table: &str, column: &str, decl: &str) -> rusqlite::Result<()> {
    if !has_column(conn, table, column)? {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl};"))?;
    }
    Ok(())
}

// --- Steps ---

fn v1_initial(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meals (
            cloud_id TEXT PRIMARY KEY NOT NULL,
            meal_id TEXT NOT NULL,
            user_uid TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            type TEXT NOT NULL DEFAULT 'other',
            name TEXT,
            photo_url TEXT,
            image_local TEXT,
            totals_kcal REAL NOT NULL DEFAULT 0,
            totals_protein REAL NOT NULL DEFAULT 0,
            totals_carbs REAL NOT NULL DEFAULT 0,
            totals_fat REAL NOT NULL DEFAULT 0,
            deleted INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL DEFAULT '',
            source TEXT NOT NULL DEFAULT 'manual',
            tags TEXT NOT NULL DEFAULT '[]'
        );

        CREATE INDEX IF NOT EXISTS idx_meals_user_timestamp ON meals(user_uid, timestamp DESC);

        CREATE TABLE IF NOT EXISTS op_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cloud_id TEXT NOT NULL,
            user_uid TEXT NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS images (
            image_id TEXT PRIMARY KEY NOT NULL,
            user_uid TEXT NOT NULL,
            local_path TEXT NOT NULL,
            cloud_url TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            updated_at TEXT NOT NULL
        );",
    )
}

fn v2_meal_notes(conn: &Connection) -> rusqlite::Result<()> {
    add_column(conn, "meals", "notes", "TEXT")
}

fn v3_sync_metadata(conn: &Connection) -> rusqlite::Result<()> {
    add_column(conn, "meals", "created_at", "TEXT")?;
    add_column(conn, "meals", "image_id", "TEXT")?;
    add_column(conn, "meals", "ingredients", "TEXT NOT NULL DEFAULT '[]'")?;
    add_column(conn, "meals", "sync_state", "TEXT NOT NULL DEFAULT 'synced'")?;
    add_column(conn, "meals", "upload_state", "TEXT")?;

    conn.execute(
        "UPDATE meals
         SET created_at = COALESCE(NULLIF(timestamp, ''), NULLIF(updated_at, ''), ?1)
         WHERE created_at IS NULL OR created_at = ''",
        params![now_iso()],
    )?;
    // Rows written before photo state was tracked: a local file means the upload never happened.
    conn.execute_batch(
        "UPDATE meals SET upload_state = 'pending'
         WHERE upload_state IS NULL AND image_local IS NOT NULL AND image_local != '';
         UPDATE meals SET upload_state = 'done'
         WHERE upload_state IS NULL AND photo_url IS NOT NULL AND photo_url != '';
         UPDATE meals SET sync_state = 'pending'
         WHERE cloud_id IN (SELECT cloud_id FROM op_queue);",
    )?;

    add_column(conn, "op_queue", "collection", "TEXT NOT NULL DEFAULT 'meals'")?;
    add_column(conn, "op_queue", "status", "TEXT NOT NULL DEFAULT 'pending'")?;
    add_column(conn, "op_queue", "last_error", "TEXT")?;
    add_column(conn, "op_queue", "next_attempt_at", "TEXT")?;

    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_meals_user_deleted_timestamp
            ON meals(user_uid, deleted, timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_op_queue_user_status ON op_queue(user_uid, status, id);

        CREATE TABLE IF NOT EXISTS settings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_uid TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            last_updated TEXT NOT NULL,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            UNIQUE(user_uid, key)
        );

        CREATE TABLE IF NOT EXISTS surveys (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_uid TEXT NOT NULL,
            form_data TEXT NOT NULL,
            completed_at TEXT NOT NULL,
            sync_status TEXT NOT NULL DEFAULT 'pending'
        );
        CREATE INDEX IF NOT EXISTS idx_surveys_user_completed ON surveys(user_uid, completed_at DESC);

        CREATE TABLE IF NOT EXISTS sync_cursors (
            user_uid TEXT NOT NULL,
            collection TEXT NOT NULL,
            cursor TEXT NOT NULL,
            PRIMARY KEY (user_uid, collection)
        );

        CREATE TABLE IF NOT EXISTS device_state (
            user_uid TEXT PRIMARY KEY NOT NULL,
            bootstrapped INTEGER NOT NULL DEFAULT 0,
            bootstrapped_at TEXT
        );",
    )
}
