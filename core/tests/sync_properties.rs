use std::sync::{Arc, Mutex};

use serde_json::json;

use mealsync_core::db::{CursorUpdate, Database};
use mealsync_core::memory::{MemoryRemote, RemoteCall, RemoteWrite};
use mealsync_core::migrate::{self, LATEST_VERSION, MIGRATIONS};
use mealsync_core::models::{
    Collection, Ingredient, MealRecord, MealSource, MealUpdate, NewMeal, RemoteRecord, SyncState,
    UploadState, now_iso,
};
use mealsync_core::{Collaborators, RemoteError, SyncConfig, SyncEngine, SyncOutcome};

fn engine(remote: &Arc<MemoryRemote>) -> (SyncEngine, Arc<Mutex<Database>>) {
    let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
    let collaborators = Collaborators {
        documents: remote.clone(),
        files: remote.clone(),
        entitlements: remote.clone(),
        connectivity: remote.clone(),
    };
    (
        SyncEngine::new(db.clone(), collaborators, SyncConfig::default()),
        db,
    )
}

fn new_meal(name: &str) -> NewMeal {
    NewMeal {
        user_uid: "u1".to_string(),
        timestamp: None,
        meal_type: "lunch".to_string(),
        name: Some(name.to_string()),
        ingredients: Vec::new(),
        totals: None,
        notes: None,
        tags: Vec::new(),
        source: MealSource::Manual,
        local_photo: None,
    }
}

fn chicken(protein: f64) -> Ingredient {
    Ingredient {
        name: "chicken".to_string(),
        amount: 100.0,
        protein,
        ..Ingredient::default()
    }
}

fn remote_meal(id: &str, updated_at: &str, name: &str) -> MealRecord {
    MealRecord::decode(
        id,
        &json!({
            "userUid": "u1",
            "type": "dinner",
            "name": name,
            "timestamp": "2024-05-01T18:00:00.000Z",
            "updatedAt": updated_at,
        }),
    )
}

#[test]
fn test_applying_same_remote_record_twice_is_idempotent() {
    let db = Database::open_in_memory().unwrap();
    let record = remote_meal("m1", "2024-05-01T18:00:00.000Z", "Curry");

    let first = db
        .apply_remote_meals("u1", &[record.clone()], CursorUpdate::Advance)
        .unwrap();
    assert_eq!(first.inserted, 1);
    let after_first = db.get_meal("m1").unwrap().unwrap();

    let second = db
        .apply_remote_meals("u1", &[record], CursorUpdate::Advance)
        .unwrap();
    assert_eq!(second.unchanged, 1);
    assert_eq!(db.get_meal("m1").unwrap().unwrap(), after_first);
    assert!(db.queue_entries("u1").unwrap().is_empty());
}

#[test]
fn test_equal_timestamps_are_a_no_op() {
    let db = Database::open_in_memory().unwrap();
    let stamp = "2024-05-01T18:00:00.000Z";
    db.apply_remote_meals("u1", &[remote_meal("m1", stamp, "Curry")], CursorUpdate::Hold)
        .unwrap();

    let outcome = db
        .apply_remote_meals("u1", &[remote_meal("m1", stamp, "Other")], CursorUpdate::Hold)
        .unwrap();
    assert_eq!(outcome.unchanged, 1);
    let meal = db.get_meal("m1").unwrap().unwrap();
    assert_eq!(meal.name.as_deref(), Some("Curry"));
    assert_eq!(meal.sync_state, SyncState::Synced);
    assert!(db.queue_entries("u1").unwrap().is_empty());
}

#[tokio::test]
async fn test_newer_remote_wins_over_queued_local_edit() {
    let remote = Arc::new(MemoryRemote::new());
    let (engine, db) = engine(&remote);
    let meal = db.lock().unwrap().insert_meal(&new_meal("Local")).unwrap();
    remote.put_document(
        Collection::Meals,
        "u1",
        &meal.cloud_id,
        json!({"userUid": "u1", "name": "Remote", "timestamp": meal.timestamp, "updatedAt": "2999-01-01T00:00:00.000Z"}),
    );

    let pulled = engine.pull(Collection::Meals, "u1").await.unwrap();
    assert_eq!(pulled.outcome.updated, 1);
    let pushed = engine.push_pending("u1").await.unwrap();
    assert_eq!(pushed.skipped_stale, 1);

    let local = db.lock().unwrap().get_meal(&meal.cloud_id).unwrap().unwrap();
    let doc = remote.document(Collection::Meals, "u1", &meal.cloud_id).unwrap();
    assert_eq!(local.name.as_deref(), Some("Remote"));
    assert_eq!(doc["name"], json!("Remote"));
    assert_eq!(local.updated_at, "2999-01-01T00:00:00.000Z");
    assert!(db.lock().unwrap().queue_entries("u1").unwrap().is_empty());
}

#[test]
fn test_reopening_latest_store_runs_no_migrations() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meals.db");
    drop(Database::open(&path).unwrap());

    let conn = rusqlite::Connection::open(&path).unwrap();
    assert_eq!(migrate::schema_version(&conn).unwrap(), LATEST_VERSION);
    assert_eq!(migrate::run_migrations(&conn).unwrap(), 0);
}

#[test]
fn test_interrupted_migration_resumes_at_next_step() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meals.db");
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        assert_eq!(migrate::apply(&conn, &MIGRATIONS[..1]).unwrap(), 1);
        assert_eq!(migrate::schema_version(&conn).unwrap(), 1);
    }

    let conn = rusqlite::Connection::open(&path).unwrap();
    let applied = migrate::run_migrations(&conn).unwrap();
    assert_eq!(applied, MIGRATIONS.len() - 1);
    assert_eq!(migrate::schema_version(&conn).unwrap(), LATEST_VERSION);
    drop(conn);

    let db = Database::open(&path).unwrap();
    assert_eq!(db.schema_version().unwrap(), LATEST_VERSION);
}

#[tokio::test]
async fn test_photo_reaches_done_within_retries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lunch.jpg");
    std::fs::write(&path, b"jpeg").unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let (engine, db) = engine(&remote);
    let cloud_id = db
        .lock()
        .unwrap()
        .insert_meal(&NewMeal {
            local_photo: Some(path.display().to_string()),
            ..new_meal("Salad")
        })
        .unwrap()
        .cloud_id;
    remote.fail_next(RemoteCall::PutFile, RemoteError::Transient("503".into()));
    remote.fail_next(RemoteCall::PutFile, RemoteError::Timeout(std::time::Duration::from_secs(1)));

    for _ in 0..5 {
        let meal = db.lock().unwrap().get_meal(&cloud_id).unwrap().unwrap();
        if meal.photo.upload_state() == Some(UploadState::Done) {
            break;
        }
        assert!(path.exists());
        engine.upload_pending_photos("u1").await.unwrap();
    }

    let meal = db.lock().unwrap().get_meal(&cloud_id).unwrap().unwrap();
    assert_eq!(meal.photo.upload_state(), Some(UploadState::Done));
    assert!(meal.photo.url().is_some());
    assert!(meal.photo.local_uri().is_none());
    assert_eq!(remote.call_count(RemoteCall::PutFile), 3);

    engine.push_pending("u1").await.unwrap();
    let doc = remote.document(Collection::Meals, "u1", &cloud_id).unwrap();
    assert_eq!(doc["photoUrl"], json!(meal.photo.url()));
}

#[tokio::test]
async fn test_queue_drains_in_insertion_order() {
    let remote = Arc::new(MemoryRemote::new());
    let (engine, db) = engine(&remote);
    let ids: Vec<String> = {
        let db = db.lock().unwrap();
        ["A", "B", "C"]
            .iter()
            .map(|name| db.insert_meal(&new_meal(name)).unwrap().cloud_id)
            .collect()
    };

    let report = engine.push_pending("u1").await.unwrap();
    assert_eq!(report.applied, 3);
    let expected: Vec<RemoteWrite> = ids
        .into_iter()
        .map(|doc_id| RemoteWrite::Upsert {
            collection: Collection::Meals,
            doc_id,
        })
        .collect();
    assert_eq!(remote.writes(), expected);
}

#[tokio::test]
async fn test_offline_delete_propagates_without_resurrection() {
    let remote = Arc::new(MemoryRemote::new());
    let (engine, db) = engine(&remote);
    let meal = db.lock().unwrap().insert_meal(&new_meal("Toast")).unwrap();
    assert!(matches!(
        engine.sync_user("u1").await.unwrap(),
        SyncOutcome::Completed(_)
    ));

    remote.set_online(false);
    assert!(db.lock().unwrap().soft_delete_meal(&meal.cloud_id).unwrap());
    assert!(matches!(
        engine.sync_user("u1").await.unwrap(),
        SyncOutcome::Offline
    ));

    remote.set_online(true);
    engine.sync_user("u1").await.unwrap();
    let doc = remote.document(Collection::Meals, "u1", &meal.cloud_id).unwrap();
    assert_eq!(doc["deleted"], json!(true));
    assert_eq!(remote.document_count(Collection::Meals, "u1"), 1);
    assert!(matches!(
        remote.writes().last(),
        Some(RemoteWrite::MarkDeleted { .. })
    ));

    engine.sync_user("u1").await.unwrap();
    let local = db.lock().unwrap().get_meal(&meal.cloud_id).unwrap().unwrap();
    assert!(local.deleted);
    assert_eq!(local.sync_state, SyncState::Synced);
    let history = db.lock().unwrap().meal_history("u1", None, 10).unwrap();
    assert!(history.iter().all(|m| m.cloud_id != meal.cloud_id));
}

/// Local edit made offline at T2 beats a remote edit from another device at
/// T1.5; everyone ends up with the local value.
#[tokio::test]
async fn test_offline_edit_wins_over_older_remote_edit() {
    let t1 = "2024-01-01T00:00:00.000Z";
    let t1_5 = "2024-06-01T00:00:00.000Z";
    let remote = Arc::new(MemoryRemote::new());
    let (engine, db) = engine(&remote);
    let eaten_at = now_iso();
    remote.put_document(
        Collection::Meals,
        "u1",
        "M1",
        json!({
            "userUid": "u1",
            "type": "lunch",
            "timestamp": eaten_at,
            "updatedAt": t1,
            "ingredients": [{"name": "chicken", "amount": 100, "protein": 20}],
        }),
    );
    engine.sync_user("u1").await.unwrap();
    let seeded = db.lock().unwrap().get_meal("M1").unwrap().unwrap();
    assert_eq!(seeded.totals.protein, 20.0);
    assert_eq!(seeded.updated_at, t1);

    remote.set_online(false);
    let edited = db
        .lock()
        .unwrap()
        .update_meal(
            "M1",
            &MealUpdate {
                ingredients: Some(vec![chicken(25.0)]),
                ..MealUpdate::default()
            },
        )
        .unwrap();
    let t2 = edited.updated_at.clone();
    remote.put_document(
        Collection::Meals,
        "u1",
        "M1",
        json!({
            "userUid": "u1",
            "type": "lunch",
            "timestamp": eaten_at,
            "updatedAt": t1_5,
            "ingredients": [{"name": "chicken", "amount": 100, "protein": 22}],
        }),
    );
    remote.set_online(true);

    let pulled = engine.pull(Collection::Meals, "u1").await.unwrap();
    assert_eq!(pulled.outcome.local_newer, 1);
    assert_eq!(
        db.lock().unwrap().get_meal("M1").unwrap().unwrap().totals.protein,
        25.0
    );

    let pushed = engine.push_pending("u1").await.unwrap();
    assert_eq!(pushed.applied, 1);

    let doc = remote.document(Collection::Meals, "u1", "M1").unwrap();
    assert_eq!(doc["totals"]["protein"], json!(25.0));
    assert_eq!(doc["updatedAt"], json!(t2));
    let local = db.lock().unwrap().get_meal("M1").unwrap().unwrap();
    assert_eq!(local.totals.protein, 25.0);
    assert_eq!(local.updated_at, t2);
    assert_eq!(local.sync_state, SyncState::Synced);
}
