use anyhow::Result;

use mealsync_core::db::Database;
use mealsync_core::models::SyncStatus;

pub(crate) fn cmd_status(db: &Database, user_uid: &str, json: bool) -> Result<()> {
    let status = db.sync_status(user_uid)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    for line in status_lines(&status) {
        println!("{line}");
    }
    Ok(())
}

fn status_lines(status: &SyncStatus) -> Vec<String> {
    let mut lines = vec![
        format!("User:            {}", status.user_uid),
        format!("Schema version:  {}", status.schema_version),
        format!(
            "Meals:           {} ({} deleted)",
            status.meals, status.deleted_meals
        ),
        format!("Unsynced meals:  {}", status.unsynced_meals),
        format!("Pending photos:  {}", status.pending_photos),
        format!(
            "Queue:           {} pending, {} failed",
            status.queue.pending, status.queue.failed
        ),
    ];
    if let Some(oldest) = &status.queue.oldest_pending {
        lines.push(format!("Oldest pending:  {oldest}"));
    }
    lines.push(format!(
        "Initial sync:    {}",
        if status.bootstrapped { "done" } else { "not yet" }
    ));
    lines.push(format!(
        "Meals cursor:    {}",
        status.meals_cursor.as_deref().unwrap_or("-")
    ));
    if status.conflicted_meals > 0 || status.queue.failed > 0 {
        lines.push(format!(
            "\n{} meal(s) need attention. Run `mealsync queue` to inspect, `mealsync retry` to try again.",
            status.conflicted_meals
        ));
    }
    lines
}
