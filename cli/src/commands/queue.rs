use anyhow::Result;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use mealsync_core::db::Database;
use mealsync_core::models::OpQueueEntry;

use super::helpers::truncate;

pub(crate) fn cmd_queue(db: &Database, user_uid: &str, json: bool) -> Result<()> {
    let entries = db.queue_entries(user_uid)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }
    print_queue_table(&entries);
    Ok(())
}

pub(crate) fn cmd_retry(db: &Database, user_uid: &str, json: bool) -> Result<()> {
    let requeued = db.requeue_failed(user_uid)?;
    if json {
        println!("{}", serde_json::json!({ "requeued": requeued }));
    } else if requeued == 0 {
        println!("No failed operations");
    } else {
        println!("Re-queued {requeued} operation(s); they will be retried on the next sync");
    }
    Ok(())
}

fn print_queue_table(entries: &[OpQueueEntry]) {
    #[derive(Tabled)]
    struct QueueRow {
        #[tabled(rename = "#")]
        id: i64,
        #[tabled(rename = "Collection")]
        collection: String,
        #[tabled(rename = "Op")]
        kind: String,
        #[tabled(rename = "Record")]
        record: String,
        #[tabled(rename = "Status")]
        status: String,
        #[tabled(rename = "Tries")]
        attempts: i64,
        #[tabled(rename = "Next try")]
        next_attempt: String,
        #[tabled(rename = "Last error")]
        last_error: String,
    }

    let rows: Vec<QueueRow> = entries
        .iter()
        .map(|e| QueueRow {
            id: e.id,
            collection: e.collection.as_str().to_string(),
            kind: e.kind.as_str().to_string(),
            record: e.cloud_id.clone(),
            status: e.status.as_str().to_string(),
            attempts: e.attempts,
            next_attempt: e.next_attempt_at.clone().unwrap_or_else(|| "-".into()),
            last_error: e
                .last_error
                .as_deref()
                .map(|err| truncate(err, 40))
                .unwrap_or_default(),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::single(5)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}
