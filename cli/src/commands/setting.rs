use anyhow::Result;
use std::process;
use tabled::{Table, Tabled, settings::Style};

use mealsync_core::db::Database;

use super::helpers::{json_error, truncate};

pub(crate) fn cmd_setting_set(
    db: &Database,
    user_uid: &str,
    key: &str,
    value: &str,
    json: bool,
) -> Result<()> {
    let setting = db.set_setting(user_uid, key, value)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&setting)?);
    } else {
        println!("{key} = {value} (queued for sync)");
    }
    Ok(())
}

pub(crate) fn cmd_setting_get(db: &Database, user_uid: &str, key: &str, json: bool) -> Result<()> {
    let Some(setting) = db.get_setting(user_uid, key)? else {
        if json {
            println!("{}", json_error(&format!("Setting '{key}' not found")));
        } else {
            eprintln!("Setting '{key}' not found");
        }
        process::exit(2);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&setting)?);
    } else {
        println!("{}", setting.value);
    }
    Ok(())
}

pub(crate) fn cmd_setting_list(db: &Database, user_uid: &str, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct SettingRow {
        #[tabled(rename = "Key")]
        key: String,
        #[tabled(rename = "Value")]
        value: String,
        #[tabled(rename = "Updated")]
        updated: String,
        #[tabled(rename = "Sync")]
        sync: String,
    }

    let settings = db.list_settings(user_uid)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(());
    }
    if settings.is_empty() {
        println!("No settings");
        return Ok(());
    }

    let rows: Vec<SettingRow> = settings
        .iter()
        .map(|s| SettingRow {
            key: s.key.clone(),
            value: truncate(&s.value, 40),
            updated: s.last_updated.clone(),
            sync: s.sync_status.as_str().to_string(),
        })
        .collect();
    let table = Table::new(&rows).with(Style::rounded()).to_string();
    println!("{table}");
    Ok(())
}
