use anyhow::{Context, Result, bail};
use chrono::{Duration, Local, NaiveDate};
use serde::Serialize;
use std::path::Path;
use std::process;

use mealsync_core::db::Database;
use mealsync_core::models::MealRecord;

use super::helpers::{json_error, no_neg_zero, parse_date, print_meal_table};

#[derive(Serialize)]
struct DayMeals {
    date: NaiveDate,
    total_kcal: f64,
    meals: Vec<MealRecord>,
}

fn collect_days(
    db: &Database,
    user_uid: &str,
    date: Option<String>,
    days: Option<u32>,
) -> Result<Vec<DayMeals>> {
    let dates: Vec<NaiveDate> = match days {
        Some(0) => bail!("--days must be at least 1"),
        Some(n) => {
            let today = Local::now().date_naive();
            (0..i64::from(n))
                .rev()
                .map(|offset| today - Duration::days(offset))
                .collect()
        }
        None => vec![parse_date(date)?],
    };

    dates
        .into_iter()
        .map(|date| {
            let meals = db.meals_for_day(user_uid, date)?;
            let total_kcal = meals.iter().map(|m| m.totals.kcal).sum();
            Ok(DayMeals {
                date,
                total_kcal,
                meals,
            })
        })
        .collect()
}

pub(crate) fn cmd_meals(
    db: &Database,
    user_uid: &str,
    date: Option<String>,
    days: Option<u32>,
    json: bool,
) -> Result<()> {
    let listing = collect_days(db, user_uid, date, days)?;

    if json {
        if days.is_some() {
            println!("{}", serde_json::to_string_pretty(&listing)?);
        } else if let Some(day) = listing.first() {
            println!("{}", serde_json::to_string_pretty(day)?);
        }
        return Ok(());
    }

    if listing.iter().all(|d| d.meals.is_empty()) {
        eprintln!("No meals logged");
        process::exit(2);
    }

    for day in &listing {
        if day.meals.is_empty() && days.is_some() {
            continue;
        }
        let date = day.date;
        let kcal = no_neg_zero(day.total_kcal);
        println!("=== {date} ({kcal:.0} kcal) ===");
        print_meal_table(&day.meals);
        println!();
    }
    Ok(())
}

pub(crate) fn cmd_delete(db: &Database, cloud_id: &str, json: bool) -> Result<()> {
    if db.soft_delete_meal(cloud_id)? {
        if json {
            println!("{}", serde_json::json!({ "deleted": cloud_id }));
        } else {
            println!("Deleted meal {cloud_id} (queued for sync)");
        }
        Ok(())
    } else {
        if json {
            println!("{}", json_error(&format!("Meal {cloud_id} not found")));
        } else {
            eprintln!("Meal {cloud_id} not found");
        }
        process::exit(2);
    }
}

pub(crate) fn cmd_photo(db: &Database, cloud_id: &str, path: &Path, json: bool) -> Result<()> {
    let meal = attach_photo(db, cloud_id, path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&meal)?);
    } else {
        let local = meal.photo.local_uri().unwrap_or_default();
        println!("Attached {local} to meal {cloud_id}; it will upload on the next sync");
    }
    Ok(())
}

fn attach_photo(db: &Database, cloud_id: &str, path: &Path) -> Result<MealRecord> {
    if !path.is_file() {
        bail!("Photo not found: {}", path.display());
    }
    let absolute = std::fs::canonicalize(path)
        .with_context(|| format!("Failed to resolve {}", path.display()))?;
    db.attach_local_photo(cloud_id, &absolute.display().to_string())
}
