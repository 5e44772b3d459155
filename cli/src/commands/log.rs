use anyhow::{Context, Result, bail};
use std::path::PathBuf;

use mealsync_core::db::Database;
use mealsync_core::models::{MealRecord, MealSource, NewMeal, NutritionTotals};

use super::helpers::{local_time, parse_ingredient, parse_timestamp};

pub(crate) struct LogArgs {
    pub name: String,
    pub meal: String,
    pub ingredients: Vec<String>,
    pub kcal: Option<f64>,
    pub protein: Option<f64>,
    pub carbs: Option<f64>,
    pub fat: Option<f64>,
    pub at: Option<String>,
    pub note: Option<String>,
    pub tags: Vec<String>,
    pub photo: Option<PathBuf>,
}

pub(crate) fn cmd_log(db: &Database, user_uid: &str, args: &LogArgs, json: bool) -> Result<()> {
    let meal = log_meal(db, user_uid, args)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&meal)?);
    } else {
        let name = meal.name.as_deref().unwrap_or("?");
        let kcal = meal.totals.kcal;
        let time = local_time(&meal.timestamp);
        let id = &meal.cloud_id;
        println!("Logged {name} for {} at {time}: {kcal:.0} kcal [{id}]", meal.meal_type);
        if meal.photo.local_uri().is_some() {
            println!("Photo will upload on the next sync");
        }
    }
    Ok(())
}

fn log_meal(db: &Database, user_uid: &str, args: &LogArgs) -> Result<MealRecord> {
    let ingredients = args
        .ingredients
        .iter()
        .map(|spec| parse_ingredient(spec))
        .collect::<Result<Vec<_>>>()?;

    let has_totals = [args.kcal, args.protein, args.carbs, args.fat]
        .iter()
        .any(Option::is_some);
    if has_totals && !ingredients.is_empty() {
        bail!("Give either --ingredient or --kcal/--protein/--carbs/--fat, not both");
    }
    let totals = has_totals.then(|| NutritionTotals {
        kcal: args.kcal.unwrap_or(0.0),
        protein: args.protein.unwrap_or(0.0),
        carbs: args.carbs.unwrap_or(0.0),
        fat: args.fat.unwrap_or(0.0),
    });
    if totals.is_some_and(|t| [t.kcal, t.protein, t.carbs, t.fat].iter().any(|v| *v < 0.0)) {
        bail!("Nutrition values cannot be negative");
    }

    let local_photo = args
        .photo
        .as_ref()
        .map(|path| {
            std::fs::canonicalize(path)
                .with_context(|| format!("Photo not found: {}", path.display()))
                .map(|p| p.display().to_string())
        })
        .transpose()?;

    let timestamp = args.at.as_deref().map(parse_timestamp).transpose()?;

    db.insert_meal(&NewMeal {
        user_uid: user_uid.to_string(),
        timestamp,
        meal_type: args.meal.clone(),
        name: Some(args.name.clone()),
        ingredients,
        totals,
        notes: args.note.clone(),
        tags: args.tags.clone(),
        source: MealSource::Manual,
        local_photo,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mealsync_core::models::UploadState;

    fn args(name: &str) -> LogArgs {
        LogArgs {
            name: name.to_string(),
            meal: "lunch".to_string(),
            ingredients: Vec::new(),
            kcal: None,
            protein: None,
            carbs: None,
            fat: None,
            at: None,
            note: None,
            tags: Vec::new(),
            photo: None,
        }
    }

    #[test]
    fn test_log_with_ingredients_sums_totals() {
        let db = Database::open_in_memory().unwrap();
        let meal = log_meal(
            &db,
            "u1",
            &LogArgs {
                ingredients: vec![
                    "rice:150:195:4:42:0.5".to_string(),
                    "chicken:100:165:31:0:3.6".to_string(),
                ],
                ..args("Bowl")
            },
        )
        .unwrap();
        assert!((meal.totals.kcal - 360.0).abs() < 1e-9);
        assert!((meal.totals.protein - 35.0).abs() < 1e-9);
        assert_eq!(db.queue_stats("u1").unwrap().pending, 1);
    }

    #[test]
    fn test_log_with_explicit_totals() {
        let db = Database::open_in_memory().unwrap();
        let meal = log_meal(
            &db,
            "u1",
            &LogArgs {
                kcal: Some(500.0),
                protein: Some(20.0),
                at: Some("2024-03-01T12:00:00Z".to_string()),
                ..args("Pizza")
            },
        )
        .unwrap();
        assert!((meal.totals.kcal - 500.0).abs() < f64::EPSILON);
        assert_eq!(meal.timestamp, "2024-03-01T12:00:00.000Z");
    }

    #[test]
    fn test_log_rejects_mixed_inputs() {
        let db = Database::open_in_memory().unwrap();
        let result = log_meal(
            &db,
            "u1",
            &LogArgs {
                kcal: Some(100.0),
                ingredients: vec!["rice:100".to_string()],
                ..args("Mixed")
            },
        );
        assert!(result.is_err());
        assert_eq!(db.queue_stats("u1").unwrap().pending, 0);
    }

    #[test]
    fn test_log_with_photo_is_pending_upload() {
        let dir = tempfile::tempdir().unwrap();
        let photo = dir.path().join("plate.jpg");
        std::fs::write(&photo, b"jpeg").unwrap();
        let db = Database::open_in_memory().unwrap();

        let meal = log_meal(
            &db,
            "u1",
            &LogArgs {
                photo: Some(photo),
                ..args("Salad")
            },
        )
        .unwrap();
        assert_eq!(meal.photo.upload_state(), Some(UploadState::Pending));

        let missing = log_meal(
            &db,
            "u1",
            &LogArgs {
                photo: Some(dir.path().join("nope.jpg")),
                ..args("Ghost")
            },
        );
        assert!(missing.is_err());
    }
}
