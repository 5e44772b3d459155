use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use mealsync_core::models::{Ingredient, MealRecord, PhotoState, format_millis};

pub(crate) fn parse_date(date_str: Option<String>) -> Result<NaiveDate> {
    match date_str {
        None => Ok(Local::now().date_naive()),
        Some(s) => match s.as_str() {
            "today" => Ok(Local::now().date_naive()),
            "yesterday" => Ok(Local::now().date_naive() - chrono::Duration::days(1)),
            _ => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .with_context(|| format!("Invalid date '{s}'. Use YYYY-MM-DD or today/yesterday")),
        },
    }
}

/// Turn `--at` into a stored timestamp. A bare date keeps the current time of
/// day so the meal sorts after anything logged earlier that day.
pub(crate) fn parse_timestamp(s: &str) -> Result<String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(format_millis(dt.timestamp_millis()));
    }
    let date = parse_date(Some(s.to_string()))?;
    let local = Local
        .from_local_datetime(&date.and_time(Local::now().time()))
        .earliest()
        .with_context(|| format!("'{s}' does not exist in the local time zone"))?;
    Ok(format_millis(local.with_timezone(&Utc).timestamp_millis()))
}

/// Parse `name:grams[:kcal:protein:carbs:fat]`.
pub(crate) fn parse_ingredient(spec: &str) -> Result<Ingredient> {
    let parts: Vec<&str> = spec.split(':').map(str::trim).collect();
    if parts.len() != 2 && parts.len() != 6 {
        bail!("Invalid ingredient '{spec}'. Use 'name:grams' or 'name:grams:kcal:protein:carbs:fat'");
    }
    let name = parts[0];
    if name.is_empty() {
        bail!("Ingredient name cannot be empty in '{spec}'");
    }
    let number = |field: &str, raw: &str| -> Result<f64> {
        let value: f64 = raw
            .trim_end_matches('g')
            .parse()
            .with_context(|| format!("Invalid {field} '{raw}' in '{spec}'"))?;
        if value < 0.0 {
            bail!("{field} cannot be negative in '{spec}'");
        }
        Ok(value)
    };

    let mut ingredient = Ingredient {
        name: name.to_string(),
        amount: number("grams", parts[1])?,
        ..Ingredient::default()
    };
    if parts.len() == 6 {
        ingredient.kcal = number("kcal", parts[2])?;
        ingredient.protein = number("protein", parts[3])?;
        ingredient.carbs = number("carbs", parts[4])?;
        ingredient.fat = number("fat", parts[5])?;
    }
    Ok(ingredient)
}

pub(crate) fn photo_label(photo: &PhotoState) -> &'static str {
    match photo {
        PhotoState::None => "-",
        PhotoState::Pending { .. } => "pending",
        PhotoState::Uploaded { .. } => "uploaded",
    }
}

/// Local wall-clock time of a stored timestamp, for tables.
pub(crate) fn local_time(timestamp: &str) -> String {
    DateTime::parse_from_rfc3339(timestamp).map_or_else(
        |_| timestamp.to_string(),
        |dt| dt.with_timezone(&Local).format("%H:%M").to_string(),
    )
}

pub(crate) fn print_meal_table(meals: &[MealRecord]) {
    #[derive(Tabled)]
    struct MealRow {
        #[tabled(rename = "Time")]
        time: String,
        #[tabled(rename = "Meal")]
        meal_type: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "kcal")]
        kcal: String,
        #[tabled(rename = "P")]
        protein: String,
        #[tabled(rename = "C")]
        carbs: String,
        #[tabled(rename = "F")]
        fat: String,
        #[tabled(rename = "Photo")]
        photo: String,
        #[tabled(rename = "Sync")]
        sync: String,
        #[tabled(rename = "ID")]
        id: String,
    }

    let rows: Vec<MealRow> = meals
        .iter()
        .map(|m| MealRow {
            time: local_time(&m.timestamp),
            meal_type: m.meal_type.clone(),
            name: m.name.as_deref().map(|n| truncate(n, 30)).unwrap_or_default(),
            kcal: format!("{:.0}", no_neg_zero(m.totals.kcal)),
            protein: format!("{:.0}", no_neg_zero(m.totals.protein)),
            carbs: format!("{:.0}", no_neg_zero(m.totals.carbs)),
            fat: format!("{:.0}", no_neg_zero(m.totals.fat)),
            photo: photo_label(&m.photo).to_string(),
            sync: m.sync_state.as_str().to_string(),
            id: m.cloud_id.clone(),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..7)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

pub(crate) fn no_neg_zero(v: f64) -> f64 {
    if v == 0.0 { 0.0 } else { v }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date_none() {
        let today = Local::now().date_naive();
        assert_eq!(parse_date(None).unwrap(), today);
    }

    #[test]
    fn test_parse_date_keywords() {
        let today = Local::now().date_naive();
        assert_eq!(parse_date(Some("today".into())).unwrap(), today);
        assert_eq!(
            parse_date(Some("yesterday".into())).unwrap(),
            today - chrono::Duration::days(1)
        );
    }

    #[test]
    fn test_parse_date_invalid() {
        assert!(parse_date(Some("15/01/2024".into())).is_err());
    }

    #[test]
    fn test_parse_timestamp_rfc3339_normalised_to_utc() {
        assert_eq!(
            parse_timestamp("2024-01-15T13:30:00+01:00").unwrap(),
            "2024-01-15T12:30:00.000Z"
        );
    }

    #[test]
    fn test_parse_timestamp_date_lands_on_that_day() {
        let stamp = parse_timestamp("2024-01-15").unwrap();
        let local = DateTime::parse_from_rfc3339(&stamp)
            .unwrap()
            .with_timezone(&Local);
        assert_eq!(local.date_naive(), NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
    }

    #[test]
    fn test_parse_ingredient_short_and_full() {
        let short = parse_ingredient("rice:150g").unwrap();
        assert_eq!(short.name, "rice");
        assert!((short.amount - 150.0).abs() < f64::EPSILON);
        assert!(short.kcal.abs() < f64::EPSILON);

        let full = parse_ingredient("chicken:100:165:31:0:3.6").unwrap();
        assert!((full.kcal - 165.0).abs() < f64::EPSILON);
        assert!((full.protein - 31.0).abs() < f64::EPSILON);
        assert!((full.fat - 3.6).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_ingredient_invalid() {
        assert!(parse_ingredient("rice").is_err());
        assert!(parse_ingredient(":100").is_err());
        assert!(parse_ingredient("rice:lots").is_err());
        assert!(parse_ingredient("rice:-5").is_err());
        assert!(parse_ingredient("a:1:2:3").is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a very long meal name", 10), "a very ...");
    }

    #[test]
    fn test_json_error_escapes() {
        assert_eq!(json_error("bad \"id\""), r#"{"error":"bad \"id\""}"#);
    }
}
