mod commands;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

use crate::commands::{
    cmd_delete, cmd_log, cmd_meals, cmd_photo, cmd_queue, cmd_retry, cmd_setting_get,
    cmd_setting_list, cmd_setting_set, cmd_status,
};
use crate::config::Config;
use mealsync_core::db::Database;

#[derive(Parser)]
#[command(
    name = "mealsync",
    version,
    about = "Inspect and maintain the offline meal store",
    long_about = "Inspect and maintain the offline meal store.\n\n\
        Every change made here is queued for the sync engine exactly like an \
        in-app edit; nothing is sent to the remote store by this tool."
)]
struct Cli {
    /// Path to the store (default: platform data directory)
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,
    /// User whose records to operate on
    #[arg(long, global = true, env = "MEALSYNC_USER")]
    user: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show schema version, queue depth and sync bookkeeping
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List meals for a day (defaults to today)
    Meals {
        /// Date to show (YYYY-MM-DD or today/yesterday)
        #[arg(long, conflicts_with = "days")]
        date: Option<String>,
        /// Show the last N days instead
        #[arg(long)]
        days: Option<u32>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Log a meal by hand
    Log {
        /// Meal name
        name: String,
        /// Meal type: breakfast, lunch, dinner, snack, other
        #[arg(short, long, default_value = "snack")]
        meal: String,
        /// Ingredient as "name:grams[:kcal:protein:carbs:fat]" (repeatable)
        #[arg(short, long = "ingredient", value_name = "SPEC")]
        ingredients: Vec<String>,
        /// Total calories (ignored when ingredients are given)
        #[arg(long)]
        kcal: Option<f64>,
        /// Total protein in grams
        #[arg(long)]
        protein: Option<f64>,
        /// Total carbs in grams
        #[arg(long)]
        carbs: Option<f64>,
        /// Total fat in grams
        #[arg(long)]
        fat: Option<f64>,
        /// When it was eaten (RFC 3339, YYYY-MM-DD or today/yesterday; default: now)
        #[arg(long)]
        at: Option<String>,
        /// Free-form note
        #[arg(long)]
        note: Option<String>,
        /// Tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Local photo to upload on the next sync
        #[arg(long, value_name = "PATH")]
        photo: Option<PathBuf>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Soft-delete a meal
    Delete {
        /// Meal cloud ID
        cloud_id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Attach a local photo to a meal
    Photo {
        /// Meal cloud ID
        cloud_id: String,
        /// Image file on this device
        path: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List queued operations, oldest first
    Queue {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Re-queue operations that were given up on
    Retry {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Read and write synced settings
    Setting {
        #[command(subcommand)]
        command: SettingCommands,
    },
}

#[derive(Subcommand)]
enum SettingCommands {
    /// Set a value (queued for sync)
    Set {
        key: String,
        value: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one value
    Get {
        key: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show all values
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("MEALSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.db)?;
    let db = Database::open(&config.db_path)?;
    let user = || {
        cli.user
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .context("No user given. Pass --user or set MEALSYNC_USER")
    };

    match cli.command {
        Commands::Status { json } => cmd_status(&db, user()?, json),
        Commands::Meals { date, days, json } => cmd_meals(&db, user()?, date, days, json),
        Commands::Log {
            name,
            meal,
            ingredients,
            kcal,
            protein,
            carbs,
            fat,
            at,
            note,
            tags,
            photo,
            json,
        } => cmd_log(
            &db,
            user()?,
            &commands::LogArgs {
                name,
                meal,
                ingredients,
                kcal,
                protein,
                carbs,
                fat,
                at,
                note,
                tags,
                photo,
            },
            json,
        ),
        Commands::Delete { cloud_id, json } => cmd_delete(&db, &cloud_id, json),
        Commands::Photo {
            cloud_id,
            path,
            json,
        } => cmd_photo(&db, &cloud_id, &path, json),
        Commands::Queue { json } => cmd_queue(&db, user()?, json),
        Commands::Retry { json } => cmd_retry(&db, user()?, json),
        Commands::Setting { command } => match command {
            SettingCommands::Set { key, value, json } => {
                cmd_setting_set(&db, user()?, &key, &value, json)
            }
            SettingCommands::Get { key, json } => cmd_setting_get(&db, user()?, &key, json),
            SettingCommands::List { json } => cmd_setting_list(&db, user()?, json),
        },
    }
}
