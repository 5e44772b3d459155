use anyhow::{Result, bail};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

// --- Timestamps ---

/// Milliseconds since the epoch for an RFC 3339 (or bare ISO) timestamp.
/// Missing or unparseable input maps to 0 so it always sorts first.
#[must_use]
pub fn timestamp_millis(s: &str) -> i64 {
    let s = s.trim();
    if s.is_empty() {
        return 0;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.timestamp_millis();
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return ndt.and_utc().timestamp_millis();
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map_or(0, |ndt| ndt.and_utc().timestamp_millis());
    }
    0
}

#[must_use]
pub fn format_millis(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Rewrite a parseable stamp as UTC with millisecond precision so stored
/// stamps order correctly as text. Anything unparseable is kept as is.
#[must_use]
pub fn normalize_timestamp(s: &str) -> String {
    match timestamp_millis(s) {
        0 => s.to_string(),
        ms => format_millis(ms),
    }
}

#[must_use]
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The `updated_at` for a mutation of a record last stamped `previous`:
/// now, but never earlier than one millisecond after `previous`.
#[must_use]
pub fn next_updated_at(previous: Option<&str>) -> String {
    let now = Utc::now().timestamp_millis();
    let floor = previous.map_or(0, |p| timestamp_millis(p) + 1);
    format_millis(now.max(floor))
}

// --- Enumerations ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Synced,
    Pending,
    Conflict,
}

impl SyncState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Conflict => "conflict",
        }
    }

    /// Unknown values decode as `Pending` so the record is pushed again.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "synced" => Self::Synced,
            "conflict" => Self::Conflict,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Pending,
    Done,
}

impl UploadState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MealSource {
    Manual,
    Ai,
    Barcode,
}

impl MealSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Ai => "ai",
            Self::Barcode => "barcode",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "ai" | "camera" | "vision" => Self::Ai,
            "barcode" => Self::Barcode,
            _ => Self::Manual,
        }
    }
}

/// Remote collection a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Meals,
    Settings,
    Surveys,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Self::Meals, Self::Settings, Self::Surveys];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Meals => "meals",
            Self::Settings => "settings",
            Self::Surveys => "surveys",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "meals" => Ok(Self::Meals),
            "settings" => Ok(Self::Settings),
            "surveys" => Ok(Self::Surveys),
            _ => bail!("Unknown collection '{s}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

impl OpKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Accepts the legacy `upsert` spelling written by schema v1 queues.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" | "upsert" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => bail!("Unknown op kind '{s}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    Pending,
    /// Abandoned after exhausting retries or a permanent rejection.
    Failed,
}

impl OpStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Self {
        if s == "failed" {
            Self::Failed
        } else {
            Self::Pending
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Pending,
    Uploaded,
    Failed,
}

impl ImageStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploaded => "uploaded",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "uploaded" => Self::Uploaded,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

pub const MEAL_TYPES: &[&str] = &["breakfast", "lunch", "dinner", "snack", "other"];

pub fn validate_meal_type(meal: &str) -> Result<String> {
    let lower = meal.to_lowercase();
    if MEAL_TYPES.contains(&lower.as_str()) {
        Ok(lower)
    } else {
        bail!(
            "Invalid meal type '{meal}'. Must be one of: {}",
            MEAL_TYPES.join(", ")
        )
    }
}

// --- Meals ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ingredient {
    pub name: String,
    /// Grams.
    pub amount: f64,
    pub protein: f64,
    pub fat: f64,
    pub carbs: f64,
    pub kcal: f64,
}

impl Ingredient {
    fn decode(data: &Value) -> Self {
        Ingredient {
            name: str_at(data, "name").unwrap_or_default(),
            amount: f64_at(data, "amount"),
            protein: f64_at(data, "protein"),
            fat: f64_at(data, "fat"),
            carbs: f64_at(data, "carbs"),
            kcal: f64_at(data, "kcal"),
        }
    }

    fn encode(&self) -> Value {
        json!({
            "name": self.name,
            "amount": self.amount,
            "protein": self.protein,
            "fat": self.fat,
            "carbs": self.carbs,
            "kcal": self.kcal,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NutritionTotals {
    pub kcal: f64,
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
}

impl NutritionTotals {
    #[must_use]
    pub fn from_ingredients(ingredients: &[Ingredient]) -> Self {
        ingredients
            .iter()
            .fold(NutritionTotals::default(), |acc, i| NutritionTotals {
                kcal: acc.kcal + i.kcal,
                protein: acc.protein + i.protein,
                carbs: acc.carbs + i.carbs,
                fat: acc.fat + i.fat,
            })
    }
}

/// Where the meal photo lives. Only one location is authoritative at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum PhotoState {
    #[default]
    None,
    /// Captured on device, not yet in remote storage.
    Pending { local_uri: String },
    /// Durable remote copy.
    Uploaded { url: String },
}

impl PhotoState {
    #[must_use]
    pub fn upload_state(&self) -> Option<UploadState> {
        match self {
            Self::None => None,
            Self::Pending { .. } => Some(UploadState::Pending),
            Self::Uploaded { .. } => Some(UploadState::Done),
        }
    }

    #[must_use]
    pub fn local_uri(&self) -> Option<&str> {
        match self {
            Self::Pending { local_uri } => Some(local_uri),
            _ => None,
        }
    }

    #[must_use]
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Uploaded { url } => Some(url),
            _ => None,
        }
    }

    /// Rebuild from the stored columns. A pending local file wins over a stale URL.
    #[must_use]
    pub fn from_columns(
        photo_url: Option<String>,
        image_local: Option<String>,
        upload_state: Option<&str>,
    ) -> Self {
        let photo_url = photo_url.filter(|s| !s.is_empty());
        let image_local = image_local.filter(|s| !s.is_empty());
        match (upload_state, image_local, photo_url) {
            (Some("done"), _, Some(url)) => Self::Uploaded { url },
            (_, Some(local_uri), _) => Self::Pending { local_uri },
            (_, None, Some(url)) => Self::Uploaded { url },
            (_, None, None) => Self::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MealRecord {
    pub cloud_id: String,
    pub meal_id: String,
    pub user_uid: String,
    pub timestamp: String,
    pub meal_type: String,
    pub name: Option<String>,
    pub ingredients: Vec<Ingredient>,
    pub totals: NutritionTotals,
    pub photo: PhotoState,
    pub image_id: Option<String>,
    pub notes: Option<String>,
    pub tags: Vec<String>,
    pub deleted: bool,
    pub created_at: String,
    pub updated_at: String,
    pub source: MealSource,
    pub sync_state: SyncState,
}

#[derive(Debug, Clone)]
pub struct NewMeal {
    pub user_uid: String,
    /// Defaults to now.
    pub timestamp: Option<String>,
    pub meal_type: String,
    pub name: Option<String>,
    pub ingredients: Vec<Ingredient>,
    /// Computed from `ingredients` when absent.
    pub totals: Option<NutritionTotals>,
    pub notes: Option<String>,
    pub tags: Vec<String>,
    pub source: MealSource,
    pub local_photo: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MealUpdate {
    pub timestamp: Option<String>,
    pub meal_type: Option<String>,
    pub name: Option<String>,
    pub ingredients: Option<Vec<Ingredient>>,
    pub totals: Option<NutritionTotals>,
    pub notes: Option<String>,
    pub tags: Option<Vec<String>>,
}

impl MealUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timestamp.is_none()
            && self.meal_type.is_none()
            && self.name.is_none()
            && self.ingredients.is_none()
            && self.totals.is_none()
            && self.notes.is_none()
            && self.tags.is_none()
    }
}

/// A record type that is exchanged with the remote document store.
pub trait RemoteRecord: Sized {
    const COLLECTION: Collection;

    /// Total decoder: never fails, substitutes defaults for anything missing.
    fn decode(doc_id: &str, data: &Value) -> Self;

    fn encode(&self) -> Value;

    fn doc_id(&self) -> String;
}

impl RemoteRecord for MealRecord {
    const COLLECTION: Collection = Collection::Meals;

    fn decode(doc_id: &str, data: &Value) -> Self {
        let timestamp = str_at(data, "timestamp")
            .map(|ts| normalize_timestamp(&ts))
            .unwrap_or_default();
        let updated_at = str_at(data, "updatedAt")
            .or_else(|| str_at(data, "lastUpdated"))
            .unwrap_or_default();
        let created_at = str_at(data, "createdAt")
            .or_else(|| (!timestamp.is_empty()).then(|| timestamp.clone()))
            .or_else(|| (!updated_at.is_empty()).then(|| updated_at.clone()))
            .unwrap_or_else(now_iso);
        let timestamp = if timestamp.is_empty() {
            created_at.clone()
        } else {
            timestamp
        };

        let ingredients: Vec<Ingredient> = data
            .get("ingredients")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter(|v| v.is_object())
                    .map(Ingredient::decode)
                    .collect()
            })
            .unwrap_or_default();

        let totals = match data
            .get("totals")
            .or_else(|| data.get("nutrition"))
            .filter(|v| v.is_object())
        {
            Some(t) => NutritionTotals {
                kcal: f64_at(t, "kcal"),
                protein: f64_at(t, "protein"),
                carbs: f64_at(t, "carbs"),
                fat: f64_at(t, "fat"),
            },
            None => NutritionTotals::from_ingredients(&ingredients),
        };

        let cloud_id = str_at(data, "cloudId").unwrap_or_else(|| doc_id.to_string());
        let meal_id = str_at(data, "mealId").unwrap_or_else(|| cloud_id.clone());

        MealRecord {
            photo: PhotoState::from_columns(str_at(data, "photoUrl"), None, None),
            image_id: str_at(data, "imageId"),
            user_uid: str_at(data, "userUid").unwrap_or_default(),
            meal_type: str_at(data, "type")
                .or_else(|| str_at(data, "mealType"))
                .unwrap_or_else(|| "other".to_string()),
            name: str_at(data, "name"),
            notes: str_at(data, "notes"),
            tags: strings_at(data, "tags"),
            deleted: bool_at(data, "deleted"),
            source: MealSource::parse(&str_at(data, "source").unwrap_or_default()),
            sync_state: SyncState::parse(
                &str_at(data, "syncState").unwrap_or_else(|| "synced".to_string()),
            ),
            cloud_id,
            meal_id,
            timestamp,
            ingredients,
            totals,
            created_at,
            updated_at,
        }
    }

    fn encode(&self) -> Value {
        json!({
            "mealId": self.meal_id,
            "cloudId": self.cloud_id,
            "userUid": self.user_uid,
            "timestamp": self.timestamp,
            "type": self.meal_type,
            "name": self.name,
            "ingredients": self.ingredients.iter().map(Ingredient::encode).collect::<Vec<_>>(),
            "totals": {
                "kcal": self.totals.kcal,
                "protein": self.totals.protein,
                "carbs": self.totals.carbs,
                "fat": self.totals.fat,
            },
            "photoUrl": self.photo.url(),
            "imageId": self.image_id,
            "notes": self.notes,
            "tags": self.tags,
            "deleted": self.deleted,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
            "source": self.source.as_str(),
            "syncState": self.sync_state.as_str(),
        })
    }

    fn doc_id(&self) -> String {
        self.cloud_id.clone()
    }
}

// --- Settings and surveys ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingRecord {
    pub user_uid: String,
    pub key: String,
    pub value: String,
    pub last_updated: String,
    pub sync_status: SyncState,
}

impl SettingRecord {
    /// Decode a document pulled on behalf of `user_uid`, which stands in
    /// when the document carries no `userUid`.
    #[must_use]
    pub fn decode_for_user(user_uid: &str, doc_id: &str, data: &Value) -> Self {
        let user_uid = str_at(data, "userUid").unwrap_or_else(|| user_uid.to_string());
        // Document ids are `{user}_{key}`; fall back to that when `key` is absent.
        let key = str_at(data, "key").unwrap_or_else(|| {
            doc_id
                .strip_prefix(&format!("{user_uid}_"))
                .unwrap_or(doc_id)
                .to_string()
        });
        SettingRecord {
            value: str_at(data, "value").unwrap_or_default(),
            last_updated: str_at(data, "lastUpdated").unwrap_or_default(),
            sync_status: SyncState::Synced,
            user_uid,
            key,
        }
    }
}

impl RemoteRecord for SettingRecord {
    const COLLECTION: Collection = Collection::Settings;

    fn decode(doc_id: &str, data: &Value) -> Self {
        SettingRecord::decode_for_user("", doc_id, data)
    }

    fn encode(&self) -> Value {
        json!({
            "userUid": self.user_uid,
            "key": self.key,
            "value": self.value,
            "lastUpdated": self.last_updated,
            "syncStatus": SyncState::Synced.as_str(),
        })
    }

    fn doc_id(&self) -> String {
        format!("{}_{}", self.user_uid, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurveyRecord {
    /// Local row id; 0 for records that only exist remotely.
    pub id: i64,
    pub user_uid: String,
    /// Serialized questionnaire answers (JSON text).
    pub form_data: String,
    pub completed_at: String,
    pub sync_status: SyncState,
}

impl RemoteRecord for SurveyRecord {
    const COLLECTION: Collection = Collection::Surveys;

    fn decode(doc_id: &str, data: &Value) -> Self {
        let form_data = match data.get("formData") {
            Some(Value::String(s)) => s.clone(),
            Some(v @ Value::Object(_)) => v.to_string(),
            _ => "{}".to_string(),
        };
        SurveyRecord {
            id: 0,
            user_uid: str_at(data, "userUid").unwrap_or_else(|| doc_id.to_string()),
            form_data,
            completed_at: str_at(data, "completedAt").unwrap_or_default(),
            sync_status: SyncState::Synced,
        }
    }

    fn encode(&self) -> Value {
        json!({
            "userUid": self.user_uid,
            "formData": self.form_data,
            "completedAt": self.completed_at,
            "syncStatus": SyncState::Synced.as_str(),
        })
    }

    /// The remote keeps a single, latest snapshot per user.
    fn doc_id(&self) -> String {
        self.user_uid.clone()
    }
}

// --- Queue and images ---

#[derive(Debug, Clone, Serialize)]
pub struct OpQueueEntry {
    pub id: i64,
    pub cloud_id: String,
    pub user_uid: String,
    pub collection: Collection,
    pub kind: OpKind,
    /// Encoded remote document (JSON text).
    pub payload: String,
    pub updated_at: String,
    pub attempts: i64,
    pub status: OpStatus,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageRecord {
    pub image_id: String,
    pub user_uid: String,
    pub local_path: String,
    pub cloud_url: Option<String>,
    pub status: ImageStatus,
    pub updated_at: String,
}

// --- Results ---

/// Result of applying one batch of remote records to the local store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullOutcome {
    /// Remote-only records adopted locally.
    pub inserted: i64,
    /// Local copies overwritten by a newer remote.
    pub updated: i64,
    /// Identical timestamps on both sides.
    pub unchanged: i64,
    /// Local copy is newer; it is (re)queued for push.
    pub local_newer: i64,
    pub max_updated_at: Option<String>,
}

impl PullOutcome {
    pub fn absorb(&mut self, other: &PullOutcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.local_newer += other.local_newer;
        self.max_updated_at = max_timestamp(self.max_updated_at.take(), other.max_updated_at.clone());
    }
}

#[must_use]
pub fn max_timestamp(a: Option<String>, b: Option<String>) -> Option<String> {
    match (a, b) {
        (Some(a), Some(b)) => {
            if timestamp_millis(&b) > timestamp_millis(&a) {
                Some(b)
            } else {
                Some(a)
            }
        }
        (a, None) => a,
        (None, b) => b,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub failed: i64,
    pub oldest_pending: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub user_uid: String,
    pub schema_version: u32,
    pub meals: i64,
    pub deleted_meals: i64,
    pub unsynced_meals: i64,
    pub conflicted_meals: i64,
    pub pending_photos: i64,
    pub queue: QueueStats,
    pub bootstrapped: bool,
    pub meals_cursor: Option<String>,
}

// --- Defaulting field access ---

fn str_at(data: &Value, key: &str) -> Option<String> {
    match data.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn f64_at(data: &Value, key: &str) -> f64 {
    let value = match data.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };
    if value.is_finite() { value } else { 0.0 }
}

fn bool_at(data: &Value, key: &str) -> bool {
    match data.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::String(s)) => s == "true" || s == "1",
        _ => false,
    }
}

fn strings_at(data: &Value, key: &str) -> Vec<String> {
    match data.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Parse a JSON object from stored text, yielding an empty object on garbage.
#[must_use]
pub fn parse_object(text: &str) -> Value {
    match serde_json::from_str::<Value>(text) {
        Ok(v @ Value::Object(_)) => v,
        _ => Value::Object(Map::new()),
    }
}
