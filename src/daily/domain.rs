// Domain types for the global daily activity - pure, no side effects
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Reveal window: the day's activity surfaces at a random minute between
/// 05:00 and midnight UTC.
pub const WINDOW_START_HOUR: u32 = 5;
pub const WINDOW_MINUTES: i64 = 19 * 60;

/// Draw the moment the day's pick goes live, uniform over the window.
pub fn pick_selected_at<R: Rng>(rng: &mut R, date: NaiveDate) -> DateTime<Utc> {
    let window_open = date
        .and_hms_opt(WINDOW_START_HOUR, 0, 0)
        .expect("window start is a valid time")
        .and_utc();
    window_open + Duration::minutes(rng.gen_range(0..WINDOW_MINUTES))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogActivity {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub difficulty: String,
    pub estimated_minutes: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCatalogActivity {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_difficulty")]
    pub difficulty: String,
    #[serde(default = "default_minutes")]
    pub estimated_minutes: i64,
}

fn default_category() -> String {
    "general".into()
}

fn default_difficulty() -> String {
    "easy".into()
}

fn default_minutes() -> i64 {
    15
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyActivity {
    pub id: String,
    pub activity_id: String,
    pub date: String,
    pub selected_at: String,
    pub activity_title: String,
    pub activity_description: String,
    pub participant_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyCompletion {
    pub id: String,
    pub daily_activity_id: String,
    pub user_id: String,
    pub username: String,
    pub description: String,
    pub photo_data: Option<String>,
    pub votes: i64,
    pub completed_at: String,
}
