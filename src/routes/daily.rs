use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{NaiveDate, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::daily::domain::{DailyActivity, NewCatalogActivity};
use crate::daily::repository::{DailyActivityRepository, SqliteDailyActivityRepository};
use crate::error::{AppError, AppResult};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/daily-global-activity/current", get(current))
        .route("/daily-global-activity/complete", post(complete))
        .route("/daily-global-activity/feed", get(feed))
        .route("/admin/activity-catalog/reseed", post(reseed_catalog))
}

#[derive(Deserialize)]
struct DateQuery {
    /// YYYY-MM-DD; defaults to today (UTC).
    date: Option<String>,
}

#[derive(Deserialize)]
struct CompleteRequest {
    user_id: String,
    #[serde(default)]
    description: String,
    photo_data: Option<String>,
    date: Option<String>,
}

#[derive(Deserialize)]
struct FeedQuery {
    user_id: String,
    #[serde(default)]
    friends_only: bool,
    date: Option<String>,
}

#[derive(Deserialize)]
struct ReseedRequest {
    activities: Vec<NewCatalogActivity>,
}

fn repo(state: &AppState) -> SqliteDailyActivityRepository {
    SqliteDailyActivityRepository::new(state.db.clone())
}

fn resolve_date(date: &Option<String>) -> AppResult<NaiveDate> {
    match date {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| AppError::Validation("date must be YYYY-MM-DD".into())),
        None => Ok(Utc::now().date_naive()),
    }
}

async fn current(
    State(state): State<AppState>,
    Query(query): Query<DateQuery>,
) -> AppResult<Json<DailyActivity>> {
    let date = resolve_date(&query.date)?;
    let mut rng = StdRng::from_entropy();
    Ok(Json(repo(&state).current(date, &mut rng).await?))
}

async fn complete(
    State(state): State<AppState>,
    Json(req): Json<CompleteRequest>,
) -> AppResult<Json<Value>> {
    let date = resolve_date(&req.date)?;
    let mut rng = StdRng::from_entropy();
    let completion = repo(&state)
        .complete(
            date,
            &req.user_id,
            &req.description,
            req.photo_data.as_deref(),
            Utc::now(),
            &mut rng,
        )
        .await?;
    Ok(Json(json!({
        "success": true,
        "completion": completion,
    })))
}

async fn feed(
    State(state): State<AppState>,
    Query(query): Query<FeedQuery>,
) -> AppResult<Json<Value>> {
    let date = resolve_date(&query.date)?;
    let mut rng = StdRng::from_entropy();
    let feed = repo(&state)
        .feed(date, &query.user_id, query.friends_only, &mut rng)
        .await?;
    Ok(Json(json!(feed)))
}

async fn reseed_catalog(
    State(state): State<AppState>,
    Json(req): Json<ReseedRequest>,
) -> AppResult<Json<Value>> {
    let count = repo(&state).reseed_catalog(req.activities).await?;
    Ok(Json(json!({
        "success": true,
        "activities_seeded": count,
    })))
}
