use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::AppResult;
use crate::groups::domain::Group;
use crate::groups::repository::{GroupRepository, JoinOutcome, NewGroup, SqliteGroupRepository};
use crate::notify;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/groups", post(create_group).get(list_groups))
        .route("/groups/join-by-code", post(join_by_code))
        .route("/groups/{group_id}", get(get_group))
        .route("/groups/{group_id}/join", post(join_group))
        .route("/groups/{group_id}/set-submission-day", post(set_submission_day))
        .route("/groups/{group_id}/start-weekly-submissions", post(start_week))
        .route("/groups/{group_id}/submit-activity", post(submit_activity))
        .route("/groups/{group_id}/weekly-activities", get(weekly_activities))
        .route("/groups/{group_id}/current-day-activity", get(current_day_activity))
        .route("/groups/{group_id}/reveal-daily-activity", post(reveal_daily_activity))
        .route("/groups/{group_id}/complete-activity", post(complete_activity))
        .route("/groups/{group_id}/complete-daily-activity", post(complete_daily_activity))
        .route("/groups/{group_id}/weekly-rankings", get(weekly_rankings))
        .route("/groups/{group_id}/daily-feed", get(daily_feed))
        .route("/users/{user_id}/groups", get(user_groups))
}

#[derive(Deserialize)]
struct CreateGroupRequest {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_category")]
    category: String,
    #[serde(default)]
    is_public: bool,
    user_id: String,
}

fn default_category() -> String {
    "fitness".into()
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default = "default_list_limit")]
    limit: i64,
}

fn default_list_limit() -> i64 {
    20
}

#[derive(Deserialize)]
struct ActorRequest {
    user_id: String,
}

#[derive(Deserialize)]
struct JoinByCodeRequest {
    invite_code: String,
    user_id: String,
}

#[derive(Deserialize)]
struct AdminRequest {
    admin_id: String,
}

#[derive(Deserialize)]
struct SubmissionDayRequest {
    submission_day: String,
    admin_id: String,
}

#[derive(Deserialize)]
struct SubmitActivityRequest {
    activity_title: String,
    #[serde(default)]
    activity_description: String,
    user_id: String,
}

#[derive(Deserialize)]
struct RevealRequest {
    admin_id: String,
    day_number: i64,
}

#[derive(Deserialize)]
struct CompleteActivityRequest {
    activity_submission_id: String,
    #[serde(default)]
    completion_proof: String,
    #[serde(default)]
    completion_description: String,
    user_id: String,
}

#[derive(Deserialize)]
struct CompleteCurrentRequest {
    #[serde(default)]
    completion_proof: String,
    #[serde(default)]
    completion_description: String,
    user_id: String,
}

#[derive(Deserialize)]
struct DailyFeedQuery {
    user_id: String,
    #[serde(default)]
    friends_only: bool,
}

fn repo(state: &AppState) -> SqliteGroupRepository {
    SqliteGroupRepository::new(state.db.clone())
}

fn notify_join(state: &AppState, outcome: &JoinOutcome) {
    let conn = match state.db.get() {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!("Failed to deliver join notifications: {}", e);
            return;
        }
    };
    for member_id in &outcome.other_members {
        notify::notify(
            &conn,
            member_id,
            "group_join",
            "New Group Member!",
            &format!("{} joined {}", outcome.username, outcome.group_name),
            json!({ "group_id": outcome.group_id }),
        );
    }
}

async fn create_group(
    State(state): State<AppState>,
    Json(req): Json<CreateGroupRequest>,
) -> AppResult<Json<Group>> {
    let mut rng = StdRng::from_entropy();
    let group = repo(&state)
        .create(
            NewGroup {
                name: req.name,
                description: req.description,
                category: req.category,
                is_public: req.is_public,
                created_by: req.user_id,
            },
            &mut rng,
        )
        .await?;
    Ok(Json(group))
}

async fn list_groups(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<Group>>> {
    Ok(Json(repo(&state).list_public(query.limit.max(1)).await?))
}

async fn get_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> AppResult<Json<Group>> {
    Ok(Json(repo(&state).get(&group_id).await?))
}

async fn user_groups(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> AppResult<Json<Vec<Group>>> {
    Ok(Json(repo(&state).groups_for_user(&user_id).await?))
}

async fn join_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(req): Json<ActorRequest>,
) -> AppResult<Json<Value>> {
    let outcome = repo(&state).join(&group_id, &req.user_id).await?;
    notify_join(&state, &outcome);
    Ok(Json(json!({
        "message": "Successfully joined group",
        "group_id": outcome.group_id,
    })))
}

async fn join_by_code(
    State(state): State<AppState>,
    Json(req): Json<JoinByCodeRequest>,
) -> AppResult<Json<Value>> {
    let outcome = repo(&state)
        .join_by_code(&req.invite_code, &req.user_id)
        .await?;
    notify_join(&state, &outcome);
    Ok(Json(json!({
        "success": true,
        "message": "Successfully joined group",
        "group_id": outcome.group_id,
    })))
}

async fn set_submission_day(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(req): Json<SubmissionDayRequest>,
) -> AppResult<Json<Value>> {
    repo(&state)
        .set_submission_day(&group_id, &req.admin_id, &req.submission_day)
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Submission day set to {}", req.submission_day),
    })))
}

async fn start_week(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(req): Json<AdminRequest>,
) -> AppResult<Json<Value>> {
    let week_start = repo(&state)
        .start_week(&group_id, &req.admin_id, Utc::now())
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": "Weekly submission phase started",
        "week_start": week_start,
    })))
}

async fn submit_activity(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(req): Json<SubmitActivityRequest>,
) -> AppResult<Json<Value>> {
    let outcome = repo(&state)
        .submit_activity(
            &group_id,
            &req.user_id,
            &req.activity_title,
            &req.activity_description,
            Utc::now(),
        )
        .await?;
    Ok(Json(json!({
        "success": true,
        "submission_count": outcome.submission_count,
        "remaining": outcome.remaining,
    })))
}

async fn weekly_activities(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> AppResult<Json<Value>> {
    let activities = repo(&state).weekly_activities(&group_id).await?;
    Ok(Json(json!(activities)))
}

async fn current_day_activity(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> AppResult<Json<Value>> {
    let group = repo(&state).get(&group_id).await?;
    Ok(Json(json!({ "activity": group.current_day_activity })))
}

async fn reveal_daily_activity(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(req): Json<RevealRequest>,
) -> AppResult<Json<Value>> {
    // The reveal may come from the admin or the scheduled automation; the
    // engine itself only validates week state.
    let _ = req.admin_id;
    let mut rng = StdRng::from_entropy();
    let outcome = repo(&state)
        .reveal_day(&group_id, req.day_number, Utc::now(), &mut rng)
        .await?;

    if outcome.already_revealed {
        return Ok(Json(json!({
            "message": "Activity already revealed for this day",
            "revealed_activity": outcome.revealed_activity,
        })));
    }
    Ok(Json(json!({
        "success": true,
        "day_number": req.day_number,
        "message": format!(
            "Day {} activity revealed: {}",
            req.day_number, outcome.revealed_activity.title
        ),
        "revealed_activity": outcome.revealed_activity,
    })))
}

async fn complete_activity(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(req): Json<CompleteActivityRequest>,
) -> AppResult<Json<Value>> {
    let receipt = repo(&state)
        .complete_submission(
            &group_id,
            &req.activity_submission_id,
            &req.user_id,
            &req.completion_proof,
            &req.completion_description,
            Utc::now(),
        )
        .await?;
    Ok(Json(json!({
        "success": true,
        "points_earned": receipt.points_earned,
        "completion_order": receipt.completion_order,
        "message": format!("Activity completed! Earned {} points", receipt.points_earned),
    })))
}

async fn complete_daily_activity(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(req): Json<CompleteCurrentRequest>,
) -> AppResult<Json<Value>> {
    let receipt = repo(&state)
        .complete_current(
            &group_id,
            &req.user_id,
            &req.completion_proof,
            &req.completion_description,
            Utc::now(),
        )
        .await?;
    Ok(Json(json!({
        "success": true,
        "points_earned": receipt.points_earned,
        "completion_order": receipt.completion_order,
        "message": format!("Activity completed! Earned {} points", receipt.points_earned),
    })))
}

async fn weekly_rankings(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> AppResult<Json<Value>> {
    let rankings = repo(&state).rankings(&group_id).await?;
    Ok(Json(json!({ "rankings": rankings })))
}

async fn daily_feed(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Query(query): Query<DailyFeedQuery>,
) -> AppResult<Json<Value>> {
    let feed = repo(&state)
        .daily_feed(&group_id, &query.user_id, query.friends_only)
        .await?;
    Ok(Json(json!(feed)))
}
