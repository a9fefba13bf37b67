use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::challenges::repository::{
    ChallengeRepository, NewChallenge, SqliteChallengeRepository,
};
use crate::error::{AppError, AppResult};
use crate::notify;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/global-challenges/current", get(current))
        .route("/global-challenges/{challenge_id}/stats", get(stats))
        .route("/global-submissions", post(submit))
        .route("/global-submissions/{submission_id}/vote", post(vote))
        .route("/global-submissions/{submission_id}/comment", post(comment))
        .route("/global-feed", get(feed))
        .route("/admin/global-challenges", post(create).get(list_all))
        .route("/admin/global-challenges/{challenge_id}/activate", post(activate))
        .route("/admin/global-challenges/auto-schedule", post(auto_schedule))
        .route("/admin/update-challenge-status", post(sweep))
}

#[derive(Deserialize)]
struct CreateRequest {
    prompt: String,
    /// RFC 3339; defaults to now (immediately active).
    start_time: Option<String>,
    #[serde(default = "default_window")]
    promptness_window_minutes: i64,
    #[serde(default = "default_duration")]
    duration_hours: i64,
    #[serde(default = "default_true")]
    send_notifications: bool,
}

fn default_window() -> i64 {
    5
}

fn default_duration() -> i64 {
    6
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
struct SubmitRequest {
    challenge_id: String,
    description: String,
    user_id: String,
    photo_data: Option<String>,
}

#[derive(Deserialize)]
struct FeedQuery {
    user_id: String,
    challenge_id: Option<String>,
    #[serde(default)]
    friends_only: bool,
    #[serde(default = "default_feed_limit")]
    limit: i64,
}

fn default_feed_limit() -> i64 {
    50
}

#[derive(Deserialize)]
struct ActorRequest {
    user_id: String,
}

#[derive(Deserialize)]
struct CommentRequest {
    comment: String,
    user_id: String,
}

fn repo(state: &AppState) -> SqliteChallengeRepository {
    SqliteChallengeRepository::new(state.db.clone())
}

async fn current(State(state): State<AppState>) -> AppResult<Json<Value>> {
    match repo(&state).current(Utc::now()).await? {
        Some(current) => Ok(Json(json!({
            "challenge": current.challenge,
            "promptness_expired": current.promptness_expired,
            "time_remaining": current.time_remaining,
        }))),
        None => Ok(Json(json!({
            "challenge": null,
            "status": "no_active_challenge",
        }))),
    }
}

async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateRequest>,
) -> AppResult<Json<Value>> {
    let starts_at = match &req.start_time {
        Some(raw) => Some(
            raw.parse::<DateTime<Utc>>()
                .map_err(|_| AppError::Validation("start_time must be RFC 3339".into()))?,
        ),
        None => None,
    };

    let challenge = repo(&state)
        .create(
            NewChallenge {
                prompt: req.prompt,
                starts_at,
                promptness_window_minutes: req.promptness_window_minutes,
                duration_hours: req.duration_hours,
            },
            Utc::now(),
        )
        .await?;

    if req.send_notifications && challenge.status.is_active() {
        broadcast_challenge(&state, &challenge.id, &challenge.prompt)?;
    }

    Ok(Json(json!({
        "success": true,
        "challenge": challenge,
        "message": "Challenge created successfully",
    })))
}

/// Tell every user a new challenge just dropped. Best effort.
fn broadcast_challenge(state: &AppState, challenge_id: &str, prompt: &str) -> AppResult<()> {
    let conn = state.db.get()?;
    let user_ids: Vec<String> = {
        let mut stmt = conn.prepare("SELECT id FROM users LIMIT 1000")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };

    let preview: String = if prompt.chars().count() > 50 {
        format!("{}...", prompt.chars().take(50).collect::<String>())
    } else {
        prompt.to_string()
    };
    notify::notify_many(
        &conn,
        &user_ids,
        "global_challenge_drop",
        "New Global Challenge!",
        &format!("New Global Challenge: {}", preview),
        json!({ "challenge_id": challenge_id, "challenge_prompt": prompt }),
    );
    Ok(())
}

async fn list_all(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let challenges = repo(&state).list_all().await?;
    Ok(Json(json!(challenges)))
}

async fn activate(
    State(state): State<AppState>,
    Path(challenge_id): Path<String>,
) -> AppResult<Json<Value>> {
    repo(&state).activate(&challenge_id, Utc::now()).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Challenge activated",
    })))
}

async fn auto_schedule(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let challenges = repo(&state).auto_schedule(Utc::now()).await?;
    Ok(Json(json!({
        "success": true,
        "challenges_created": challenges.len(),
        "challenges": challenges,
        "message": format!("Successfully scheduled {} challenges", challenges.len()),
    })))
}

async fn sweep(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let outcome = repo(&state).sweep(Utc::now()).await?;
    Ok(Json(json!({
        "success": true,
        "expired_challenges": outcome.expired_challenges,
        "activated_challenges": outcome.activated_challenges,
        "current_active_challenge": outcome.current_active_challenge,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

async fn submit(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> AppResult<Json<Value>> {
    let submission = repo(&state)
        .submit(
            &req.challenge_id,
            &req.user_id,
            &req.description,
            req.photo_data.as_deref(),
            Utc::now(),
        )
        .await?;
    Ok(Json(json!(submission)))
}

async fn feed(
    State(state): State<AppState>,
    Query(query): Query<FeedQuery>,
) -> AppResult<Json<Value>> {
    let feed = repo(&state)
        .feed(
            &query.user_id,
            query.challenge_id.as_deref(),
            query.friends_only,
            query.limit,
        )
        .await?;

    match feed {
        Some(feed) => Ok(Json(json!(feed))),
        None => Ok(Json(json!({
            "status": "no_active_challenge",
            "submissions": [],
        }))),
    }
}

async fn vote(
    State(state): State<AppState>,
    Path(submission_id): Path<String>,
    Json(req): Json<ActorRequest>,
) -> AppResult<Json<Value>> {
    let outcome = repo(&state).vote(&submission_id, &req.user_id).await?;
    Ok(Json(json!({
        "voted": outcome.voted,
        "votes": outcome.votes,
    })))
}

async fn comment(
    State(state): State<AppState>,
    Path(submission_id): Path<String>,
    Json(req): Json<CommentRequest>,
) -> AppResult<Json<Value>> {
    let comment = repo(&state)
        .comment(&submission_id, &req.user_id, &req.comment, Utc::now())
        .await?;
    Ok(Json(json!({
        "message": "Comment added successfully",
        "comment": comment,
    })))
}

async fn stats(
    State(state): State<AppState>,
    Path(challenge_id): Path<String>,
) -> AppResult<Json<Value>> {
    let stats = repo(&state).stats(&challenge_id).await?;
    Ok(Json(json!({
        "challenge": stats.challenge,
        "stats": {
            "total_submissions": stats.total_submissions,
            "total_votes": stats.total_votes,
            "top_submissions": stats.top_submissions,
        },
    })))
}
