use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use rusqlite::{params, Connection};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::db::models::Submission;
use crate::error::{AppError, AppResult};
use crate::notify;
use crate::routes::users::load_user;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/submissions", post(create_submission))
        .route("/groups/{group_id}/submissions", get(group_submissions))
        .route("/submissions/feed", get(member_feed))
        .route("/rankings/weekly", get(weekly_leaderboard))
        .route("/rankings/alltime", get(alltime_leaderboard))
}

#[derive(Deserialize)]
struct CreateSubmission {
    group_id: String,
    challenge_type: String,
    description: String,
    user_id: String,
    photo_data: Option<String>,
}

#[derive(Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

#[derive(Deserialize)]
struct FeedQuery {
    user_id: String,
    #[serde(default = "default_feed_limit")]
    limit: i64,
}

#[derive(Deserialize)]
struct LeaderboardQuery {
    #[serde(default = "default_board_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    20
}

fn default_feed_limit() -> i64 {
    50
}

fn default_board_limit() -> i64 {
    10
}

fn map_submission(row: &rusqlite::Row<'_>) -> rusqlite::Result<Submission> {
    let reactions: String = row.get(8)?;
    Ok(Submission {
        id: row.get(0)?,
        user_id: row.get(1)?,
        username: row.get(2)?,
        group_id: row.get(3)?,
        challenge_type: row.get(4)?,
        description: row.get(5)?,
        photo_data: row.get(6)?,
        votes: row.get(7)?,
        reactions: serde_json::from_str(&reactions).unwrap_or(Value::Null),
        created_at: row.get(9)?,
    })
}

const SUBMISSION_COLUMNS: &str =
    "id, user_id, username, group_id, challenge_type, description, photo_data, votes, reactions, created_at";

async fn create_submission(
    State(state): State<AppState>,
    Json(req): Json<CreateSubmission>,
) -> AppResult<Json<Submission>> {
    let conn = state.db.get()?;

    let members = group_member_ids(&conn, &req.group_id)?;
    if !members.contains(&req.user_id) {
        return Err(AppError::Forbidden("Not a member of this group".into()));
    }
    let user = load_user(&conn, &req.user_id)?;

    let submission_id = uuid::Uuid::now_v7().to_string();
    conn.execute(
        "INSERT INTO submissions
         (id, user_id, username, group_id, challenge_type, description, photo_data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            submission_id,
            req.user_id,
            user.username,
            req.group_id,
            req.challenge_type,
            req.description,
            req.photo_data
        ],
    )?;
    conn.execute(
        "UPDATE users SET total_activities = total_activities + 1,
                          current_streak = current_streak + 1
         WHERE id = ?1",
        params![req.user_id],
    )?;

    for member_id in members.iter().filter(|m| *m != &req.user_id) {
        notify::notify(
            &conn,
            member_id,
            "new_activity",
            "New Activity Posted!",
            &format!("{} completed the {} challenge", user.username, req.challenge_type),
            json!({ "group_id": req.group_id, "submission_id": submission_id }),
        );
    }

    let submission = conn.query_row(
        &format!("SELECT {} FROM submissions WHERE id = ?1", SUBMISSION_COLUMNS),
        params![submission_id],
        map_submission,
    )?;
    Ok(Json(submission))
}

async fn group_submissions(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> AppResult<Json<Vec<Submission>>> {
    let conn = state.db.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM submissions WHERE group_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        SUBMISSION_COLUMNS
    ))?;
    let submissions: Vec<Submission> = stmt
        .query_map(params![group_id, query.limit.max(1)], map_submission)?
        .collect::<Result<_, _>>()?;
    Ok(Json(submissions))
}

async fn member_feed(
    State(state): State<AppState>,
    Query(query): Query<FeedQuery>,
) -> AppResult<Json<Vec<Submission>>> {
    let conn = state.db.get()?;
    load_user(&conn, &query.user_id)?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM submissions
         WHERE group_id IN (SELECT group_id FROM group_members WHERE user_id = ?1)
         ORDER BY created_at DESC LIMIT ?2",
        SUBMISSION_COLUMNS
    ))?;
    let submissions: Vec<Submission> = stmt
        .query_map(params![query.user_id, query.limit.max(1)], map_submission)?
        .collect::<Result<_, _>>()?;
    Ok(Json(submissions))
}

async fn weekly_leaderboard(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> AppResult<Json<Value>> {
    let conn = state.db.get()?;
    leaderboard(
        &conn,
        "WHERE created_at >= datetime('now', '-7 days')",
        "weekly",
        query.limit,
    )
}

async fn alltime_leaderboard(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> AppResult<Json<Value>> {
    let conn = state.db.get()?;
    leaderboard(&conn, "", "all-time", query.limit)
}

/// Count-of-posts leaderboard over the free-form submissions.
fn leaderboard(
    conn: &Connection,
    filter: &str,
    period: &str,
    limit: i64,
) -> AppResult<Json<Value>> {
    let sql = format!(
        "SELECT user_id, username, COUNT(*) AS activity_count
         FROM submissions
         {}
         GROUP BY user_id
         ORDER BY activity_count DESC
         LIMIT ?1",
        filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows: Vec<(String, String, i64)> = stmt
        .query_map(params![limit.max(1)], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<Result<_, _>>()?;

    let entries: Vec<Value> = rows
        .into_iter()
        .enumerate()
        .map(|(i, (user_id, username, count))| {
            json!({
                "rank": i + 1,
                "user_id": user_id,
                "username": username,
                "activity_count": count,
                "period": period,
            })
        })
        .collect();

    Ok(Json(json!(entries)))
}

pub fn group_member_ids(conn: &Connection, group_id: &str) -> AppResult<Vec<String>> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM groups WHERE id = ?1",
        params![group_id],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(AppError::NotFound("Group"));
    }
    let mut stmt = conn.prepare("SELECT user_id FROM group_members WHERE group_id = ?1")?;
    let rows = stmt.query_map(params![group_id], |row| row.get(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}
