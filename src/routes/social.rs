use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use rusqlite::{params, Connection};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::notify;
use crate::routes::users::load_user;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users/{user_id}/follow", post(follow))
        .route("/users/{user_id}/unfollow", post(unfollow))
        .route("/users/{user_id}/following", get(following))
        .route("/users/{user_id}/followers", get(followers))
        .route(
            "/users/{user_id}/follow-status/{target_user_id}",
            get(follow_status),
        )
}

#[derive(Deserialize)]
struct FollowRequest {
    follower_id: String,
}

async fn follow(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(req): Json<FollowRequest>,
) -> AppResult<Json<Value>> {
    if user_id == req.follower_id {
        return Err(AppError::Validation("Cannot follow yourself".into()));
    }

    let conn = state.db.get()?;
    load_user(&conn, &user_id)?;
    let follower = load_user(&conn, &req.follower_id)?;

    let already: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM follows WHERE follower_id = ?1 AND following_id = ?2",
        params![req.follower_id, user_id],
        |row| row.get(0),
    )?;
    if already {
        return Err(AppError::Conflict("Already following this user".into()));
    }

    conn.execute(
        "INSERT INTO follows (follower_id, following_id) VALUES (?1, ?2)",
        params![req.follower_id, user_id],
    )?;

    notify::notify(
        &conn,
        &user_id,
        "new_follower",
        "New Follower!",
        &format!("{} started following you!", follower.username),
        json!({ "follower_id": req.follower_id }),
    );

    Ok(Json(json!({
        "success": true,
        "message": "Successfully followed user",
    })))
}

async fn unfollow(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(req): Json<FollowRequest>,
) -> AppResult<Json<Value>> {
    let conn = state.db.get()?;
    let deleted = conn.execute(
        "DELETE FROM follows WHERE follower_id = ?1 AND following_id = ?2",
        params![req.follower_id, user_id],
    )?;
    if deleted == 0 {
        return Err(AppError::NotFound("Follow relationship"));
    }

    Ok(Json(json!({
        "success": true,
        "message": "Successfully unfollowed user",
    })))
}

fn user_summaries(conn: &Connection, ids: &[String]) -> AppResult<Vec<Value>> {
    ids.iter()
        .map(|id| {
            let user = load_user(conn, id)?;
            Ok(json!({
                "id": user.id,
                "username": user.username,
                "full_name": user.full_name,
                "avatar_color": user.avatar_color,
            }))
        })
        .collect()
}

async fn following(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> AppResult<Json<Value>> {
    let conn = state.db.get()?;
    let ids = following_ids(&conn, &user_id)?;
    Ok(Json(json!(user_summaries(&conn, &ids)?)))
}

async fn followers(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> AppResult<Json<Value>> {
    let conn = state.db.get()?;
    let ids: Vec<String> = {
        let mut stmt =
            conn.prepare("SELECT follower_id FROM follows WHERE following_id = ?1")?;
        let rows = stmt.query_map(params![user_id], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    Ok(Json(json!(user_summaries(&conn, &ids)?)))
}

async fn follow_status(
    State(state): State<AppState>,
    Path((user_id, target_user_id)): Path<(String, String)>,
) -> AppResult<Json<Value>> {
    let conn = state.db.get()?;
    let is_following: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM follows WHERE follower_id = ?1 AND following_id = ?2",
        params![user_id, target_user_id],
        |row| row.get(0),
    )?;
    Ok(Json(json!({ "is_following": is_following })))
}

pub fn following_ids(conn: &Connection, user_id: &str) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT following_id FROM follows WHERE follower_id = ?1")?;
    let rows = stmt.query_map(params![user_id], |row| row.get(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}
