use axum::extract::{Path, Query, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use rusqlite::params;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::db::models::Notification;
use crate::error::{AppError, AppResult};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/notifications/{user_id}", get(list))
        .route("/notifications/{notification_id}/read", put(mark_read))
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

async fn list(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<Notification>>> {
    let conn = state.db.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, user_id, kind, title, message, data, read, created_at
         FROM notifications
         WHERE user_id = ?1
         ORDER BY created_at DESC
         LIMIT ?2",
    )?;
    let notifications: Vec<Notification> = stmt
        .query_map(params![user_id, query.limit.max(1)], |row| {
            let data: String = row.get(5)?;
            Ok(Notification {
                id: row.get(0)?,
                user_id: row.get(1)?,
                kind: row.get(2)?,
                title: row.get(3)?,
                message: row.get(4)?,
                data: serde_json::from_str(&data).unwrap_or(Value::Null),
                read: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?
        .collect::<Result<_, _>>()?;

    Ok(Json(notifications))
}

async fn mark_read(
    State(state): State<AppState>,
    Path(notification_id): Path<String>,
) -> AppResult<Json<Value>> {
    let conn = state.db.get()?;
    let updated = conn.execute(
        "UPDATE notifications SET read = 1 WHERE id = ?1",
        params![notification_id],
    )?;
    if updated == 0 {
        return Err(AppError::NotFound("Notification"));
    }
    Ok(Json(json!({ "message": "Notification marked as read" })))
}
