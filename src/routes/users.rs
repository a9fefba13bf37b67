use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::seq::SliceRandom;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::session::{create_session, delete_session};
use crate::auth::{hash_password, verify_password};
use crate::db::models::{Achievement, User, UserStats};
use crate::error::{AppError, AppResult};
use crate::notify;
use crate::state::AppState;

const AVATAR_COLORS: &[&str] = &[
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FCEA2B", "#FF9F43", "#6C5CE7", "#FD79A8",
];

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/users/search", get(search_users))
        .route("/users/{user_id}", get(get_user))
        .route("/achievements/{user_id}", get(get_achievements))
}

#[derive(Deserialize)]
struct RegisterRequest {
    username: String,
    email: String,
    password: String,
    full_name: String,
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct LogoutRequest {
    session_id: String,
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
}

pub fn load_user(conn: &Connection, user_id: &str) -> AppResult<User> {
    let mut user = conn
        .query_row(
            "SELECT id, username, email, full_name, avatar_color, total_activities,
                    current_streak, total_groups_joined, created_at
             FROM users WHERE id = ?1",
            params![user_id],
            map_user,
        )
        .optional()?
        .ok_or(AppError::NotFound("User"))?;

    let mut stmt =
        conn.prepare("SELECT group_id FROM group_members WHERE user_id = ?1 ORDER BY joined_at")?;
    let rows = stmt.query_map(params![user_id], |row| row.get(0))?;
    user.groups = rows.collect::<Result<_, _>>()?;
    user.achievements = unlocked_achievements(&user.stats)
        .iter()
        .map(|a| a.id.to_string())
        .collect();

    Ok(user)
}

fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        full_name: row.get(3)?,
        avatar_color: row.get(4)?,
        groups: Vec::new(),
        achievements: Vec::new(),
        stats: UserStats {
            total_activities: row.get(5)?,
            current_streak: row.get(6)?,
            total_groups_joined: row.get(7)?,
        },
        created_at: row.get(8)?,
    })
}

/// Achievements are derived from stats thresholds at read time.
fn unlocked_achievements(stats: &UserStats) -> Vec<Achievement> {
    let mut achievements = Vec::new();
    if stats.total_activities >= 1 {
        achievements.push(Achievement {
            id: "first_activity",
            name: "First Step",
            description: "Completed your first activity",
            icon: "🎯",
        });
    }
    if stats.total_activities >= 10 {
        achievements.push(Achievement {
            id: "activity_master",
            name: "Activity Master",
            description: "Completed 10 activities",
            icon: "🏆",
        });
    }
    if stats.total_groups_joined >= 1 {
        achievements.push(Achievement {
            id: "team_player",
            name: "Team Player",
            description: "Joined your first group",
            icon: "🤝",
        });
    }
    if stats.current_streak >= 7 {
        achievements.push(Achievement {
            id: "week_warrior",
            name: "Week Warrior",
            description: "7 day activity streak",
            icon: "🔥",
        });
    }
    achievements
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> AppResult<Json<User>> {
    if req.username.trim().is_empty() || req.email.trim().is_empty() {
        return Err(AppError::Validation(
            "username and email are required".into(),
        ));
    }

    let conn = state.db.get()?;
    let taken: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM users WHERE username = ?1 OR email = ?2",
        params![req.username, req.email],
        |row| row.get(0),
    )?;
    if taken {
        return Err(AppError::Conflict(
            "Username or email already exists".into(),
        ));
    }

    let user_id = uuid::Uuid::now_v7().to_string();
    let avatar_color = AVATAR_COLORS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("#FF6B6B");
    conn.execute(
        "INSERT INTO users (id, username, email, password_hash, full_name, avatar_color)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            user_id,
            req.username.trim(),
            req.email.trim(),
            hash_password(&req.password),
            req.full_name,
            avatar_color
        ],
    )?;

    notify::notify(
        &conn,
        &user_id,
        "welcome",
        "Welcome to Actify!",
        &format!(
            "Hey {}! Ready to start your fitness journey?",
            req.full_name
        ),
        json!({}),
    );

    Ok(Json(load_user(&conn, &user_id)?))
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> AppResult<Json<Value>> {
    let conn = state.db.get()?;
    let found: Option<(String, String)> = conn
        .query_row(
            "SELECT id, password_hash FROM users WHERE username = ?1",
            params![req.username],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((user_id, password_hash)) = found else {
        return Err(AppError::Unauthorized);
    };
    if !verify_password(&req.password, &password_hash) {
        return Err(AppError::Unauthorized);
    }

    let user = load_user(&conn, &user_id)?;
    drop(conn);
    let token = create_session(&state.db, &user_id, state.config.auth.session_hours)?;

    Ok(Json(json!({
        "session_id": token,
        "user": user,
        "message": "Login successful",
    })))
}

async fn logout(
    State(state): State<AppState>,
    Json(req): Json<LogoutRequest>,
) -> AppResult<Json<Value>> {
    delete_session(&state.db, &req.session_id)?;
    Ok(Json(json!({ "message": "Logged out" })))
}

async fn search_users(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> AppResult<Json<Value>> {
    if query.q.len() < 2 {
        return Ok(Json(json!([])));
    }

    let conn = state.db.get()?;
    let pattern = format!("%{}%", query.q);
    let mut stmt = conn.prepare(
        "SELECT id, username, full_name, avatar_color FROM users
         WHERE username LIKE ?1 OR full_name LIKE ?1
         LIMIT 10",
    )?;
    let users: Vec<Value> = stmt
        .query_map(params![pattern], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "username": row.get::<_, String>(1)?,
                "full_name": row.get::<_, String>(2)?,
                "avatar_color": row.get::<_, String>(3)?,
            }))
        })?
        .collect::<Result<_, _>>()?;

    Ok(Json(json!(users)))
}

async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> AppResult<Json<User>> {
    let conn = state.db.get()?;
    Ok(Json(load_user(&conn, &user_id)?))
}

async fn get_achievements(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> AppResult<Json<Vec<Achievement>>> {
    let conn = state.db.get()?;
    let user = load_user(&conn, &user_id)?;
    Ok(Json(unlocked_achievements(&user.stats)))
}
