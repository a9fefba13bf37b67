// Repository for the global daily activity - isolates all database side effects
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::daily::domain::*;
use crate::db::{format_ts, with_tx};
use crate::error::{AppError, AppResult};
use crate::feed::FeedStatus;
use crate::state::DbPool;

#[derive(Debug, Clone, Serialize)]
pub struct DailyFeed {
    pub status: FeedStatus,
    pub activity: DailyActivity,
    pub completions: Vec<DailyCompletion>,
    pub total_participants: i64,
    pub friends_participants: i64,
}

#[async_trait]
pub trait DailyActivityRepository: Send + Sync {
    /// Replace the whole catalog (admin reseed). Returns the new entry count.
    async fn reseed_catalog(&self, entries: Vec<NewCatalogActivity>) -> AppResult<i64>;

    /// The day's activity, created on first call for the date. Idempotent:
    /// concurrent first-callers converge on one row.
    async fn current<R: Rng + Send>(&self, date: NaiveDate, rng: &mut R)
        -> AppResult<DailyActivity>;

    async fn complete<R: Rng + Send>(
        &self,
        date: NaiveDate,
        user_id: &str,
        description: &str,
        photo_data: Option<&str>,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> AppResult<DailyCompletion>;

    async fn feed<R: Rng + Send>(
        &self,
        date: NaiveDate,
        viewer_id: &str,
        friends_only: bool,
        rng: &mut R,
    ) -> AppResult<DailyFeed>;
}

/// SQLite implementation
#[derive(Clone)]
pub struct SqliteDailyActivityRepository {
    pool: DbPool,
}

impl SqliteDailyActivityRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn map_daily_activity(row: &rusqlite::Row<'_>) -> rusqlite::Result<DailyActivity> {
    Ok(DailyActivity {
        id: row.get(0)?,
        activity_id: row.get(1)?,
        date: row.get(2)?,
        selected_at: row.get(3)?,
        activity_title: row.get(4)?,
        activity_description: row.get(5)?,
        participant_count: row.get(6)?,
    })
}

const DAILY_COLUMNS: &str =
    "id, activity_id, date, selected_at, activity_title, activity_description, participant_count";

/// Find-or-create for the date. Runs inside the caller's write transaction,
/// so a losing concurrent creator re-reads the winner's row.
fn find_or_create<R: Rng>(
    conn: &Connection,
    date: NaiveDate,
    rng: &mut R,
) -> AppResult<DailyActivity> {
    let date_str = date.format("%Y-%m-%d").to_string();

    let existing: Option<DailyActivity> = conn
        .query_row(
            &format!("SELECT {} FROM daily_activities WHERE date = ?1", DAILY_COLUMNS),
            params![date_str],
            map_daily_activity,
        )
        .optional()?;
    if let Some(activity) = existing {
        return Ok(activity);
    }

    let candidates: Vec<(String, String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT id, title, description FROM activity_catalog WHERE is_active = 1",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        rows.collect::<Result<_, _>>()?
    };
    if candidates.is_empty() {
        return Err(AppError::InvalidState(
            "Activity catalog has no active entries".into(),
        ));
    }
    let (activity_id, title, description) =
        candidates[rng.gen_range(0..candidates.len())].clone();

    let id = uuid::Uuid::now_v7().to_string();
    let selected_at = format_ts(pick_selected_at(rng, date));
    conn.execute(
        "INSERT INTO daily_activities
         (id, activity_id, date, selected_at, activity_title, activity_description, participant_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
        params![id, activity_id, date_str, selected_at, title, description],
    )?;

    Ok(DailyActivity {
        id,
        activity_id,
        date: date_str,
        selected_at,
        activity_title: title,
        activity_description: description,
        participant_count: 0,
    })
}

fn require_username(conn: &Connection, user_id: &str) -> AppResult<String> {
    conn.query_row(
        "SELECT username FROM users WHERE id = ?1",
        params![user_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or(AppError::NotFound("User"))
}

#[async_trait]
impl DailyActivityRepository for SqliteDailyActivityRepository {
    async fn reseed_catalog(&self, entries: Vec<NewCatalogActivity>) -> AppResult<i64> {
        let conn = self.pool.get()?;
        with_tx(&conn, || {
            conn.execute("DELETE FROM activity_catalog", [])?;
            for entry in &entries {
                conn.execute(
                    "INSERT INTO activity_catalog
                     (id, title, description, category, difficulty, estimated_minutes, is_active)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
                    params![
                        uuid::Uuid::now_v7().to_string(),
                        entry.title,
                        entry.description,
                        entry.category,
                        entry.difficulty,
                        entry.estimated_minutes
                    ],
                )?;
            }
            Ok(entries.len() as i64)
        })
    }

    async fn current<R: Rng + Send>(
        &self,
        date: NaiveDate,
        rng: &mut R,
    ) -> AppResult<DailyActivity> {
        let conn = self.pool.get()?;
        with_tx(&conn, || find_or_create(&conn, date, rng))
    }

    async fn complete<R: Rng + Send>(
        &self,
        date: NaiveDate,
        user_id: &str,
        description: &str,
        photo_data: Option<&str>,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> AppResult<DailyCompletion> {
        let conn = self.pool.get()?;
        with_tx(&conn, || {
            let username = require_username(&conn, user_id)?;
            let activity = find_or_create(&conn, date, rng)?;

            let already: bool = conn.query_row(
                "SELECT COUNT(*) > 0 FROM daily_completions
                 WHERE daily_activity_id = ?1 AND user_id = ?2",
                params![activity.id, user_id],
                |row| row.get(0),
            )?;
            if already {
                return Err(AppError::Conflict(
                    "Already completed today's activity".into(),
                ));
            }

            let completion = DailyCompletion {
                id: uuid::Uuid::now_v7().to_string(),
                daily_activity_id: activity.id.clone(),
                user_id: user_id.to_string(),
                username,
                description: description.to_string(),
                photo_data: photo_data.map(str::to_string),
                votes: 0,
                completed_at: format_ts(now),
            };
            conn.execute(
                "INSERT INTO daily_completions
                 (id, daily_activity_id, user_id, username, description, photo_data, votes, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
                params![
                    completion.id,
                    completion.daily_activity_id,
                    completion.user_id,
                    completion.username,
                    completion.description,
                    completion.photo_data,
                    completion.completed_at
                ],
            )?;
            // Counter and record move together or not at all
            conn.execute(
                "UPDATE daily_activities SET participant_count = participant_count + 1 WHERE id = ?1",
                params![activity.id],
            )?;
            conn.execute(
                "UPDATE users SET total_activities = total_activities + 1,
                                  current_streak = current_streak + 1
                 WHERE id = ?1",
                params![user_id],
            )?;

            Ok(completion)
        })
    }

    async fn feed<R: Rng + Send>(
        &self,
        date: NaiveDate,
        viewer_id: &str,
        friends_only: bool,
        rng: &mut R,
    ) -> AppResult<DailyFeed> {
        let conn = self.pool.get()?;
        let activity = with_tx(&conn, || find_or_create(&conn, date, rng))?;

        let viewer_posted: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM daily_completions
             WHERE daily_activity_id = ?1 AND user_id = ?2",
            params![activity.id, viewer_id],
            |row| row.get(0),
        )?;
        let status = FeedStatus::from_has_posted(viewer_posted);

        let total_participants: i64 = conn.query_row(
            "SELECT COUNT(*) FROM daily_completions WHERE daily_activity_id = ?1",
            params![activity.id],
            |row| row.get(0),
        )?;

        if !status.is_unlocked() {
            // Post first: until then only the activity itself is visible
            return Ok(DailyFeed {
                status,
                activity,
                completions: Vec::new(),
                total_participants,
                friends_participants: 0,
            });
        }

        let friends_filter = if friends_only {
            " AND (c.user_id = ?2 OR EXISTS (
                 SELECT 1 FROM follows f
                 WHERE f.follower_id = ?2 AND f.following_id = c.user_id))"
        } else {
            ""
        };
        let sql = format!(
            "SELECT c.id, c.daily_activity_id, c.user_id, c.username, c.description,
                    c.photo_data, c.votes, c.completed_at
             FROM daily_completions c
             WHERE c.daily_activity_id = ?1{}
             ORDER BY c.completed_at DESC",
            friends_filter
        );
        let completions: Vec<DailyCompletion> = {
            let mut stmt = conn.prepare(&sql)?;
            let map = |row: &rusqlite::Row<'_>| {
                Ok(DailyCompletion {
                    id: row.get(0)?,
                    daily_activity_id: row.get(1)?,
                    user_id: row.get(2)?,
                    username: row.get(3)?,
                    description: row.get(4)?,
                    photo_data: row.get(5)?,
                    votes: row.get(6)?,
                    completed_at: row.get(7)?,
                })
            };
            let rows = if friends_only {
                stmt.query_map(params![activity.id, viewer_id], map)?
                    .collect::<Result<_, _>>()?
            } else {
                stmt.query_map(params![activity.id], map)?
                    .collect::<Result<_, _>>()?
            };
            rows
        };
        let friends_participants = completions.len() as i64;

        Ok(DailyFeed {
            status,
            activity,
            completions,
            total_participants,
            friends_participants,
        })
    }
}
