// Repository for global challenges - isolates all database side effects
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::challenges::domain::*;
use crate::db::{format_ts, parse_ts, with_tx};
use crate::error::{AppError, AppResult};
use crate::feed::FeedStatus;
use crate::state::DbPool;

#[derive(Debug, Clone)]
pub struct NewChallenge {
    pub prompt: String,
    /// Window start; defaults to now (immediately active).
    pub starts_at: Option<DateTime<Utc>>,
    pub promptness_window_minutes: i64,
    pub duration_hours: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepOutcome {
    pub expired_challenges: i64,
    pub activated_challenges: i64,
    pub current_active_challenge: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChallengeFeed {
    pub status: FeedStatus,
    pub challenge: Challenge,
    pub submissions: Vec<ChallengeSubmission>,
    pub total_participants: i64,
    pub friends_participants: i64,
    pub user_submitted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChallengeStats {
    pub challenge: Challenge,
    pub total_submissions: i64,
    pub total_votes: i64,
    pub top_submissions: Vec<ChallengeSubmission>,
}

#[async_trait]
pub trait ChallengeRepository: Send + Sync {
    async fn create(&self, new: NewChallenge, now: DateTime<Utc>) -> AppResult<Challenge>;

    /// Most recent active challenge with derived promptness/remaining time.
    async fn current(&self, now: DateTime<Utc>) -> AppResult<Option<CurrentChallenge>>;

    async fn list_all(&self) -> AppResult<Vec<Challenge>>;

    /// Force a challenge active, demoting every other active one.
    async fn activate(&self, challenge_id: &str, now: DateTime<Utc>) -> AppResult<()>;

    /// Idempotent status sweep: expire overdue challenges, then promote the
    /// newest in-window scheduled challenge if nothing is active.
    async fn sweep(&self, now: DateTime<Utc>) -> AppResult<SweepOutcome>;

    /// Queue one scheduled challenge per day for the coming week.
    async fn auto_schedule(&self, now: DateTime<Utc>) -> AppResult<Vec<Challenge>>;

    async fn submit(
        &self,
        challenge_id: &str,
        user_id: &str,
        description: &str,
        photo_data: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<ChallengeSubmission>;

    /// Feed for a challenge (defaults to the active one). `Ok(None)` means
    /// no challenge is running.
    async fn feed(
        &self,
        viewer_id: &str,
        challenge_id: Option<&str>,
        friends_only: bool,
        limit: i64,
    ) -> AppResult<Option<ChallengeFeed>>;

    /// Toggle the voter's vote on a submission.
    async fn vote(&self, submission_id: &str, voter_id: &str) -> AppResult<VoteOutcome>;

    async fn comment(
        &self,
        submission_id: &str,
        user_id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Comment>;

    async fn stats(&self, challenge_id: &str) -> AppResult<ChallengeStats>;
}

/// SQLite implementation
#[derive(Clone)]
pub struct SqliteChallengeRepository {
    pool: DbPool,
}

impl SqliteChallengeRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const CHALLENGE_COLUMNS: &str =
    "id, prompt, created_at, expires_at, promptness_window_minutes, status, auto_scheduled";

fn map_challenge(row: &rusqlite::Row<'_>) -> rusqlite::Result<Challenge> {
    let status: String = row.get(5)?;
    Ok(Challenge {
        id: row.get(0)?,
        prompt: row.get(1)?,
        created_at: row.get(2)?,
        expires_at: row.get(3)?,
        promptness_window_minutes: row.get(4)?,
        status: ChallengeStatus::parse(&status).unwrap_or(ChallengeStatus::Scheduled),
        auto_scheduled: row.get(6)?,
    })
}

fn challenge_by_id(conn: &Connection, challenge_id: &str) -> AppResult<Challenge> {
    conn.query_row(
        &format!("SELECT {} FROM challenges WHERE id = ?1", CHALLENGE_COLUMNS),
        params![challenge_id],
        map_challenge,
    )
    .optional()?
    .ok_or(AppError::NotFound("Challenge"))
}

fn active_challenge(conn: &Connection) -> AppResult<Option<Challenge>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM challenges WHERE status = 'active' ORDER BY created_at DESC LIMIT 1",
                CHALLENGE_COLUMNS
            ),
            [],
            map_challenge,
        )
        .optional()?)
}

/// Demote every active challenge except `keep`: past-expiry ones become
/// expired, the rest fall back to scheduled.
fn demote_actives(conn: &Connection, now: DateTime<Utc>, keep: Option<&str>) -> AppResult<()> {
    conn.execute(
        "UPDATE challenges
         SET status = CASE WHEN expires_at <= ?1 THEN 'expired' ELSE 'scheduled' END
         WHERE status = 'active' AND id != ?2",
        params![format_ts(now), keep.unwrap_or("")],
    )?;
    Ok(())
}

const SUBMISSION_COLUMNS: &str = "id, challenge_id, user_id, username, challenge_prompt, \
     description, photo_data, votes, comments, reactions, created_at";

fn map_submission(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChallengeSubmission> {
    let comments_json: String = row.get(8)?;
    let reactions_json: String = row.get(9)?;
    let comments = serde_json::from_str(&comments_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let reactions = serde_json::from_str(&reactions_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(ChallengeSubmission {
        id: row.get(0)?,
        challenge_id: row.get(1)?,
        user_id: row.get(2)?,
        username: row.get(3)?,
        challenge_prompt: row.get(4)?,
        description: row.get(5)?,
        photo_data: row.get(6)?,
        votes: row.get(7)?,
        comments,
        reactions,
        created_at: row.get(10)?,
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
impl ChallengeRepository for SqliteChallengeRepository {
    async fn create(&self, new: NewChallenge, now: DateTime<Utc>) -> AppResult<Challenge> {
        if new.prompt.trim().is_empty() {
            return Err(AppError::Validation("Prompt must not be empty".into()));
        }

        let starts_at = new.starts_at.unwrap_or(now);
        let expires_at = starts_at + Duration::hours(new.duration_hours);
        let status = derive_status(now, starts_at, expires_at);

        let conn = self.pool.get()?;
        let id = uuid::Uuid::now_v7().to_string();
        with_tx(&conn, || {
            if status.is_active() {
                demote_actives(&conn, now, Some(&id))?;
            }
            conn.execute(
                "INSERT INTO challenges
                 (id, prompt, created_at, expires_at, promptness_window_minutes, status, auto_scheduled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                params![
                    id,
                    new.prompt.trim(),
                    format_ts(starts_at),
                    format_ts(expires_at),
                    new.promptness_window_minutes,
                    status.as_str()
                ],
            )?;
            Ok(())
        })?;

        challenge_by_id(&conn, &id)
    }

    async fn current(&self, now: DateTime<Utc>) -> AppResult<Option<CurrentChallenge>> {
        let conn = self.pool.get()?;
        let Some(challenge) = active_challenge(&conn)? else {
            return Ok(None);
        };

        let created = parse_ts(&challenge.created_at)
            .ok_or_else(|| AppError::Internal("corrupt challenge timestamp".into()))?;
        let expires = parse_ts(&challenge.expires_at)
            .ok_or_else(|| AppError::Internal("corrupt challenge timestamp".into()))?;

        Ok(Some(CurrentChallenge {
            promptness_expired: promptness_expired(
                now,
                created,
                challenge.promptness_window_minutes,
            ),
            time_remaining: (expires - now).num_seconds().max(0),
            challenge,
        }))
    }

    async fn list_all(&self) -> AppResult<Vec<Challenge>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM challenges ORDER BY created_at DESC",
            CHALLENGE_COLUMNS
        ))?;
        let rows = stmt.query_map([], map_challenge)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    async fn activate(&self, challenge_id: &str, now: DateTime<Utc>) -> AppResult<()> {
        let conn = self.pool.get()?;
        with_tx(&conn, || {
            demote_actives(&conn, now, Some(challenge_id))?;
            let updated = conn.execute(
                "UPDATE challenges SET status = 'active' WHERE id = ?1",
                params![challenge_id],
            )?;
            if updated == 0 {
                return Err(AppError::NotFound("Challenge"));
            }
            Ok(())
        })
    }

    async fn sweep(&self, now: DateTime<Utc>) -> AppResult<SweepOutcome> {
        let conn = self.pool.get()?;
        let now_str = format_ts(now);
        with_tx(&conn, || {
            let expired = conn.execute(
                "UPDATE challenges SET status = 'expired'
                 WHERE status != 'expired' AND expires_at <= ?1",
                params![now_str],
            )? as i64;

            let mut activated = 0i64;
            let has_active: bool = conn.query_row(
                "SELECT COUNT(*) > 0 FROM challenges WHERE status = 'active'",
                [],
                |row| row.get(0),
            )?;
            if !has_active {
                // Single winner: the newest scheduled challenge whose window
                // contains now
                let candidate: Option<String> = conn
                    .query_row(
                        "SELECT id FROM challenges
                         WHERE status = 'scheduled' AND created_at <= ?1 AND expires_at > ?1
                         ORDER BY created_at DESC LIMIT 1",
                        params![now_str],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(id) = candidate {
                    conn.execute(
                        "UPDATE challenges SET status = 'active' WHERE id = ?1",
                        params![id],
                    )?;
                    activated = 1;
                }
            }

            let current_active_challenge = active_challenge(&conn)?.map(|c| c.prompt);

            Ok(SweepOutcome {
                expired_challenges: expired,
                activated_challenges: activated,
                current_active_challenge,
            })
        })
    }

    async fn auto_schedule(&self, now: DateTime<Utc>) -> AppResult<Vec<Challenge>> {
        let conn = self.pool.get()?;
        let ids = with_tx(&conn, || {
            let mut ids = Vec::new();
            for day in 0..7 {
                // 6 AM start, 18-hour window; activation is left to the sweep
                let starts_at = now + Duration::days(day) + Duration::hours(6);
                let expires_at = starts_at + Duration::hours(18);
                let id = uuid::Uuid::now_v7().to_string();
                conn.execute(
                    "INSERT INTO challenges
                     (id, prompt, created_at, expires_at, promptness_window_minutes, status, auto_scheduled)
                     VALUES (?1, ?2, ?3, ?4, 5, 'scheduled', 1)",
                    params![
                        id,
                        AUTO_PROMPTS[day as usize % AUTO_PROMPTS.len()],
                        format_ts(starts_at),
                        format_ts(expires_at)
                    ],
                )?;
                ids.push(id);
            }
            Ok(ids)
        })?;

        ids.iter().map(|id| challenge_by_id(&conn, id)).collect()
    }

    async fn submit(
        &self,
        challenge_id: &str,
        user_id: &str,
        description: &str,
        photo_data: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<ChallengeSubmission> {
        let conn = self.pool.get()?;
        with_tx(&conn, || {
            let challenge = challenge_by_id(&conn, challenge_id)?;
            if !challenge.status.is_active() {
                return Err(AppError::InvalidState("Challenge is not active".into()));
            }
            let username = require_username(&conn, user_id)?;

            let already: bool = conn.query_row(
                "SELECT COUNT(*) > 0 FROM challenge_submissions
                 WHERE challenge_id = ?1 AND user_id = ?2",
                params![challenge_id, user_id],
                |row| row.get(0),
            )?;
            if already {
                return Err(AppError::Conflict(
                    "Already submitted for this challenge".into(),
                ));
            }

            let submission = ChallengeSubmission {
                id: uuid::Uuid::now_v7().to_string(),
                challenge_id: challenge_id.to_string(),
                user_id: user_id.to_string(),
                username,
                challenge_prompt: challenge.prompt.clone(),
                description: description.to_string(),
                photo_data: photo_data.map(str::to_string),
                votes: 0,
                comments: Vec::new(),
                reactions: serde_json::json!({}),
                created_at: format_ts(now),
            };
            conn.execute(
                "INSERT INTO challenge_submissions
                 (id, challenge_id, user_id, username, challenge_prompt, description, photo_data,
                  votes, comments, reactions, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, '[]', '{}', ?8)",
                params![
                    submission.id,
                    submission.challenge_id,
                    submission.user_id,
                    submission.username,
                    submission.challenge_prompt,
                    submission.description,
                    submission.photo_data,
                    submission.created_at
                ],
            )?;
            conn.execute(
                "UPDATE users SET total_activities = total_activities + 1,
                                  current_streak = current_streak + 1
                 WHERE id = ?1",
                params![user_id],
            )?;

            Ok(submission)
        })
    }

    async fn feed(
        &self,
        viewer_id: &str,
        challenge_id: Option<&str>,
        friends_only: bool,
        limit: i64,
    ) -> AppResult<Option<ChallengeFeed>> {
        let conn = self.pool.get()?;

        let challenge = match challenge_id {
            Some(id) => challenge_by_id(&conn, id)?,
            None => match active_challenge(&conn)? {
                Some(challenge) => challenge,
                None => return Ok(None),
            },
        };

        let user_submitted: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM challenge_submissions
             WHERE challenge_id = ?1 AND user_id = ?2",
            params![challenge.id, viewer_id],
            |row| row.get(0),
        )?;
        let status = FeedStatus::from_has_posted(user_submitted);

        let total_participants: i64 = conn.query_row(
            "SELECT COUNT(*) FROM challenge_submissions WHERE challenge_id = ?1",
            params![challenge.id],
            |row| row.get(0),
        )?;

        if !status.is_unlocked() {
            // Post to unlock: no submission content leaves the store
            return Ok(Some(ChallengeFeed {
                status,
                challenge,
                submissions: Vec::new(),
                total_participants,
                friends_participants: 0,
                user_submitted,
            }));
        }

        let friends_filter = if friends_only {
            " AND (s.user_id = ?2 OR EXISTS (
                 SELECT 1 FROM follows f
                 WHERE f.follower_id = ?2 AND f.following_id = s.user_id))"
        } else {
            ""
        };
        let sql = format!(
            "SELECT {} FROM challenge_submissions s
             WHERE s.challenge_id = ?1{}
             ORDER BY s.created_at DESC
             LIMIT {}",
            SUBMISSION_COLUMNS
                .split(", ")
                .map(|c| format!("s.{}", c))
                .collect::<Vec<_>>()
                .join(", "),
            friends_filter,
            limit.max(1)
        );
        let submissions: Vec<ChallengeSubmission> = {
            let mut stmt = conn.prepare(&sql)?;
            let rows = if friends_only {
                stmt.query_map(params![challenge.id, viewer_id], map_submission)?
                    .collect::<Result<_, _>>()?
            } else {
                stmt.query_map(params![challenge.id], map_submission)?
                    .collect::<Result<_, _>>()?
            };
            rows
        };

        let friends_participants = if friends_only {
            let count_sql = format!(
                "SELECT COUNT(*) FROM challenge_submissions s WHERE s.challenge_id = ?1{}",
                friends_filter
            );
            conn.query_row(&count_sql, params![challenge.id, viewer_id], |row| {
                row.get(0)
            })?
        } else {
            total_participants
        };

        Ok(Some(ChallengeFeed {
            status,
            challenge,
            submissions,
            total_participants,
            friends_participants,
            user_submitted,
        }))
    }

    async fn vote(&self, submission_id: &str, voter_id: &str) -> AppResult<VoteOutcome> {
        let conn = self.pool.get()?;
        with_tx(&conn, || {
            let owner: Option<String> = conn
                .query_row(
                    "SELECT user_id FROM challenge_submissions WHERE id = ?1",
                    params![submission_id],
                    |row| row.get(0),
                )
                .optional()?;
            let owner = owner.ok_or(AppError::NotFound("Submission"))?;
            if owner == voter_id {
                return Err(AppError::Forbidden(
                    "Cannot vote on your own submission".into(),
                ));
            }

            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM challenge_votes WHERE submission_id = ?1 AND user_id = ?2",
                    params![submission_id, voter_id],
                    |row| row.get(0),
                )
                .optional()?;

            // Toggle: vote record and cached counter move together
            let voted = match existing {
                Some(vote_id) => {
                    conn.execute("DELETE FROM challenge_votes WHERE id = ?1", params![vote_id])?;
                    conn.execute(
                        "UPDATE challenge_submissions SET votes = votes - 1 WHERE id = ?1",
                        params![submission_id],
                    )?;
                    false
                }
                None => {
                    conn.execute(
                        "INSERT INTO challenge_votes (id, submission_id, user_id)
                         VALUES (?1, ?2, ?3)",
                        params![uuid::Uuid::now_v7().to_string(), submission_id, voter_id],
                    )?;
                    conn.execute(
                        "UPDATE challenge_submissions SET votes = votes + 1 WHERE id = ?1",
                        params![submission_id],
                    )?;
                    true
                }
            };

            let votes: i64 = conn.query_row(
                "SELECT votes FROM challenge_submissions WHERE id = ?1",
                params![submission_id],
                |row| row.get(0),
            )?;

            Ok(VoteOutcome { voted, votes })
        })
    }

    async fn comment(
        &self,
        submission_id: &str,
        user_id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Comment> {
        let conn = self.pool.get()?;
        with_tx(&conn, || {
            let username = require_username(&conn, user_id)?;
            let comments_json: Option<String> = conn
                .query_row(
                    "SELECT comments FROM challenge_submissions WHERE id = ?1",
                    params![submission_id],
                    |row| row.get(0),
                )
                .optional()?;
            let comments_json = comments_json.ok_or(AppError::NotFound("Submission"))?;

            let mut comments: Vec<Comment> = serde_json::from_str(&comments_json)?;
            let comment = Comment {
                id: uuid::Uuid::now_v7().to_string(),
                user_id: user_id.to_string(),
                username,
                comment: text.to_string(),
                created_at: format_ts(now),
            };
            comments.push(comment.clone());

            conn.execute(
                "UPDATE challenge_submissions SET comments = ?1 WHERE id = ?2",
                params![serde_json::to_string(&comments)?, submission_id],
            )?;

            Ok(comment)
        })
    }

    async fn stats(&self, challenge_id: &str) -> AppResult<ChallengeStats> {
        let conn = self.pool.get()?;
        let challenge = challenge_by_id(&conn, challenge_id)?;

        let total_submissions: i64 = conn.query_row(
            "SELECT COUNT(*) FROM challenge_submissions WHERE challenge_id = ?1",
            params![challenge_id],
            |row| row.get(0),
        )?;
        let total_votes: i64 = conn.query_row(
            "SELECT COUNT(*) FROM challenge_votes v
             JOIN challenge_submissions s ON s.id = v.submission_id
             WHERE s.challenge_id = ?1",
            params![challenge_id],
            |row| row.get(0),
        )?;

        let top_submissions: Vec<ChallengeSubmission> = {
            let sql = format!(
                "SELECT {} FROM challenge_submissions
                 WHERE challenge_id = ?1
                 ORDER BY votes DESC LIMIT 3",
                SUBMISSION_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![challenge_id], map_submission)?;
            rows.collect::<Result<_, _>>()?
        };

        Ok(ChallengeStats {
            challenge,
            total_submissions,
            total_votes,
            top_submissions,
        })
    }
}
