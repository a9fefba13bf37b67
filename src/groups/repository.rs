// Repository for the weekly challenge cycle - isolates all database side effects
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::db::{format_ts, with_tx};
use crate::error::{AppError, AppResult};
use crate::feed::FeedStatus;
use crate::groups::domain::*;
use crate::state::DbPool;

#[derive(Debug, Clone)]
pub struct NewGroup {
    pub name: String,
    pub description: String,
    pub category: String,
    pub is_public: bool,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinOutcome {
    pub group_id: String,
    pub group_name: String,
    pub username: String,
    /// Members to notify (everyone except the newcomer).
    #[serde(skip)]
    pub other_members: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    pub submission_count: i64,
    pub remaining: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevealOutcome {
    pub revealed_activity: RevealRecord,
    pub already_revealed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupDailyFeed {
    pub status: FeedStatus,
    pub activity: Option<RevealRecord>,
    pub completions: Vec<GroupCompletion>,
    pub total_participants: i64,
    pub friends_participants: i64,
}

#[async_trait]
pub trait GroupRepository: Send + Sync {
    async fn create<R: Rng + Send>(&self, new: NewGroup, rng: &mut R) -> AppResult<Group>;
    async fn get(&self, group_id: &str) -> AppResult<Group>;
    async fn list_public(&self, limit: i64) -> AppResult<Vec<Group>>;
    async fn groups_for_user(&self, user_id: &str) -> AppResult<Vec<Group>>;
    async fn join(&self, group_id: &str, user_id: &str) -> AppResult<JoinOutcome>;
    async fn join_by_code(&self, invite_code: &str, user_id: &str) -> AppResult<JoinOutcome>;
    async fn set_submission_day(&self, group_id: &str, actor_id: &str, day: &str) -> AppResult<()>;

    /// Start a fresh week. Archives the finished week's standings first.
    /// Returns the new week start.
    async fn start_week(&self, group_id: &str, actor_id: &str, now: DateTime<Utc>)
        -> AppResult<String>;

    async fn submit_activity(
        &self,
        group_id: &str,
        actor_id: &str,
        title: &str,
        description: &str,
        now: DateTime<Utc>,
    ) -> AppResult<SubmitOutcome>;

    async fn weekly_activities(&self, group_id: &str) -> AppResult<Vec<WeeklySubmission>>;

    /// Reveal the activity for `day_number`. Idempotent: a day already
    /// revealed returns the original record without consuming another
    /// submission.
    async fn reveal_day<R: Rng + Send>(
        &self,
        group_id: &str,
        day_number: i64,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> AppResult<RevealOutcome>;

    /// Complete the currently revealed activity.
    async fn complete_current(
        &self,
        group_id: &str,
        actor_id: &str,
        proof: &str,
        description: &str,
        now: DateTime<Utc>,
    ) -> AppResult<CompletionReceipt>;

    /// Complete by explicit submission id; must name the current reveal.
    async fn complete_submission(
        &self,
        group_id: &str,
        submission_id: &str,
        actor_id: &str,
        proof: &str,
        description: &str,
        now: DateTime<Utc>,
    ) -> AppResult<CompletionReceipt>;

    async fn rankings(&self, group_id: &str) -> AppResult<Vec<RankingEntry>>;

    async fn daily_feed(
        &self,
        group_id: &str,
        viewer_id: &str,
        friends_only: bool,
    ) -> AppResult<GroupDailyFeed>;
}

/// SQLite implementation
#[derive(Clone)]
pub struct SqliteGroupRepository {
    pool: DbPool,
}

impl SqliteGroupRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Raw groups row, before the aggregate view is assembled.
struct GroupRow {
    id: String,
    name: String,
    description: String,
    category: String,
    is_public: bool,
    created_by: String,
    admin_id: String,
    invite_code: String,
    week_phase: WeekPhase,
    submission_day: Option<String>,
    current_week_start: Option<String>,
    activities_submitted: i64,
    current_reveal_id: Option<String>,
    created_at: String,
}

const GROUP_COLUMNS: &str = "id, name, description, category, is_public, created_by, admin_id, \
     invite_code, week_phase, submission_day, current_week_start, activities_submitted, \
     current_reveal_id, created_at";

fn map_group_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupRow> {
    let phase: String = row.get(8)?;
    Ok(GroupRow {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        category: row.get(3)?,
        is_public: row.get(4)?,
        created_by: row.get(5)?,
        admin_id: row.get(6)?,
        invite_code: row.get(7)?,
        week_phase: WeekPhase::parse(&phase).unwrap_or(WeekPhase::Forming),
        submission_day: row.get(9)?,
        current_week_start: row.get(10)?,
        activities_submitted: row.get(11)?,
        current_reveal_id: row.get(12)?,
        created_at: row.get(13)?,
    })
}

fn group_row(conn: &Connection, group_id: &str) -> AppResult<GroupRow> {
    conn.query_row(
        &format!("SELECT {} FROM groups WHERE id = ?1", GROUP_COLUMNS),
        params![group_id],
        map_group_row,
    )
    .optional()?
    .ok_or(AppError::NotFound("Group"))
}

fn reveal_record(conn: &Connection, reveal_id: &str) -> AppResult<RevealRecord> {
    Ok(conn.query_row(
        "SELECT r.day_number, r.submission_id, s.title, s.description, s.submitted_by, r.revealed_at
         FROM group_reveals r
         JOIN weekly_submissions s ON s.id = r.submission_id
         WHERE r.id = ?1",
        params![reveal_id],
        map_reveal_record,
    )?)
}

fn map_reveal_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RevealRecord> {
    Ok(RevealRecord {
        day_number: row.get(0)?,
        submission_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        submitted_by: row.get(4)?,
        revealed_at: row.get(5)?,
    })
}

fn load_group(conn: &Connection, group_id: &str) -> AppResult<Group> {
    let row = group_row(conn, group_id)?;
    assemble_group(conn, row)
}

fn assemble_group(conn: &Connection, row: GroupRow) -> AppResult<Group> {
    let mut members = Vec::new();
    let mut points = std::collections::BTreeMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT user_id, points FROM group_members WHERE group_id = ?1 ORDER BY joined_at",
        )?;
        let rows = stmt.query_map(params![row.id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?;
        for entry in rows {
            let (user_id, pts) = entry?;
            members.push(user_id.clone());
            points.insert(user_id, pts);
        }
    }

    let mut reveals = Vec::new();
    if let Some(ref week_start) = row.current_week_start {
        let mut stmt = conn.prepare(
            "SELECT r.day_number, r.submission_id, s.title, s.description, s.submitted_by, r.revealed_at
             FROM group_reveals r
             JOIN weekly_submissions s ON s.id = r.submission_id
             WHERE r.group_id = ?1 AND r.week_start = ?2
             ORDER BY r.day_number",
        )?;
        let rows = stmt.query_map(params![row.id, week_start], map_reveal_record)?;
        for reveal in rows {
            reveals.push(reveal?);
        }
    }

    let current_day_activity = match row.current_reveal_id {
        Some(ref reveal_id) => Some(reveal_record(conn, reveal_id)?),
        None => None,
    };

    Ok(Group {
        id: row.id,
        name: row.name,
        description: row.description,
        category: row.category,
        is_public: row.is_public,
        created_by: row.created_by,
        admin_id: row.admin_id,
        invite_code: row.invite_code,
        week_phase: row.week_phase,
        submission_day: row.submission_day,
        current_week_start: row.current_week_start,
        activities_submitted: row.activities_submitted,
        activities_needed: ACTIVITIES_PER_WEEK,
        member_count: members.len() as i64,
        members,
        max_members: MAX_MEMBERS,
        current_week_points: points,
        daily_reveals: reveals,
        current_day_activity,
        created_at: row.created_at,
    })
}

fn is_member(conn: &Connection, group_id: &str, user_id: &str) -> AppResult<bool> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM group_members WHERE group_id = ?1 AND user_id = ?2",
        params![group_id, user_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

fn require_user(conn: &Connection, user_id: &str) -> AppResult<String> {
    conn.query_row(
        "SELECT username FROM users WHERE id = ?1",
        params![user_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or(AppError::NotFound("User"))
}

/// Membership checks + insert, shared by both join paths. Runs inside the
/// caller's transaction.
fn join_inner(conn: &Connection, group: &GroupRow, user_id: &str) -> AppResult<JoinOutcome> {
    let username = require_user(conn, user_id)?;

    if is_member(conn, &group.id, user_id)? {
        return Err(AppError::Conflict("Already a member of this group".into()));
    }

    let member_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM group_members WHERE group_id = ?1",
        params![group.id],
        |row| row.get(0),
    )?;
    if member_count >= MAX_MEMBERS {
        return Err(AppError::Conflict(format!(
            "Group is full (max {} members)",
            MAX_MEMBERS
        )));
    }

    let mut other_members = Vec::new();
    {
        let mut stmt =
            conn.prepare("SELECT user_id FROM group_members WHERE group_id = ?1")?;
        let rows = stmt.query_map(params![group.id], |row| row.get::<_, String>(0))?;
        for member in rows {
            other_members.push(member?);
        }
    }

    conn.execute(
        "INSERT INTO group_members (group_id, user_id, points) VALUES (?1, ?2, 0)",
        params![group.id, user_id],
    )?;
    conn.execute(
        "UPDATE users SET total_groups_joined = total_groups_joined + 1 WHERE id = ?1",
        params![user_id],
    )?;

    Ok(JoinOutcome {
        group_id: group.id.clone(),
        group_name: group.name.clone(),
        username,
        other_members,
    })
}

/// Rank-based completion. Prior-count read and record insert share one write
/// transaction, so two racers cannot both claim first place.
fn complete_inner(
    conn: &Connection,
    group_id: &str,
    submission_id: &str,
    user_id: &str,
    proof: &str,
    description: &str,
    now: DateTime<Utc>,
) -> AppResult<CompletionReceipt> {
    let already: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM group_completions
         WHERE group_id = ?1 AND submission_id = ?2 AND user_id = ?3",
        params![group_id, submission_id, user_id],
        |row| row.get(0),
    )?;
    if already {
        return Err(AppError::Conflict("Activity already completed by user".into()));
    }

    let prior: i64 = conn.query_row(
        "SELECT COUNT(*) FROM group_completions WHERE group_id = ?1 AND submission_id = ?2",
        params![group_id, submission_id],
        |row| row.get(0),
    )?;
    let completion_order = prior + 1;
    let points_earned = points_for_order(completion_order);

    conn.execute(
        "INSERT INTO group_completions
         (id, group_id, submission_id, user_id, proof_data, description, completion_order, points_earned, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            uuid::Uuid::now_v7().to_string(),
            group_id,
            submission_id,
            user_id,
            proof,
            description,
            completion_order,
            points_earned,
            format_ts(now)
        ],
    )?;
    conn.execute(
        "UPDATE group_members SET points = points + ?1 WHERE group_id = ?2 AND user_id = ?3",
        params![points_earned, group_id, user_id],
    )?;
    conn.execute(
        "UPDATE users SET total_activities = total_activities + 1,
                          current_streak = current_streak + 1
         WHERE id = ?1",
        params![user_id],
    )?;

    Ok(CompletionReceipt {
        points_earned,
        completion_order,
    })
}

fn current_submission_id(conn: &Connection, group: &GroupRow) -> AppResult<String> {
    let reveal_id = group
        .current_reveal_id
        .as_deref()
        .ok_or_else(|| AppError::InvalidState("No activity revealed yet".into()))?;
    Ok(conn.query_row(
        "SELECT submission_id FROM group_reveals WHERE id = ?1",
        params![reveal_id],
        |row| row.get(0),
    )?)
}

#[async_trait]
impl GroupRepository for SqliteGroupRepository {
    async fn create<R: Rng + Send>(&self, new: NewGroup, rng: &mut R) -> AppResult<Group> {
        if new.name.trim().is_empty() {
            return Err(AppError::Validation("Group name must not be empty".into()));
        }

        let conn = self.pool.get()?;
        let group_id = with_tx(&conn, || {
            require_user(&conn, &new.created_by)?;

            let group_id = uuid::Uuid::now_v7().to_string();

            // The UNIQUE index on invite_code is the arbiter; regenerate and
            // retry on collision. The loop is required for correctness, not
            // an optimization.
            let mut attempts = 0;
            loop {
                let code = generate_invite_code(rng);
                let inserted = conn.execute(
                    "INSERT INTO groups (id, name, description, category, is_public, created_by, admin_id, invite_code)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)",
                    params![
                        group_id,
                        new.name.trim(),
                        new.description,
                        new.category,
                        new.is_public,
                        new.created_by,
                        code
                    ],
                );
                match inserted {
                    Ok(_) => break,
                    Err(rusqlite::Error::SqliteFailure(e, Some(ref msg)))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation
                            && msg.contains("invite_code") =>
                    {
                        attempts += 1;
                        if attempts >= 32 {
                            return Err(AppError::Conflict(
                                "Could not allocate a unique invite code".into(),
                            ));
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            // Creator is the first member and initial admin
            conn.execute(
                "INSERT INTO group_members (group_id, user_id, points) VALUES (?1, ?2, 0)",
                params![group_id, new.created_by],
            )?;
            conn.execute(
                "UPDATE users SET total_groups_joined = total_groups_joined + 1 WHERE id = ?1",
                params![new.created_by],
            )?;

            Ok(group_id)
        })?;

        load_group(&conn, &group_id)
    }

    async fn get(&self, group_id: &str) -> AppResult<Group> {
        let conn = self.pool.get()?;
        load_group(&conn, group_id)
    }

    async fn list_public(&self, limit: i64) -> AppResult<Vec<Group>> {
        let conn = self.pool.get()?;
        let ids: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM groups WHERE is_public = 1 ORDER BY created_at DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        ids.iter().map(|id| load_group(&conn, id)).collect()
    }

    async fn groups_for_user(&self, user_id: &str) -> AppResult<Vec<Group>> {
        let conn = self.pool.get()?;
        let ids: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT g.id FROM groups g
                 JOIN group_members gm ON gm.group_id = g.id
                 WHERE gm.user_id = ?1
                 ORDER BY g.created_at DESC",
            )?;
            let rows = stmt.query_map(params![user_id], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        ids.iter().map(|id| load_group(&conn, id)).collect()
    }

    async fn join(&self, group_id: &str, user_id: &str) -> AppResult<JoinOutcome> {
        let conn = self.pool.get()?;
        with_tx(&conn, || {
            let group = group_row(&conn, group_id)?;
            join_inner(&conn, &group, user_id)
        })
    }

    async fn join_by_code(&self, invite_code: &str, user_id: &str) -> AppResult<JoinOutcome> {
        let conn = self.pool.get()?;
        with_tx(&conn, || {
            let group_id: Option<String> = conn
                .query_row(
                    "SELECT id FROM groups WHERE invite_code = ?1",
                    params![invite_code],
                    |row| row.get(0),
                )
                .optional()?;
            let group_id = group_id.ok_or(AppError::NotFound("Invite code"))?;
            let group = group_row(&conn, &group_id)?;
            join_inner(&conn, &group, user_id)
        })
    }

    async fn set_submission_day(&self, group_id: &str, actor_id: &str, day: &str) -> AppResult<()> {
        let conn = self.pool.get()?;
        let group = group_row(&conn, group_id)?;
        if group.admin_id != actor_id {
            return Err(AppError::Forbidden(
                "Only group admin can set submission day".into(),
            ));
        }
        // Advisory metadata: the engine gates submissions by phase, not by
        // day of week.
        conn.execute(
            "UPDATE groups SET submission_day = ?1 WHERE id = ?2",
            params![day, group_id],
        )?;
        Ok(())
    }

    async fn start_week(
        &self,
        group_id: &str,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<String> {
        let conn = self.pool.get()?;
        with_tx(&conn, || {
            let group = group_row(&conn, group_id)?;
            if group.admin_id != actor_id {
                return Err(AppError::Forbidden(
                    "Only group admin can start submissions".into(),
                ));
            }

            // Archive the outgoing week before its points are overwritten
            if let Some(ref old_week) = group.current_week_start {
                let standings = member_standings(&conn, group_id)?;
                for entry in rank_by_points(standings) {
                    conn.execute(
                        "INSERT OR REPLACE INTO weekly_rankings
                         (id, group_id, week_start, user_id, total_points, rank_position)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            uuid::Uuid::now_v7().to_string(),
                            group_id,
                            old_week,
                            entry.user_id,
                            entry.points,
                            entry.rank
                        ],
                    )?;
                }
            }

            let new_week = format_ts(week_start(now));
            conn.execute(
                "UPDATE groups SET week_phase = ?1, current_week_start = ?2,
                        activities_submitted = 0, current_reveal_id = NULL
                 WHERE id = ?3",
                params![group.week_phase.start_week().as_str(), new_week, group_id],
            )?;
            conn.execute(
                "UPDATE group_members SET points = 0 WHERE group_id = ?1",
                params![group_id],
            )?;

            Ok(new_week)
        })
    }

    async fn submit_activity(
        &self,
        group_id: &str,
        actor_id: &str,
        title: &str,
        description: &str,
        now: DateTime<Utc>,
    ) -> AppResult<SubmitOutcome> {
        if title.trim().is_empty() {
            return Err(AppError::Validation("Activity title must not be empty".into()));
        }

        let conn = self.pool.get()?;
        with_tx(&conn, || {
            let group = group_row(&conn, group_id)?;
            if !is_member(&conn, group_id, actor_id)? {
                return Err(AppError::Forbidden("User not in group".into()));
            }
            if !group.week_phase.accepts_submissions() {
                return Err(AppError::InvalidState("Submission phase not active".into()));
            }
            let week_start = group
                .current_week_start
                .clone()
                .ok_or_else(|| AppError::Internal("submission phase open without a week".into()))?;

            let order = group.activities_submitted + 1;
            conn.execute(
                "INSERT INTO weekly_submissions
                 (id, group_id, submitted_by, title, description, week_start, submission_order, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    uuid::Uuid::now_v7().to_string(),
                    group_id,
                    actor_id,
                    title.trim(),
                    description,
                    week_start,
                    order,
                    format_ts(now)
                ],
            )?;

            // The 7th submission ends the phase in the same step
            conn.execute(
                "UPDATE groups SET activities_submitted = ?1, week_phase = ?2 WHERE id = ?3",
                params![
                    order,
                    group.week_phase.after_submission(order).as_str(),
                    group_id
                ],
            )?;

            Ok(SubmitOutcome {
                submission_count: order,
                remaining: ACTIVITIES_PER_WEEK - order,
            })
        })
    }

    async fn weekly_activities(&self, group_id: &str) -> AppResult<Vec<WeeklySubmission>> {
        let conn = self.pool.get()?;
        let group = group_row(&conn, group_id)?;
        let Some(week_start) = group.current_week_start else {
            return Ok(Vec::new());
        };

        let mut stmt = conn.prepare(
            "SELECT id, group_id, submitted_by, title, description, week_start,
                    submission_order, is_revealed, revealed_at, created_at
             FROM weekly_submissions
             WHERE group_id = ?1 AND week_start = ?2
             ORDER BY submission_order",
        )?;
        let rows = stmt.query_map(params![group_id, week_start], |row| {
            Ok(WeeklySubmission {
                id: row.get(0)?,
                group_id: row.get(1)?,
                submitted_by: row.get(2)?,
                title: row.get(3)?,
                description: row.get(4)?,
                week_start: row.get(5)?,
                submission_order: row.get(6)?,
                is_revealed: row.get(7)?,
                revealed_at: row.get(8)?,
                created_at: row.get(9)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    async fn reveal_day<R: Rng + Send>(
        &self,
        group_id: &str,
        day_number: i64,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> AppResult<RevealOutcome> {
        if !(1..=ACTIVITIES_PER_WEEK).contains(&day_number) {
            return Err(AppError::Validation(format!(
                "day_number must be between 1 and {}",
                ACTIVITIES_PER_WEEK
            )));
        }

        let conn = self.pool.get()?;
        with_tx(&conn, || {
            let group = group_row(&conn, group_id)?;
            let week_start = group
                .current_week_start
                .clone()
                .ok_or_else(|| AppError::InvalidState("No active week".into()))?;

            // Phase is authoritative: reveals open only once all 7 ideas
            // are in
            if !group.week_phase.accepts_reveals() {
                return Err(AppError::InvalidState(
                    "Not enough activities submitted yet".into(),
                ));
            }

            // Re-revealing a day is a no-op returning the original pick
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM group_reveals
                     WHERE group_id = ?1 AND week_start = ?2 AND day_number = ?3",
                    params![group_id, week_start, day_number],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(reveal_id) = existing {
                return Ok(RevealOutcome {
                    revealed_activity: reveal_record(&conn, &reveal_id)?,
                    already_revealed: true,
                });
            }

            let candidates: Vec<String> = {
                let mut stmt = conn.prepare(
                    "SELECT id FROM weekly_submissions
                     WHERE group_id = ?1 AND week_start = ?2
                       AND id NOT IN (SELECT submission_id FROM group_reveals
                                      WHERE group_id = ?1 AND week_start = ?2)
                     ORDER BY submission_order",
                )?;
                let rows = stmt.query_map(params![group_id, week_start], |row| row.get(0))?;
                rows.collect::<Result<_, _>>()?
            };
            let picked = pick_uniform(rng, &candidates)
                .cloned()
                .ok_or_else(|| AppError::InvalidState("All activities already revealed".into()))?;

            let reveal_id = uuid::Uuid::now_v7().to_string();
            let revealed_at = format_ts(now);
            conn.execute(
                "INSERT INTO group_reveals (id, group_id, week_start, day_number, submission_id, revealed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![reveal_id, group_id, week_start, day_number, picked, revealed_at],
            )?;
            conn.execute(
                "UPDATE weekly_submissions SET is_revealed = 1, revealed_at = ?1 WHERE id = ?2",
                params![revealed_at, picked],
            )?;

            let revealed: i64 = conn.query_row(
                "SELECT COUNT(*) FROM group_reveals WHERE group_id = ?1 AND week_start = ?2",
                params![group_id, week_start],
                |row| row.get(0),
            )?;
            conn.execute(
                "UPDATE groups SET current_reveal_id = ?1, week_phase = ?2 WHERE id = ?3",
                params![
                    reveal_id,
                    group.week_phase.after_reveal(revealed).as_str(),
                    group_id
                ],
            )?;

            Ok(RevealOutcome {
                revealed_activity: reveal_record(&conn, &reveal_id)?,
                already_revealed: false,
            })
        })
    }

    async fn complete_current(
        &self,
        group_id: &str,
        actor_id: &str,
        proof: &str,
        description: &str,
        now: DateTime<Utc>,
    ) -> AppResult<CompletionReceipt> {
        let conn = self.pool.get()?;
        with_tx(&conn, || {
            let group = group_row(&conn, group_id)?;
            if !is_member(&conn, group_id, actor_id)? {
                return Err(AppError::Forbidden("User not in group".into()));
            }
            let submission_id = current_submission_id(&conn, &group)?;
            complete_inner(&conn, group_id, &submission_id, actor_id, proof, description, now)
        })
    }

    async fn complete_submission(
        &self,
        group_id: &str,
        submission_id: &str,
        actor_id: &str,
        proof: &str,
        description: &str,
        now: DateTime<Utc>,
    ) -> AppResult<CompletionReceipt> {
        let conn = self.pool.get()?;
        with_tx(&conn, || {
            let group = group_row(&conn, group_id)?;
            if !is_member(&conn, group_id, actor_id)? {
                return Err(AppError::Forbidden("User not in group".into()));
            }
            let current = current_submission_id(&conn, &group)?;
            if current != submission_id {
                return Err(AppError::InvalidState(
                    "Activity is not the current day's reveal".into(),
                ));
            }
            complete_inner(&conn, group_id, submission_id, actor_id, proof, description, now)
        })
    }

    async fn rankings(&self, group_id: &str) -> AppResult<Vec<RankingEntry>> {
        let conn = self.pool.get()?;
        group_row(&conn, group_id)?;
        Ok(rank_by_points(member_standings(&conn, group_id)?))
    }

    async fn daily_feed(
        &self,
        group_id: &str,
        viewer_id: &str,
        friends_only: bool,
    ) -> AppResult<GroupDailyFeed> {
        let conn = self.pool.get()?;
        let group = group_row(&conn, group_id)?;
        if !is_member(&conn, group_id, viewer_id)? {
            return Err(AppError::Forbidden("User not in group".into()));
        }

        let Some(ref reveal_id) = group.current_reveal_id else {
            return Ok(GroupDailyFeed {
                status: FeedStatus::Locked,
                activity: None,
                completions: Vec::new(),
                total_participants: 0,
                friends_participants: 0,
            });
        };
        let activity = reveal_record(&conn, reveal_id)?;

        let viewer_posted: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM group_completions
             WHERE group_id = ?1 AND submission_id = ?2 AND user_id = ?3",
            params![group_id, activity.submission_id, viewer_id],
            |row| row.get(0),
        )?;
        let status = FeedStatus::from_has_posted(viewer_posted);

        let total_participants: i64 = conn.query_row(
            "SELECT COUNT(*) FROM group_completions WHERE group_id = ?1 AND submission_id = ?2",
            params![group_id, activity.submission_id],
            |row| row.get(0),
        )?;

        if !status.is_unlocked() {
            // Locked: public metadata only, nobody else's content
            return Ok(GroupDailyFeed {
                status,
                activity: Some(activity),
                completions: Vec::new(),
                total_participants,
                friends_participants: 0,
            });
        }

        let friends_filter = if friends_only {
            " AND (c.user_id = ?3 OR EXISTS (
                 SELECT 1 FROM follows f
                 WHERE f.follower_id = ?3 AND f.following_id = c.user_id))"
        } else {
            ""
        };
        let completions: Vec<GroupCompletion> = {
            let sql = format!(
                "SELECT c.id, c.group_id, c.submission_id, c.user_id, u.username,
                        c.description, c.completion_order, c.points_earned, c.completed_at
                 FROM group_completions c
                 JOIN users u ON u.id = c.user_id
                 WHERE c.group_id = ?1 AND c.submission_id = ?2{}
                 ORDER BY c.completed_at DESC",
                friends_filter
            );
            let mut stmt = conn.prepare(&sql)?;
            let map = |row: &rusqlite::Row<'_>| {
                Ok(GroupCompletion {
                    id: row.get(0)?,
                    group_id: row.get(1)?,
                    submission_id: row.get(2)?,
                    user_id: row.get(3)?,
                    username: row.get(4)?,
                    description: row.get(5)?,
                    completion_order: row.get(6)?,
                    points_earned: row.get(7)?,
                    completed_at: row.get(8)?,
                })
            };
            let rows = if friends_only {
                stmt.query_map(params![group_id, activity.submission_id, viewer_id], map)?
                    .collect::<Result<_, _>>()?
            } else {
                stmt.query_map(params![group_id, activity.submission_id], map)?
                    .collect::<Result<_, _>>()?
            };
            rows
        };
        let friends_participants = completions.len() as i64;

        Ok(GroupDailyFeed {
            status,
            activity: Some(activity),
            completions,
            total_participants,
            friends_participants,
        })
    }
}

fn member_standings(conn: &Connection, group_id: &str) -> AppResult<Vec<RankingEntry>> {
    let mut stmt = conn.prepare(
        "SELECT gm.user_id, u.username, u.full_name, u.avatar_color, gm.points
         FROM group_members gm
         JOIN users u ON u.id = gm.user_id
         WHERE gm.group_id = ?1
         ORDER BY gm.joined_at",
    )?;
    let rows = stmt.query_map(params![group_id], |row| {
        Ok(RankingEntry {
            user_id: row.get(0)?,
            username: row.get(1)?,
            full_name: row.get(2)?,
            avatar_color: row.get(3)?,
            points: row.get(4)?,
            rank: 0,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_repo() -> SqliteGroupRepository {
        let pool = db::create_memory_pool().unwrap();
        db::run_migrations(&pool).unwrap();
        SqliteGroupRepository::new(pool)
    }

    fn seed_users(repo: &SqliteGroupRepository, n: usize) -> Vec<String> {
        let conn = repo.pool.get().unwrap();
        (0..n)
            .map(|i| {
                let id = format!("u{}", i);
                conn.execute(
                    "INSERT INTO users (id, username, email, password_hash, full_name, avatar_color)
                     VALUES (?1, ?2, ?3, 'h', ?4, '#FF6B6B')",
                    params![id, format!("user{}", i), format!("u{}@x.io", i), format!("User {}", i)],
                )
                .unwrap();
                id
            })
            .collect()
    }

    fn new_group(creator: &str) -> NewGroup {
        NewGroup {
            name: "Morning Crew".into(),
            description: "".into(),
            category: "fitness".into(),
            is_public: false,
            created_by: creator.into(),
        }
    }

    async fn group_with_members(
        repo: &SqliteGroupRepository,
        users: &[String],
    ) -> Group {
        let mut rng = StdRng::seed_from_u64(1);
        let group = repo.create(new_group(&users[0]), &mut rng).await.unwrap();
        for user in &users[1..] {
            repo.join(&group.id, user).await.unwrap();
        }
        repo.get(&group.id).await.unwrap()
    }

    /// Admin starts the week and the members fill all 7 slots.
    async fn start_full_week(repo: &SqliteGroupRepository, group: &Group, users: &[String]) {
        repo.start_week(&group.id, &users[0], chrono::Utc::now())
            .await
            .unwrap();
        for (i, user) in users.iter().take(7).enumerate() {
            repo.submit_activity(
                &group.id,
                user,
                &format!("Idea {}", i + 1),
                "",
                chrono::Utc::now(),
            )
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn create_makes_creator_sole_member_and_admin() {
        let repo = test_repo();
        let users = seed_users(&repo, 1);
        let mut rng = StdRng::seed_from_u64(2);
        let group = repo.create(new_group(&users[0]), &mut rng).await.unwrap();

        assert_eq!(group.members, vec![users[0].clone()]);
        assert_eq!(group.member_count, 1);
        assert_eq!(group.admin_id, users[0]);
        assert_eq!(group.week_phase, WeekPhase::Forming);
        assert_eq!(group.invite_code.len(), 6);
        assert_eq!(group.current_week_points.get(&users[0]), Some(&0));
    }

    #[tokio::test]
    async fn invite_codes_never_collide() {
        let repo = test_repo();
        let users = seed_users(&repo, 1);
        let mut rng = StdRng::seed_from_u64(3);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let group = repo.create(new_group(&users[0]), &mut rng).await.unwrap();
            assert!(seen.insert(group.invite_code), "duplicate invite code");
        }
    }

    #[tokio::test]
    async fn join_caps_at_seven_members() {
        let repo = test_repo();
        let users = seed_users(&repo, 8);
        let group = group_with_members(&repo, &users[..7]).await;
        assert_eq!(group.member_count, 7);

        let err = repo.join(&group.id, &users[7]).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        // No silent truncation
        let group = repo.get(&group.id).await.unwrap();
        assert_eq!(group.member_count, 7);
        assert_eq!(group.members.len(), 7);
    }

    #[tokio::test]
    async fn duplicate_join_is_a_conflict() {
        let repo = test_repo();
        let users = seed_users(&repo, 2);
        let group = group_with_members(&repo, &users).await;
        let err = repo.join(&group.id, &users[1]).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn join_by_code_resolves_group() {
        let repo = test_repo();
        let users = seed_users(&repo, 2);
        let mut rng = StdRng::seed_from_u64(4);
        let group = repo.create(new_group(&users[0]), &mut rng).await.unwrap();

        let outcome = repo.join_by_code(&group.invite_code, &users[1]).await.unwrap();
        assert_eq!(outcome.group_id, group.id);
        assert_eq!(outcome.other_members, vec![users[0].clone()]);

        let err = repo.join_by_code("ZZZZZZ", &users[1]).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn only_admin_starts_the_week_or_sets_the_day() {
        let repo = test_repo();
        let users = seed_users(&repo, 2);
        let group = group_with_members(&repo, &users).await;

        let err = repo
            .start_week(&group.id, &users[1], chrono::Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let err = repo
            .set_submission_day(&group.id, &users[1], "Monday")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        repo.set_submission_day(&group.id, &users[0], "Monday")
            .await
            .unwrap();
        let group = repo.get(&group.id).await.unwrap();
        assert_eq!(group.submission_day.as_deref(), Some("Monday"));
    }

    #[tokio::test]
    async fn submit_requires_open_phase_and_membership() {
        let repo = test_repo();
        let users = seed_users(&repo, 3);
        let group = group_with_members(&repo, &users[..2]).await;

        let err = repo
            .submit_activity(&group.id, &users[0], "Pushups", "", chrono::Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));

        repo.start_week(&group.id, &users[0], chrono::Utc::now())
            .await
            .unwrap();
        let err = repo
            .submit_activity(&group.id, &users[2], "Pushups", "", chrono::Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn seventh_submission_flips_phase_and_eighth_fails() {
        let repo = test_repo();
        let users = seed_users(&repo, 7);
        let group = group_with_members(&repo, &users).await;
        repo.start_week(&group.id, &users[0], chrono::Utc::now())
            .await
            .unwrap();

        for i in 0..7 {
            let outcome = repo
                .submit_activity(&group.id, &users[i], &format!("Idea {}", i + 1), "", chrono::Utc::now())
                .await
                .unwrap();
            assert_eq!(outcome.submission_count, i as i64 + 1);
            assert_eq!(outcome.remaining, 7 - i as i64 - 1);
        }

        let group_after = repo.get(&group.id).await.unwrap();
        assert_eq!(group_after.week_phase, WeekPhase::RevealInProgress);
        assert_eq!(group_after.activities_submitted, 7);

        let err = repo
            .submit_activity(&group.id, &users[0], "One more", "", chrono::Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
    }

    #[tokio::test]
    async fn submission_orders_are_monotonic_from_one() {
        let repo = test_repo();
        let users = seed_users(&repo, 7);
        let group = group_with_members(&repo, &users).await;
        start_full_week(&repo, &group, &users).await;

        let activities = repo.weekly_activities(&group.id).await.unwrap();
        let orders: Vec<i64> = activities.iter().map(|a| a.submission_order).collect();
        assert_eq!(orders, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn reveal_needs_all_seven_submissions() {
        let repo = test_repo();
        let users = seed_users(&repo, 2);
        let group = group_with_members(&repo, &users).await;
        repo.start_week(&group.id, &users[0], chrono::Utc::now())
            .await
            .unwrap();
        repo.submit_activity(&group.id, &users[0], "Only one", "", chrono::Utc::now())
            .await
            .unwrap();

        let mut rng = StdRng::seed_from_u64(5);
        let err = repo
            .reveal_day(&group.id, 1, chrono::Utc::now(), &mut rng)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
    }

    #[tokio::test]
    async fn reveal_is_idempotent_per_day() {
        let repo = test_repo();
        let users = seed_users(&repo, 7);
        let group = group_with_members(&repo, &users).await;
        start_full_week(&repo, &group, &users).await;

        let mut rng = StdRng::seed_from_u64(6);
        let first = repo
            .reveal_day(&group.id, 1, chrono::Utc::now(), &mut rng)
            .await
            .unwrap();
        assert!(!first.already_revealed);

        let second = repo
            .reveal_day(&group.id, 1, chrono::Utc::now(), &mut rng)
            .await
            .unwrap();
        assert!(second.already_revealed);
        assert_eq!(
            second.revealed_activity.submission_id,
            first.revealed_activity.submission_id
        );

        // The repeat did not consume another unrevealed submission
        let revealed = repo
            .weekly_activities(&group.id)
            .await
            .unwrap()
            .iter()
            .filter(|a| a.is_revealed)
            .count();
        assert_eq!(revealed, 1);
    }

    #[tokio::test]
    async fn seven_reveals_cover_every_submission_exactly_once() {
        let repo = test_repo();
        let users = seed_users(&repo, 7);
        let group = group_with_members(&repo, &users).await;
        start_full_week(&repo, &group, &users).await;

        let mut rng = StdRng::seed_from_u64(7);
        let mut revealed_ids = std::collections::HashSet::new();
        for day in 1..=7 {
            let outcome = repo
                .reveal_day(&group.id, day, chrono::Utc::now(), &mut rng)
                .await
                .unwrap();
            assert!(revealed_ids.insert(outcome.revealed_activity.submission_id));
        }

        let submitted_ids: std::collections::HashSet<String> = repo
            .weekly_activities(&group.id)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(revealed_ids, submitted_ids);

        let group_after = repo.get(&group.id).await.unwrap();
        assert_eq!(group_after.week_phase, WeekPhase::WeekComplete);
        assert_eq!(group_after.daily_reveals.len(), 7);
        assert!(group_after
            .daily_reveals
            .iter()
            .map(|r| r.day_number)
            .eq(1..=7));

        let mut rng2 = StdRng::seed_from_u64(8);
        // Day 8 is out of range; re-revealing day 3 is still a no-op
        let err = repo
            .reveal_day(&group.id, 8, chrono::Utc::now(), &mut rng2)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        let again = repo
            .reveal_day(&group.id, 3, chrono::Utc::now(), &mut rng2)
            .await
            .unwrap();
        assert!(again.already_revealed);
    }

    #[tokio::test]
    async fn completion_points_follow_arrival_order() {
        let repo = test_repo();
        let users = seed_users(&repo, 7);
        let group = group_with_members(&repo, &users).await;
        start_full_week(&repo, &group, &users).await;

        let mut rng = StdRng::seed_from_u64(9);
        repo.reveal_day(&group.id, 1, chrono::Utc::now(), &mut rng)
            .await
            .unwrap();

        let mut earned = Vec::new();
        for user in users.iter().take(4) {
            let receipt = repo
                .complete_current(&group.id, user, "proof", "", chrono::Utc::now())
                .await
                .unwrap();
            earned.push(receipt.points_earned);
        }
        assert_eq!(earned, vec![3, 2, 1, 0]);
        assert_eq!(earned.iter().sum::<i64>(), 6);

        let group_after = repo.get(&group.id).await.unwrap();
        assert_eq!(group_after.current_week_points.get(&users[0]), Some(&3));
        assert_eq!(group_after.current_week_points.get(&users[3]), Some(&0));
    }

    #[tokio::test]
    async fn double_completion_is_a_conflict() {
        let repo = test_repo();
        let users = seed_users(&repo, 7);
        let group = group_with_members(&repo, &users).await;
        start_full_week(&repo, &group, &users).await;

        let mut rng = StdRng::seed_from_u64(10);
        repo.reveal_day(&group.id, 1, chrono::Utc::now(), &mut rng)
            .await
            .unwrap();

        repo.complete_current(&group.id, &users[0], "proof", "", chrono::Utc::now())
            .await
            .unwrap();
        let err = repo
            .complete_current(&group.id, &users[0], "proof", "", chrono::Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        // Points were not double counted
        let group_after = repo.get(&group.id).await.unwrap();
        assert_eq!(group_after.current_week_points.get(&users[0]), Some(&3));
    }

    #[tokio::test]
    async fn completion_requires_a_reveal() {
        let repo = test_repo();
        let users = seed_users(&repo, 7);
        let group = group_with_members(&repo, &users).await;
        start_full_week(&repo, &group, &users).await;

        let err = repo
            .complete_current(&group.id, &users[0], "proof", "", chrono::Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
    }

    #[tokio::test]
    async fn complete_by_id_must_match_current_reveal() {
        let repo = test_repo();
        let users = seed_users(&repo, 7);
        let group = group_with_members(&repo, &users).await;
        start_full_week(&repo, &group, &users).await;

        let mut rng = StdRng::seed_from_u64(11);
        let reveal = repo
            .reveal_day(&group.id, 1, chrono::Utc::now(), &mut rng)
            .await
            .unwrap();

        let other_id = repo
            .weekly_activities(&group.id)
            .await
            .unwrap()
            .into_iter()
            .find(|a| a.id != reveal.revealed_activity.submission_id)
            .unwrap()
            .id;
        let err = repo
            .complete_submission(&group.id, &other_id, &users[0], "p", "", chrono::Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));

        let receipt = repo
            .complete_submission(
                &group.id,
                &reveal.revealed_activity.submission_id,
                &users[0],
                "p",
                "",
                chrono::Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(receipt.points_earned, 3);
    }

    #[tokio::test]
    async fn rankings_sort_by_points_with_one_based_ranks() {
        let repo = test_repo();
        let users = seed_users(&repo, 7);
        let group = group_with_members(&repo, &users).await;
        start_full_week(&repo, &group, &users).await;

        let mut rng = StdRng::seed_from_u64(12);
        repo.reveal_day(&group.id, 1, chrono::Utc::now(), &mut rng)
            .await
            .unwrap();
        // users[2] completes first, then users[5]
        repo.complete_current(&group.id, &users[2], "p", "", chrono::Utc::now())
            .await
            .unwrap();
        repo.complete_current(&group.id, &users[5], "p", "", chrono::Utc::now())
            .await
            .unwrap();

        let rankings = repo.rankings(&group.id).await.unwrap();
        assert_eq!(rankings.len(), 7);
        assert_eq!(rankings[0].user_id, users[2]);
        assert_eq!(rankings[0].points, 3);
        assert_eq!(rankings[0].rank, 1);
        assert_eq!(rankings[1].user_id, users[5]);
        assert_eq!(rankings[1].points, 2);
        assert_eq!(rankings[1].rank, 2);
    }

    #[tokio::test]
    async fn starting_a_new_week_archives_the_old_standings() {
        let repo = test_repo();
        let users = seed_users(&repo, 7);
        let group = group_with_members(&repo, &users).await;
        start_full_week(&repo, &group, &users).await;

        let mut rng = StdRng::seed_from_u64(13);
        repo.reveal_day(&group.id, 1, chrono::Utc::now(), &mut rng)
            .await
            .unwrap();
        repo.complete_current(&group.id, &users[1], "p", "", chrono::Utc::now())
            .await
            .unwrap();

        let old_week = repo.get(&group.id).await.unwrap().current_week_start.unwrap();
        repo.start_week(&group.id, &users[0], chrono::Utc::now())
            .await
            .unwrap();

        let conn = repo.pool.get().unwrap();
        let (archived, winner_points): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*),
                        (SELECT total_points FROM weekly_rankings
                         WHERE group_id = ?1 AND week_start = ?2 AND rank_position = 1)
                 FROM weekly_rankings WHERE group_id = ?1 AND week_start = ?2",
                params![group.id, old_week],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(archived, 7);
        assert_eq!(winner_points, 3);
        drop(conn);

        // Live aggregate carries only the fresh week
        let group_after = repo.get(&group.id).await.unwrap();
        assert_eq!(group_after.week_phase, WeekPhase::SubmissionOpen);
        assert_eq!(group_after.activities_submitted, 0);
        assert!(group_after.current_day_activity.is_none());
        assert!(group_after.current_week_points.values().all(|p| *p == 0));
    }

    #[tokio::test]
    async fn daily_feed_unlocks_after_own_completion() {
        let repo = test_repo();
        let users = seed_users(&repo, 7);
        let group = group_with_members(&repo, &users).await;
        start_full_week(&repo, &group, &users).await;

        let mut rng = StdRng::seed_from_u64(14);
        repo.reveal_day(&group.id, 1, chrono::Utc::now(), &mut rng)
            .await
            .unwrap();
        repo.complete_current(&group.id, &users[1], "p", "done", chrono::Utc::now())
            .await
            .unwrap();

        // users[0] has not posted: locked, no content, count visible
        let feed = repo.daily_feed(&group.id, &users[0], false).await.unwrap();
        assert_eq!(feed.status, FeedStatus::Locked);
        assert!(feed.completions.is_empty());
        assert_eq!(feed.total_participants, 1);

        repo.complete_current(&group.id, &users[0], "p", "", chrono::Utc::now())
            .await
            .unwrap();
        let feed = repo.daily_feed(&group.id, &users[0], false).await.unwrap();
        assert_eq!(feed.status, FeedStatus::Unlocked);
        assert_eq!(feed.completions.len(), 2);

        // Non-members never see the feed
        let conn = repo.pool.get().unwrap();
        conn.execute(
            "INSERT INTO users (id, username, email, password_hash, full_name, avatar_color)
             VALUES ('outsider', 'outsider', 'out@x.io', 'h', 'Out Sider', '#FF9F43')",
            [],
        )
        .unwrap();
        drop(conn);
        let err = repo.daily_feed(&group.id, "outsider", false).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }
}
