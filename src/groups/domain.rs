// Domain types for the weekly challenge cycle - pure, no side effects
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const MAX_MEMBERS: i64 = 7;
pub const ACTIVITIES_PER_WEEK: i64 = 7;
pub const INVITE_CODE_LEN: usize = 6;

/// Where a group sits in its weekly cycle.
///
/// Replaces the loose `submission_phase_active` flag + counter pair with one
/// enumerated state so the two cannot diverge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeekPhase {
    /// Group exists, no week started yet.
    Forming,
    /// Admin opened the week; members may submit ideas.
    SubmissionOpen,
    /// All 7 ideas are in; days are being revealed one by one.
    RevealInProgress,
    /// All 7 days revealed. Completions of the current day remain open.
    WeekComplete,
}

impl WeekPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forming => "forming",
            Self::SubmissionOpen => "submission_open",
            Self::RevealInProgress => "reveal_in_progress",
            Self::WeekComplete => "week_complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "forming" => Some(Self::Forming),
            "submission_open" => Some(Self::SubmissionOpen),
            "reveal_in_progress" => Some(Self::RevealInProgress),
            "week_complete" => Some(Self::WeekComplete),
            _ => None,
        }
    }

    /// Transition: admin starts a fresh week. Valid from any phase; a
    /// restart abandons the running week.
    pub fn start_week(self) -> Self {
        Self::SubmissionOpen
    }

    /// Transition after an idea lands. The 7th submission closes the phase
    /// in the same step, not via a separate admin action.
    pub fn after_submission(self, submitted: i64) -> Self {
        if submitted >= ACTIVITIES_PER_WEEK {
            Self::RevealInProgress
        } else {
            Self::SubmissionOpen
        }
    }

    /// Transition after a reveal.
    pub fn after_reveal(self, revealed: i64) -> Self {
        if revealed >= ACTIVITIES_PER_WEEK {
            Self::WeekComplete
        } else {
            Self::RevealInProgress
        }
    }

    pub fn accepts_submissions(&self) -> bool {
        matches!(self, Self::SubmissionOpen)
    }

    pub fn accepts_reveals(&self) -> bool {
        // WeekComplete still accepts reveal calls so a repeated reveal of an
        // already-revealed day stays a no-op rather than an error.
        matches!(self, Self::RevealInProgress | Self::WeekComplete)
    }
}

impl fmt::Display for WeekPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Points by arrival order among completions of one activity: 3/2/1, then 0.
pub fn points_for_order(completion_order: i64) -> i64 {
    match completion_order {
        1 => 3,
        2 => 2,
        3 => 1,
        _ => 0,
    }
}

/// 6-char uppercase alphanumeric invite code.
pub fn generate_invite_code<R: Rng>(rng: &mut R) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    (0..INVITE_CODE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Uniform pick among remaining candidates. All of the week's ideas are
/// equally likely on the day, independent of submission order.
pub fn pick_uniform<'a, T, R: Rng>(rng: &mut R, items: &'a [T]) -> Option<&'a T> {
    if items.is_empty() {
        return None;
    }
    Some(&items[rng.gen_range(0..items.len())])
}

/// Start of the current day, UTC midnight.
pub fn week_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub is_public: bool,
    pub created_by: String,
    pub admin_id: String,
    pub invite_code: String,
    pub week_phase: WeekPhase,
    pub submission_day: Option<String>,
    pub current_week_start: Option<String>,
    pub activities_submitted: i64,
    pub activities_needed: i64,
    pub members: Vec<String>,
    pub member_count: i64,
    pub max_members: i64,
    pub current_week_points: BTreeMap<String, i64>,
    pub daily_reveals: Vec<RevealRecord>,
    pub current_day_activity: Option<RevealRecord>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeeklySubmission {
    pub id: String,
    pub group_id: String,
    pub submitted_by: String,
    pub title: String,
    pub description: String,
    pub week_start: String,
    pub submission_order: i64,
    pub is_revealed: bool,
    pub revealed_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevealRecord {
    pub day_number: i64,
    pub submission_id: String,
    pub title: String,
    pub description: String,
    pub submitted_by: String,
    pub revealed_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionReceipt {
    pub points_earned: i64,
    pub completion_order: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupCompletion {
    pub id: String,
    pub group_id: String,
    pub submission_id: String,
    pub user_id: String,
    pub username: String,
    pub description: String,
    pub completion_order: i64,
    pub points_earned: i64,
    pub completed_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankingEntry {
    pub user_id: String,
    pub username: String,
    pub full_name: String,
    pub avatar_color: String,
    pub points: i64,
    pub rank: i64,
}

/// Sort descending by points and assign 1-based ranks. Ties keep the input
/// order (stable sort); tie order is unspecified beyond that.
pub fn rank_by_points(mut entries: Vec<RankingEntry>) -> Vec<RankingEntry> {
    entries.sort_by(|a, b| b.points.cmp(&a.points));
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.rank = i as i64 + 1;
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn phase_round_trips_through_strings() {
        for phase in [
            WeekPhase::Forming,
            WeekPhase::SubmissionOpen,
            WeekPhase::RevealInProgress,
            WeekPhase::WeekComplete,
        ] {
            assert_eq!(WeekPhase::parse(phase.as_str()), Some(phase));
        }
        assert_eq!(WeekPhase::parse("bogus"), None);
    }

    #[test]
    fn seventh_submission_closes_the_phase() {
        let phase = WeekPhase::SubmissionOpen;
        assert_eq!(phase.after_submission(6), WeekPhase::SubmissionOpen);
        assert_eq!(phase.after_submission(7), WeekPhase::RevealInProgress);
    }

    #[test]
    fn seventh_reveal_completes_the_week() {
        let phase = WeekPhase::RevealInProgress;
        assert_eq!(phase.after_reveal(6), WeekPhase::RevealInProgress);
        assert_eq!(phase.after_reveal(7), WeekPhase::WeekComplete);
    }

    #[test]
    fn restart_is_valid_from_any_phase() {
        for phase in [
            WeekPhase::Forming,
            WeekPhase::SubmissionOpen,
            WeekPhase::RevealInProgress,
            WeekPhase::WeekComplete,
        ] {
            assert_eq!(phase.start_week(), WeekPhase::SubmissionOpen);
        }
    }

    #[test]
    fn completed_week_still_accepts_reveal_calls() {
        assert!(WeekPhase::WeekComplete.accepts_reveals());
        assert!(!WeekPhase::WeekComplete.accepts_submissions());
        assert!(!WeekPhase::Forming.accepts_reveals());
    }

    #[test]
    fn points_follow_arrival_order() {
        assert_eq!(points_for_order(1), 3);
        assert_eq!(points_for_order(2), 2);
        assert_eq!(points_for_order(3), 1);
        assert_eq!(points_for_order(4), 0);
        assert_eq!(points_for_order(100), 0);
    }

    #[test]
    fn invite_codes_are_six_uppercase_alphanumerics() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let code = generate_invite_code(&mut rng);
            assert_eq!(code.len(), 6);
            assert!(code
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn pick_uniform_covers_all_candidates() {
        let mut rng = StdRng::seed_from_u64(42);
        let items = vec!["a", "b", "c", "d"];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(*pick_uniform(&mut rng, &items).unwrap());
        }
        assert_eq!(seen.len(), items.len());
        assert!(pick_uniform::<&str, _>(&mut rng, &[]).is_none());
    }

    #[test]
    fn week_start_is_utc_midnight() {
        let now = "2026-08-07T15:42:10Z".parse::<DateTime<Utc>>().unwrap();
        let start = week_start(now);
        assert_eq!(start.to_rfc3339(), "2026-08-07T00:00:00+00:00");
    }

    #[test]
    fn ranking_sorts_descending_with_stable_ties() {
        let entry = |user: &str, points: i64| RankingEntry {
            user_id: user.into(),
            username: user.into(),
            full_name: user.into(),
            avatar_color: "#FF6B6B".into(),
            points,
            rank: 0,
        };
        let ranked = rank_by_points(vec![entry("a", 2), entry("b", 5), entry("c", 2)]);
        assert_eq!(ranked[0].user_id, "b");
        assert_eq!(ranked[0].rank, 1);
        // a and c tie on points; stable sort keeps a before c
        assert_eq!(ranked[1].user_id, "a");
        assert_eq!(ranked[2].user_id, "c");
        assert_eq!(ranked[2].rank, 3);
    }
}
