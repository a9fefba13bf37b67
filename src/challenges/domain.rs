// Domain types for global challenges - pure, no side effects
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Challenge lifecycle. At most one challenge is `Active` system-wide at any
/// instant; activation demotes every other active challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStatus {
    Scheduled,
    Active,
    Expired,
}

impl ChallengeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Active => "active",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(Self::Scheduled),
            "active" => Some(Self::Active),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status a challenge's time window implies at `now`.
pub fn derive_status(
    now: DateTime<Utc>,
    starts_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> ChallengeStatus {
    if now >= expires_at {
        ChallengeStatus::Expired
    } else if now >= starts_at {
        ChallengeStatus::Active
    } else {
        ChallengeStatus::Scheduled
    }
}

/// Whether the prompt-response window has lapsed. Surfaced to callers as a
/// flag only; submissions stay open until the challenge deactivates.
pub fn promptness_expired(
    now: DateTime<Utc>,
    created_at: DateTime<Utc>,
    window_minutes: i64,
) -> bool {
    now > created_at + Duration::minutes(window_minutes)
}

/// Prompts used by the auto-scheduler, one per upcoming day.
pub const AUTO_PROMPTS: &[&str] = &[
    "Take a photo of your morning workout setup!",
    "Share a picture of your healthy meal today!",
    "Show us your favorite exercise spot!",
    "Capture a moment of stretching or yoga!",
    "Photo of you staying hydrated!",
    "Share your post-workout feeling!",
    "Take a photo of something that motivates you to stay active!",
    "Show us your workout gear!",
    "Capture yourself trying a new activity!",
    "Photo of you enjoying movement outdoors!",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub prompt: String,
    pub created_at: String,
    pub expires_at: String,
    pub promptness_window_minutes: i64,
    pub status: ChallengeStatus,
    pub auto_scheduled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentChallenge {
    pub challenge: Challenge,
    pub promptness_expired: bool,
    pub time_remaining: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChallengeSubmission {
    pub id: String,
    pub challenge_id: String,
    pub user_id: String,
    pub username: String,
    pub challenge_prompt: String,
    pub description: String,
    pub photo_data: Option<String>,
    pub votes: i64,
    pub comments: Vec<Comment>,
    pub reactions: serde_json::Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub user_id: String,
    pub username: String,
    pub comment: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoteOutcome {
    pub voted: bool,
    pub votes: i64,
}
