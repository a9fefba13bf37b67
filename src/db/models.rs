use serde::{Deserialize, Serialize};

/// Public view of a user. Password hash and email stay out of wire payloads
/// except where the original registration contract returns the email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub avatar_color: String,
    pub groups: Vec<String>,
    pub achievements: Vec<String>,
    pub stats: UserStats,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserStats {
    pub total_activities: i64,
    pub current_streak: i64,
    pub total_groups_joined: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub token: String,
    pub expires_at: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub data: serde_json::Value,
    pub read: bool,
    pub created_at: String,
}

/// Free-form activity post inside a group, outside the weekly cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub user_id: String,
    pub username: String,
    pub group_id: String,
    pub challenge_type: String,
    pub description: String,
    pub photo_data: Option<String>,
    pub votes: i64,
    pub reactions: serde_json::Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Achievement {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub icon: &'static str,
}
