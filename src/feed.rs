//! Post-to-unlock gating shared by the daily-activity and challenge feeds.

use serde::{Deserialize, Serialize};

/// A viewer sees other people's posts for a time-scoped activity only after
/// posting their own. Locked feeds carry public metadata, never content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Locked,
    Unlocked,
}

impl FeedStatus {
    pub fn from_has_posted(has_posted: bool) -> Self {
        if has_posted {
            Self::Unlocked
        } else {
            Self::Locked
        }
    }

    pub fn is_unlocked(&self) -> bool {
        matches!(self, Self::Unlocked)
    }
}
