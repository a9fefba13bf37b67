pub mod domain;
pub mod repository;

pub use domain::{Challenge, ChallengeStatus};
pub use repository::{ChallengeRepository, NewChallenge, SqliteChallengeRepository};
