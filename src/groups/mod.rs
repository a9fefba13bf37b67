pub mod domain;
pub mod repository;

pub use domain::{Group, RevealRecord, WeekPhase};
pub use repository::{GroupRepository, NewGroup, SqliteGroupRepository};
