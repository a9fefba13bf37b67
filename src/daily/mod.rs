pub mod domain;
pub mod repository;

pub use domain::{DailyActivity, NewCatalogActivity};
pub use repository::{DailyActivityRepository, SqliteDailyActivityRepository};
