pub mod challenges;
pub mod daily;
pub mod groups;
pub mod health;
pub mod notifications;
pub mod social;
pub mod submissions;
pub mod users;

use axum::Router;

use crate::state::AppState;

/// Every API route, mounted by main under the /api prefix.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(users::router())
        .merge(social::router())
        .merge(notifications::router())
        .merge(submissions::router())
        .merge(groups::router())
        .merge(daily::router())
        .merge(challenges::router())
}
