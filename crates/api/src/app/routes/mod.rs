use axum::{routing::get, Router};

pub mod filings;
pub mod jobs;
pub mod system;

/// Router for every coordinator-backed endpoint.
pub fn router() -> Router {
    Router::new()
        .nest("/filings", filings::router())
        .route("/jobs/stats", get(jobs::stats))
}
