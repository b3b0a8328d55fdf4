use std::sync::Arc;

use axum::{extract::Extension, response::IntoResponse, Json};

use crate::app::errors;
use crate::app::services::{self, AppServices};

pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services::blocking(services, |s| s.stats()).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}
