use axum::{
    routing::{get, post},
    Router,
};

pub mod error;
pub mod extract;
pub mod handlers;
pub mod types;

use crate::app_state::AppState;
use handlers::{generate_handler, health_handler};

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/generate", post(generate_handler))
        .route("/health", get(health_handler))
}
