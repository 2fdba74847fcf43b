mod health;
mod index;
mod metrics;
pub mod page;
mod process;
mod runs;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub use health::Status;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/", get(index::index))
        .route("/process", post(process::process_video))
        .route("/runs/{id}", get(runs::run_status))
        .route("/runs/{id}/video", get(runs::run_video))
        .route("/runs/{id}/download", get(runs::run_download))
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
}
