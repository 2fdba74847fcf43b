mod cv_utils;
mod routes;

pub mod app;
pub mod config;
pub mod metrics;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod telemetry;

pub use app::start_app;
pub use cv_utils::{annotate_frame, encode_jpg, format_label, mat_to_rgb, CvUtilsError};
