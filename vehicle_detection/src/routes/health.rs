use axum::response::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct Status {
    pub status: String,
}

pub async fn healthcheck() -> Json<Status> {
    Json(Status {
        status: "Available".into(),
    })
}
