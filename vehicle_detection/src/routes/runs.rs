use crate::{
    server::SharedState,
    session::{RunStatus, SessionError, OUTPUT_FILE_NAME, OUTPUT_MIME_TYPE},
};
use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Json, Response},
};
use uuid::Uuid;

pub async fn run_status(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunStatus>, SessionError> {
    Ok(Json(state.session.runs().status(id)?))
}

pub async fn run_video(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Response, SessionError> {
    output_response(&state, id, "inline".to_string()).await
}

pub async fn run_download(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Response, SessionError> {
    let disposition = format!("attachment; filename=\"{}\"", OUTPUT_FILE_NAME);
    output_response(&state, id, disposition).await
}

async fn output_response(
    state: &SharedState,
    id: Uuid,
    disposition: String,
) -> Result<Response, SessionError> {
    let output = state.session.runs().output(id)?;
    let bytes = tokio::fs::read(&output.path).await?;

    Ok((
        [
            (header::CONTENT_TYPE, OUTPUT_MIME_TYPE.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}
