use crate::{
    routes::page,
    server::SharedState,
    session::{parse_threshold, video_extension, PendingRun, Session, SessionError},
};
use axum::{
    extract::{
        multipart::{Field, MultipartError},
        Multipart, State,
    },
    response::Html,
};
use std::{path::Path, sync::Arc};
use tokio::io::AsyncWriteExt;
use tracing::instrument;

fn upload_error(err: MultipartError) -> SessionError {
    SessionError::Upload(err.body_text())
}

/// Accepts the upload form, processes the video and renders the result page.
#[instrument(skip(state, multipart))]
pub async fn process_video(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<Html<String>, SessionError> {
    let session = &state.session;

    let mut run = None;
    if let Err(e) = receive_fields(session, &mut multipart, &mut run).await {
        if let Some(pending) = run {
            pending.abort(&e);
        }
        return Err(e);
    }
    let pending = run.ok_or(SessionError::MissingField("video"))?;

    let id = pending.id();
    let summary = pending.start().await?;
    Ok(Html(page::result_page(id, &summary)))
}

async fn receive_fields(
    session: &Arc<Session>,
    multipart: &mut Multipart,
    run: &mut Option<PendingRun>,
) -> Result<(), SessionError> {
    let mut threshold = None;

    while let Some(field) = multipart.next_field().await.map_err(upload_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("confidence") => {
                let value = parse_threshold(&field.text().await.map_err(upload_error)?)?;
                if let Some(pending) = run {
                    session.runs().set_threshold(pending.id(), value)?;
                }
                threshold = Some(value);
            }
            Some("video") => {
                if run.is_some() {
                    return Err(SessionError::Upload("only one video per request".to_string()));
                }
                let file_name = field.file_name().unwrap_or_default().to_string();
                if file_name.is_empty() {
                    return Err(SessionError::MissingField("video"));
                }
                let extension = video_extension(&file_name)?;

                let threshold = threshold.unwrap_or(session.config().default_confidence);
                let pending = run.insert(session.begin(threshold, &extension)?);

                let bytes = save_upload(field, pending.input_path()).await?;
                tracing::info!(
                    "Stored upload {} ({} bytes) for run {}",
                    file_name,
                    bytes,
                    pending.id()
                );
            }
            other => tracing::debug!("Ignoring form field {:?}", other),
        }
    }

    Ok(())
}

async fn save_upload(mut field: Field<'_>, path: &Path) -> Result<u64, SessionError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0;

    while let Some(chunk) = field.chunk().await.map_err(upload_error)? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    Ok(written)
}
