use crate::{
    config::SessionConfig,
    metrics::Metrics,
    pipeline::{FramePipeline, PipelineError, RunConfig, RunSummary},
    telemetry::TelemetrySink,
};
use axum::http::StatusCode;
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::VecDeque,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::TempDir;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;
use yolo_detector::{ModelError, ModelProvider};

pub const ALLOWED_EXTENSIONS: [&str; 3] = ["mp4", "avi", "mov"];
pub const MIN_CONFIDENCE: f32 = 0.1;
pub const MAX_CONFIDENCE: f32 = 1.0;
pub const OUTPUT_FILE_NAME: &str = "processed_video.mp4";
pub const OUTPUT_MIME_TYPE: &str = "video/mp4";
const ASSET_NAME: &str = "Processed Video";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Unsupported video format `{0}`, expected one of mp4, avi, mov")]
    UnsupportedFormat(String),
    #[error("Confidence threshold must be within [0.1, 1.0], got {0}")]
    InvalidThreshold(String),
    #[error("Missing form field `{0}`")]
    MissingField(&'static str),
    #[error("Invalid upload: {0}")]
    Upload(String),
    #[error("Run {0} not found")]
    RunNotFound(Uuid),
    #[error("Run {0} has no processed video")]
    NoOutput(Uuid),
    #[error("Run cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: RunState, to: RunState },
    #[error("Model unavailable: {0}")]
    Model(#[from] ModelError),
    #[error("{0}")]
    Pipeline(#[from] PipelineError),
    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Processing task failed: {0}")]
    Task(String),
}

impl SessionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SessionError::UnsupportedFormat(_)
            | SessionError::InvalidThreshold(_)
            | SessionError::MissingField(_)
            | SessionError::Upload(_) => StatusCode::BAD_REQUEST,
            SessionError::RunNotFound(_) | SessionError::NoOutput(_) => StatusCode::NOT_FOUND,
            SessionError::InvalidTransition { .. } => StatusCode::CONFLICT,
            SessionError::Model(_) => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::Pipeline(PipelineError::Open { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            SessionError::Pipeline(_) | SessionError::Io(_) | SessionError::Task(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    ModelLoading,
    Processing,
    Done,
    Failed,
}

impl RunState {
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, ModelLoading)
                | (Idle, Processing)
                | (Idle, Failed)
                | (ModelLoading, Processing)
                | (ModelLoading, Failed)
                | (Processing, Done)
                | (Processing, Failed)
        )
    }

    pub fn is_finished(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

pub fn parse_threshold(raw: &str) -> Result<f32, SessionError> {
    let threshold: f32 = raw
        .trim()
        .parse()
        .map_err(|_| SessionError::InvalidThreshold(raw.to_string()))?;
    if !(MIN_CONFIDENCE..=MAX_CONFIDENCE).contains(&threshold) {
        return Err(SessionError::InvalidThreshold(raw.to_string()));
    }
    Ok(threshold)
}

/// Lower-cased extension of an uploaded file name, if it is on the allow-list.
pub fn video_extension(file_name: &str) -> Result<String, SessionError> {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    if ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        Ok(extension)
    } else {
        Err(SessionError::UnsupportedFormat(file_name.to_string()))
    }
}

struct Run {
    id: Uuid,
    threshold: f32,
    state: RunState,
    history: Vec<RunState>,
    workdir: Arc<TempDir>,
    input_path: PathBuf,
    summary: Option<RunSummary>,
    error: Option<String>,
}

impl Run {
    fn output_path(&self) -> PathBuf {
        self.workdir.path().join(OUTPUT_FILE_NAME)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub id: Uuid,
    pub state: RunState,
    pub history: Vec<RunState>,
    pub threshold: f32,
    pub summary: Option<RunSummary>,
    pub error: Option<String>,
}

/// Keeps the processed video readable while a response is being sent.
#[derive(Debug, Clone)]
pub struct RunOutput {
    _workdir: Arc<TempDir>,
    pub path: PathBuf,
}

/// Recent runs, oldest first. Finished runs beyond `capacity` are evicted,
/// which deletes their temporary directory.
pub struct RunRegistry {
    runs: Mutex<VecDeque<Run>>,
    capacity: usize,
}

impl RunRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            runs: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    fn insert(&self, run: Run) {
        let mut runs = self.runs.lock();
        while runs.len() >= self.capacity {
            let Some(index) = runs.iter().position(|r| r.state.is_finished()) else {
                break;
            };
            if let Some(evicted) = runs.remove(index) {
                tracing::debug!("Evicting run {}", evicted.id);
            }
        }
        runs.push_back(run);
    }

    fn with_run<T>(&self, id: Uuid, f: impl FnOnce(&mut Run) -> T) -> Result<T, SessionError> {
        let mut runs = self.runs.lock();
        let run = runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(SessionError::RunNotFound(id))?;
        Ok(f(run))
    }

    fn transition(&self, id: Uuid, next: RunState) -> Result<(), SessionError> {
        self.with_run(id, |run| {
            if !run.state.can_transition_to(next) {
                return Err(SessionError::InvalidTransition {
                    from: run.state,
                    to: next,
                });
            }
            tracing::info!("Run {} {:?} -> {:?}", run.id, run.state, next);
            run.state = next;
            run.history.push(next);
            Ok(())
        })?
    }

    /// Changes the threshold of a run that has not started yet.
    pub fn set_threshold(&self, id: Uuid, threshold: f32) -> Result<(), SessionError> {
        self.with_run(id, |run| {
            if run.state != RunState::Idle {
                return Err(SessionError::InvalidTransition {
                    from: run.state,
                    to: RunState::Idle,
                });
            }
            run.threshold = threshold;
            Ok(())
        })?
    }

    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.lock().is_empty()
    }

    pub fn status(&self, id: Uuid) -> Result<RunStatus, SessionError> {
        self.with_run(id, |run| RunStatus {
            id: run.id,
            state: run.state,
            history: run.history.clone(),
            threshold: run.threshold,
            summary: run.summary.clone(),
            error: run.error.clone(),
        })
    }

    pub fn output(&self, id: Uuid) -> Result<RunOutput, SessionError> {
        self.with_run(id, |run| {
            if run.state != RunState::Done {
                return Err(SessionError::NoOutput(id));
            }
            Ok(RunOutput {
                _workdir: run.workdir.clone(),
                path: run.output_path(),
            })
        })?
    }
}

/// Everything one upload needs: model, telemetry and the run registry.
pub struct Session {
    provider: Arc<ModelProvider>,
    telemetry: Arc<dyn TelemetrySink>,
    metrics: Option<Arc<Metrics>>,
    runs: RunRegistry,
    config: SessionConfig,
}

impl Session {
    pub fn new(
        provider: Arc<ModelProvider>,
        telemetry: Arc<dyn TelemetrySink>,
        config: SessionConfig,
    ) -> Self {
        Self {
            provider,
            telemetry,
            metrics: None,
            runs: RunRegistry::new(config.max_retained_runs),
            config,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn runs(&self) -> &RunRegistry {
        &self.runs
    }

    /// Registers an idle run and returns where its upload should be stored.
    fn create_run(&self, threshold: f32, extension: &str) -> Result<(Uuid, PathBuf), SessionError> {
        let workdir = tempfile::Builder::new().prefix("vehicle-run-").tempdir()?;
        let id = Uuid::new_v4();
        let input_path = workdir.path().join(format!("input.{}", extension));

        self.runs.insert(Run {
            id,
            threshold,
            state: RunState::Idle,
            history: vec![RunState::Idle],
            workdir: Arc::new(workdir),
            input_path: input_path.clone(),
            summary: None,
            error: None,
        });
        tracing::info!("Created run {} with threshold {}", id, threshold);

        Ok((id, input_path))
    }

    /// Registers an idle run for an upload in progress. The run is marked
    /// failed if the returned guard is dropped before [`PendingRun::start`].
    pub fn begin(self: &Arc<Self>, threshold: f32, extension: &str) -> Result<PendingRun, SessionError> {
        let (id, input_path) = self.create_run(threshold, extension)?;
        Ok(PendingRun {
            session: Arc::clone(self),
            id,
            input_path,
            armed: true,
        })
    }

    /// Loads the model if needed and annotates the run's uploaded video.
    ///
    /// The work runs on its own task, so the run still ends in `Done` or
    /// `Failed` when the returned future is dropped.
    pub fn execute(
        self: &Arc<Self>,
        id: Uuid,
    ) -> impl Future<Output = Result<RunSummary, SessionError>> + Send {
        let session = Arc::clone(self);
        let task = tokio::spawn({
            let session = Arc::clone(self);
            async move { session.run_to_end(id).await }
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    let error = SessionError::Task(e.to_string());
                    session.fail(id, &error);
                    Err(error)
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn run_to_end(&self, id: Uuid) -> Result<RunSummary, SessionError> {
        let result = self.process(id).await;
        match &result {
            Ok(summary) => {
                self.runs.with_run(id, |run| run.summary = Some(summary.clone()))?;
                self.runs.transition(id, RunState::Done)?;
                if let Err(e) =
                    self.telemetry
                        .log_asset(&summary.output_path, "video", ASSET_NAME)
                {
                    tracing::warn!("Failed to log processed video to telemetry: {}", e);
                }
                self.record_run("done");
            }
            Err(e) => {
                self.fail(id, e);
                self.record_run("failed");
            }
        }
        result
    }

    async fn process(&self, id: Uuid) -> Result<RunSummary, SessionError> {
        let (input_path, output_path, threshold) = self
            .runs
            .with_run(id, |run| (run.input_path.clone(), run.output_path(), run.threshold))?;

        if !self.provider.is_loaded() {
            self.runs.transition(id, RunState::ModelLoading)?;
        }
        let model = self.provider.acquire().await?;

        self.runs.transition(id, RunState::Processing)?;

        let run_config = RunConfig {
            threshold,
            frame_policy: self.config.frame_policy,
            max_consecutive_read_errors: self.config.max_consecutive_read_errors,
        };
        let telemetry = self.telemetry.clone();
        let metrics = self.metrics.clone();

        let summary = tokio::task::spawn_blocking(move || {
            let mut pipeline = FramePipeline::new(&model, telemetry.as_ref(), run_config);
            if let Some(metrics) = metrics.as_deref() {
                pipeline = pipeline.with_metrics(metrics);
            }
            pipeline.run(&input_path, &output_path)
        })
        .await
        .map_err(|e| SessionError::Task(e.to_string()))??;

        Ok(summary)
    }

    fn fail(&self, id: Uuid, error: &SessionError) {
        tracing::error!("Run {} failed: {}", id, error);
        let result = self.runs.with_run(id, |run| run.error = Some(error.to_string()));
        if result.is_ok() {
            if let Err(e) = self.runs.transition(id, RunState::Failed) {
                tracing::warn!("Could not mark run {} as failed: {}", id, e);
            }
        }
    }

    fn record_run(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_run(outcome);
        }
    }
}

/// An idle run whose upload is still being received.
pub struct PendingRun {
    session: Arc<Session>,
    id: Uuid,
    input_path: PathBuf,
    armed: bool,
}

impl PendingRun {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    /// Marks the run as failed, e.g. after a broken upload.
    pub fn abort(mut self, error: &SessionError) {
        self.armed = false;
        self.session.fail(self.id, error);
    }

    /// Hands the run over to [`Session::execute`].
    pub fn start(mut self) -> impl Future<Output = Result<RunSummary, SessionError>> + Send {
        self.armed = false;
        self.session.execute(self.id)
    }
}

impl Drop for PendingRun {
    fn drop(&mut self) {
        if self.armed {
            let error = SessionError::Upload("upload interrupted before processing".to_string());
            self.session.fail(self.id, &error);
        }
    }
}
