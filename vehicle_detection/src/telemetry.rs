use crate::config::TelemetryConfig;
use reqwest::{multipart, Client};
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const CREATE_EXPERIMENT_PATH: &str = "/api/rest/v2/write/experiment/create";
const LOG_IMAGE_PATH: &str = "/api/rest/v2/write/experiment/image";
const UPLOAD_ASSET_PATH: &str = "/api/rest/v2/write/experiment/upload-asset";

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Telemetry request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Telemetry service returned {0}")]
    Status(reqwest::StatusCode),
    #[error("Telemetry worker is not running")]
    WorkerGone,
    #[error("Telemetry upload queue is full, dropping upload")]
    QueueFull,
    #[error("Failed to prepare telemetry payload: {0}")]
    Payload(String),
}

/// Best effort side channel for experiment tracking.
///
/// Calls must return quickly; callers log and drop any error.
pub trait TelemetrySink: Send + Sync + 'static {
    fn log_image(&self, name: &str, jpeg: Vec<u8>, step: u64) -> Result<(), TelemetryError>;
    fn log_asset(&self, path: &Path, asset_type: &str, name: &str) -> Result<(), TelemetryError>;

    /// Whether per-frame images are worth encoding for this sink.
    fn accepts_images(&self) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn log_image(&self, _name: &str, _jpeg: Vec<u8>, _step: u64) -> Result<(), TelemetryError> {
        Ok(())
    }

    fn log_asset(&self, _path: &Path, _asset_type: &str, _name: &str) -> Result<(), TelemetryError> {
        Ok(())
    }

    fn accepts_images(&self) -> bool {
        false
    }
}

enum Upload {
    Image {
        name: String,
        jpeg: Vec<u8>,
        step: u64,
    },
    Asset {
        path: PathBuf,
        asset_type: String,
        name: String,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateExperimentResponse {
    experiment_key: String,
}

/// Comet experiment tracker. Uploads are queued and sent in order by a
/// background task. When the queue is full new uploads are dropped.
pub struct CometSink {
    experiment_key: String,
    tx: mpsc::Sender<Upload>,
}

impl CometSink {
    pub async fn connect(config: &TelemetryConfig) -> Result<Self, TelemetryError> {
        let client = Client::new();
        let base_url = config.base_url.trim_end_matches('/').to_string();

        let response = client
            .post(format!("{}{}", base_url, CREATE_EXPERIMENT_PATH))
            .header(reqwest::header::AUTHORIZATION, &config.api_key)
            .json(&serde_json::json!({
                "workspaceName": config.workspace,
                "projectName": config.project_name,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TelemetryError::Status(response.status()));
        }

        let created: CreateExperimentResponse = response.json().await?;
        tracing::info!(
            "Created telemetry experiment {} in {}/{}",
            created.experiment_key,
            config.workspace,
            config.project_name
        );

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let worker = UploadWorker {
            client,
            base_url,
            api_key: config.api_key.clone(),
            experiment_key: created.experiment_key.clone(),
        };
        tokio::spawn(worker.run(rx));

        Ok(Self {
            experiment_key: created.experiment_key,
            tx,
        })
    }

    pub fn experiment_key(&self) -> &str {
        &self.experiment_key
    }

    /// Waits until every upload queued so far has been attempted.
    pub async fn flush(&self) -> Result<(), TelemetryError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Upload::Flush(done_tx))
            .await
            .map_err(|_| TelemetryError::WorkerGone)?;
        done_rx.await.map_err(|_| TelemetryError::WorkerGone)
    }

    fn enqueue(&self, upload: Upload) -> Result<(), TelemetryError> {
        self.tx.try_send(upload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TelemetryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TelemetryError::WorkerGone,
        })
    }
}

impl TelemetrySink for CometSink {
    fn log_image(&self, name: &str, jpeg: Vec<u8>, step: u64) -> Result<(), TelemetryError> {
        self.enqueue(Upload::Image {
            name: name.to_string(),
            jpeg,
            step,
        })
    }

    fn log_asset(&self, path: &Path, asset_type: &str, name: &str) -> Result<(), TelemetryError> {
        self.enqueue(Upload::Asset {
            path: path.to_path_buf(),
            asset_type: asset_type.to_string(),
            name: name.to_string(),
        })
    }
}

/// Connects to the configured tracker, falling back to [`NoopSink`] when
/// telemetry is disabled or unreachable.
pub async fn build_sink(config: &TelemetryConfig) -> Arc<dyn TelemetrySink> {
    if !config.enabled {
        tracing::info!("Telemetry disabled");
        return Arc::new(NoopSink);
    }

    match CometSink::connect(config).await {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            tracing::warn!("Telemetry unavailable, continuing without it: {}", e);
            Arc::new(NoopSink)
        }
    }
}

struct UploadWorker {
    client: Client,
    base_url: String,
    api_key: String,
    experiment_key: String,
}

impl UploadWorker {
    async fn run(self, mut rx: mpsc::Receiver<Upload>) {
        while let Some(upload) = rx.recv().await {
            let result = match upload {
                Upload::Image { name, jpeg, step } => self.send_image(name, jpeg, step).await,
                Upload::Asset {
                    path,
                    asset_type,
                    name,
                } => self.send_asset(&path, asset_type, name).await,
                Upload::Flush(done) => {
                    let _ = done.send(());
                    continue;
                }
            };

            if let Err(e) = result {
                tracing::warn!("Dropping telemetry upload: {}", e);
            }
        }
        tracing::debug!("Telemetry worker stopped");
    }

    async fn send_image(&self, name: String, jpeg: Vec<u8>, step: u64) -> Result<(), TelemetryError> {
        let part = multipart::Part::bytes(jpeg)
            .file_name(format!("{}.jpg", name))
            .mime_str("image/jpeg")?;
        let form = multipart::Form::new().part("file", part);

        let step = step.to_string();
        let query = [
            ("experimentKey", self.experiment_key.as_str()),
            ("imageName", name.as_str()),
            ("step", step.as_str()),
        ];
        self.post(LOG_IMAGE_PATH, &query, form).await
    }

    async fn send_asset(
        &self,
        path: &Path,
        asset_type: String,
        name: String,
    ) -> Result<(), TelemetryError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| TelemetryError::Payload(format!("{:?}: {}", path, e)))?;
        let part = multipart::Part::bytes(bytes).file_name(name.clone());
        let form = multipart::Form::new().part("file", part);

        let query = [
            ("experimentKey", self.experiment_key.as_str()),
            ("fileName", name.as_str()),
            ("type", asset_type.as_str()),
        ];
        self.post(UPLOAD_ASSET_PATH, &query, form).await
    }

    async fn post(
        &self,
        path: &str,
        query: &[(&str, &str)],
        form: multipart::Form,
    ) -> Result<(), TelemetryError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header(reqwest::header::AUTHORIZATION, &self.api_key)
            .query(query)
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TelemetryError::Status(response.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        matchers::{header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    fn config(server: &MockServer) -> TelemetryConfig {
        TelemetryConfig {
            enabled: true,
            base_url: server.uri(),
            api_key: "secret".to_string(),
            project_name: "vehicle-detection-app".to_string(),
            workspace: "demo".to_string(),
            queue_capacity: 16,
        }
    }

    async fn mount_experiment(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path(CREATE_EXPERIMENT_PATH))
            .and(header("authorization", "secret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "experimentKey": "exp-1" })),
            )
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_uploads_image_and_asset() {
        let server = MockServer::start().await;
        mount_experiment(&server).await;
        Mock::given(method("POST"))
            .and(path(LOG_IMAGE_PATH))
            .and(query_param("experimentKey", "exp-1"))
            .and(query_param("step", "3"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(UPLOAD_ASSET_PATH))
            .and(query_param("type", "video"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = CometSink::connect(&config(&server)).await.unwrap();
        assert_eq!(sink.experiment_key(), "exp-1");

        let asset = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(asset.path(), b"video").unwrap();

        sink.log_image("Processed Frame", vec![0xFF, 0xD8, 0xFF], 3).unwrap();
        sink.log_asset(asset.path(), "video", "Processed Video").unwrap();
        sink.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_uploads_do_not_stop_worker() {
        let server = MockServer::start().await;
        mount_experiment(&server).await;
        Mock::given(method("POST"))
            .and(path(LOG_IMAGE_PATH))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let sink = CometSink::connect(&config(&server)).await.unwrap();

        sink.log_image("Processed Frame", vec![1], 0).unwrap();
        sink.log_asset(Path::new("/does/not/exist.mp4"), "video", "Processed Video")
            .unwrap();
        sink.log_image("Processed Frame", vec![2], 1).unwrap();
        sink.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_uploads_drop_excess_images() {
        let server = MockServer::start().await;
        mount_experiment(&server).await;
        Mock::given(method("POST"))
            .and(path(LOG_IMAGE_PATH))
            .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(5)))
            .mount(&server)
            .await;

        let config = TelemetryConfig {
            queue_capacity: 2,
            ..config(&server)
        };
        let sink = CometSink::connect(&config).await.unwrap();

        let results: Vec<_> = (0..10)
            .map(|step| sink.log_image("Processed Frame", vec![0xFF; 64], step))
            .collect();

        let accepted = results.iter().filter(|r| r.is_ok()).count();
        assert!(accepted <= 3);
        assert!(results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(TelemetryError::QueueFull))));
        assert!(matches!(results.last(), Some(Err(TelemetryError::QueueFull))));
    }

    #[tokio::test]
    async fn test_connect_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CREATE_EXPERIMENT_PATH))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        assert!(matches!(
            CometSink::connect(&config(&server)).await,
            Err(TelemetryError::Status(_))
        ));
    }
}
