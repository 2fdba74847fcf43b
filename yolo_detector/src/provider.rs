use crate::{
    config::ModelConfig,
    error::ModelError,
    model_service::{ModelHandle, ModelLoader},
};
use std::{path::PathBuf, sync::Arc};
use tempfile::TempDir;
use tokio::sync::OnceCell;
use tracing::instrument;

const MODEL_FILE_NAME: &str = "model.onnx";

/// Fetches the model once and hands out the same handle afterwards.
///
/// The downloaded artifact lives in a temporary directory owned by the
/// provider and is removed when the provider is dropped.
pub struct ModelProvider {
    url: String,
    client: reqwest::Client,
    loader: Arc<dyn ModelLoader>,
    workdir: TempDir,
    handle: OnceCell<Arc<ModelHandle>>,
}

impl ModelProvider {
    pub fn new(config: &ModelConfig, loader: Arc<dyn ModelLoader>) -> Result<Self, ModelError> {
        let workdir = tempfile::Builder::new().prefix("yolo-model-").tempdir()?;
        Ok(Self {
            url: config.url.clone(),
            client: reqwest::Client::new(),
            loader,
            workdir,
            handle: OnceCell::new(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_loaded(&self) -> bool {
        self.handle.initialized()
    }

    /// Returns the cached handle, fetching and loading the model on first use.
    ///
    /// Failures leave the cache empty so a later call starts over.
    pub async fn acquire(&self) -> Result<Arc<ModelHandle>, ModelError> {
        self.handle
            .get_or_try_init(|| async {
                let model_path = self.fetch().await?;
                let loader = self.loader.clone();
                let handle = tokio::task::spawn_blocking(move || loader.load(&model_path))
                    .await
                    .map_err(|e| ModelError::Load(format!("model loading task failed: {}", e)))??;
                Ok::<_, ModelError>(Arc::new(handle))
            })
            .await
            .cloned()
    }

    #[instrument(skip(self), fields(url = %self.url))]
    async fn fetch(&self) -> Result<PathBuf, ModelError> {
        tracing::info!("Downloading model file");

        let fetch_error = |reason: String| ModelError::Fetch {
            url: self.url.clone(),
            reason,
        };

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(fetch_error(format!("server returned {}", status)));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        let model_path = self.workdir.path().join(MODEL_FILE_NAME);
        tokio::fs::write(&model_path, &bytes).await?;
        tracing::info!("Stored {} model bytes at {:?}", bytes.len(), model_path);

        Ok(model_path)
    }
}

impl std::fmt::Debug for ModelProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelProvider")
            .field("url", &self.url)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        detection::Detection, error::InferenceError, labels::ClassLabels,
        model_service::Detector,
    };
    use image::RgbImage;
    use std::{
        path::Path,
        sync::atomic::{AtomicUsize, Ordering},
    };
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    struct MockDetector {}

    impl Detector for MockDetector {
        fn infer(&self, _image: &RgbImage, _threshold: f32) -> Result<Vec<Detection>, InferenceError> {
            Ok(vec![])
        }
    }

    /// Accepts anything starting with `ONNX`, counting calls.
    #[derive(Default)]
    struct MockLoader {
        calls: AtomicUsize,
    }

    impl ModelLoader for MockLoader {
        fn load(&self, model_path: &Path) -> Result<ModelHandle, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let bytes = std::fs::read(model_path)?;
            if !bytes.starts_with(b"ONNX") {
                return Err(ModelError::Load("not a model".to_string()));
            }
            Ok(ModelHandle::new(
                MockDetector {},
                ClassLabels::from_names(["car"]),
            ))
        }
    }

    async fn provider_for(server: &MockServer, loader: Arc<MockLoader>) -> ModelProvider {
        let config = ModelConfig::new(format!("{}/model.onnx", server.uri()));
        ModelProvider::new(&config, loader).unwrap()
    }

    #[tokio::test]
    async fn test_acquire_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/model.onnx"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ONNX-model".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let loader = Arc::new(MockLoader::default());
        let provider = provider_for(&server, loader.clone()).await;
        assert!(!provider.is_loaded());

        let first = provider.acquire().await.unwrap();
        let second = provider.acquire().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(provider.is_loaded());
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.labels().get(0).unwrap().label, "car");
    }

    #[tokio::test]
    async fn test_acquire_not_found_is_fetch_error_and_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/model.onnx"))
            .respond_with(ResponseTemplate::new(404))
            .expect(2)
            .mount(&server)
            .await;

        let loader = Arc::new(MockLoader::default());
        let provider = provider_for(&server, loader.clone()).await;

        assert!(matches!(
            provider.acquire().await,
            Err(ModelError::Fetch { .. })
        ));
        assert!(!provider.is_loaded());
        assert!(matches!(
            provider.acquire().await,
            Err(ModelError::Fetch { .. })
        ));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_acquire_invalid_bytes_is_load_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/model.onnx"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
            .mount(&server)
            .await;

        let provider = provider_for(&server, Arc::new(MockLoader::default())).await;

        assert!(matches!(
            provider.acquire().await,
            Err(ModelError::Load(_))
        ));
        assert!(!provider.is_loaded());
    }

    #[tokio::test]
    async fn test_acquire_unreachable_is_fetch_error() {
        let config = ModelConfig::new("http://127.0.0.1:9/model.onnx");
        let provider = ModelProvider::new(&config, Arc::new(MockLoader::default())).unwrap();

        assert!(matches!(
            provider.acquire().await,
            Err(ModelError::Fetch { .. })
        ));
    }

    #[test]
    fn test_workdir_removed_on_drop() {
        let config = ModelConfig::new("http://localhost/model.onnx");
        let provider = ModelProvider::new(&config, Arc::new(MockLoader::default())).unwrap();
        let workdir = provider.workdir.path().to_path_buf();
        assert!(workdir.exists());

        drop(provider);
        assert!(!workdir.exists());
    }
}
