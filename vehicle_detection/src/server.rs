use crate::{config::ServerConfig, metrics::Metrics, routes::api_routes, session::Session};
use axum::{extract::DefaultBodyLimit, Router};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};

#[derive(Clone)]
pub struct SharedState {
    pub session: Arc<Session>,
    pub metrics: Arc<Metrics>,
}

/// Application router with upload limit and HTTP metrics applied.
pub fn build_router(state: SharedState, max_upload_bytes: usize) -> Router {
    let metrics_layer = HttpMetricsLayerBuilder::new().build();

    Router::new()
        .merge(api_routes())
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(metrics_layer)
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(state: SharedState, config: &ServerConfig) -> anyhow::Result<Self> {
        let addr = config.get_address();
        let router = build_router(state, config.max_upload_bytes);
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn({
            let mut shutdown_rx = shutdown_rx.resubscribe();
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        shutdown_rx.recv().await.ok();
                    })
                    .await?;
                Ok(())
            }
        });

        Ok(server_handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::SessionConfig, routes::Status, telemetry::NoopSink};
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use image::RgbImage;
    use std::path::Path;
    use tower::ServiceExt;
    use yolo_detector::{
        config::ModelConfig, ClassLabels, Detection, Detector, InferenceError, ModelError,
        ModelHandle, ModelLoader, ModelProvider,
    };

    const BOUNDARY: &str = "X-VEHICLE-BOUNDARY";

    struct NoDetector {}

    impl Detector for NoDetector {
        fn infer(&self, _image: &RgbImage, _threshold: f32) -> Result<Vec<Detection>, InferenceError> {
            Ok(vec![])
        }
    }

    struct MockLoader {}

    impl ModelLoader for MockLoader {
        fn load(&self, _model_path: &Path) -> Result<ModelHandle, ModelError> {
            Ok(ModelHandle::new(NoDetector {}, ClassLabels::from_names(["car"])))
        }
    }

    fn router(model_url: &str) -> Router {
        let provider =
            ModelProvider::new(&ModelConfig::new(model_url), Arc::new(MockLoader {})).unwrap();
        let session = Session::new(Arc::new(provider), Arc::new(NoopSink), SessionConfig::default());
        let state = SharedState {
            session: Arc::new(session),
            metrics: Arc::new(Metrics::new().unwrap()),
        };
        build_router(state, 1024 * 1024)
    }

    fn multipart_request(confidence: &str, file_name: &str, content: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{b}\r\nContent-Disposition: form-data; name=\"confidence\"\r\n\r\n{c}\r\n\
                 --{b}\r\nContent-Disposition: form-data; name=\"video\"; filename=\"{f}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n",
                b = BOUNDARY,
                c = confidence,
                f = file_name,
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method("POST")
            .uri("/process")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = router("http://127.0.0.1:9/model.onnx")
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let status: Status = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(status.status, "Available");
    }

    #[tokio::test]
    async fn test_index_page() {
        let response = router("http://127.0.0.1:9/model.onnx")
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("YOLO Vehicle Detection App"));
        assert!(body.contains("Settings"));
    }

    #[tokio::test]
    async fn test_rejects_unsupported_extension() {
        let response = router("http://127.0.0.1:9/model.onnx")
            .oneshot(multipart_request("0.5", "clip.mkv", b"data"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("clip.mkv"));
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_confidence() {
        let response = router("http://127.0.0.1:9/model.onnx")
            .oneshot(multipart_request("1.7", "clip.mp4", b"data"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unreachable_model_is_service_unavailable() {
        let response = router("http://127.0.0.1:9/model.onnx")
            .oneshot(multipart_request("0.5", "clip.mp4", b"data"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_corrupt_upload_is_unprocessable() {
        use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ONNX".to_vec()))
            .mount(&server)
            .await;

        let response = router(&format!("{}/model.onnx", server.uri()))
            .oneshot(multipart_request("0.5", "clip.MOV", b"not really a video"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let uri = format!("/runs/{}/download", uuid::Uuid::new_v4());
        let response = router("http://127.0.0.1:9/model.onnx")
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = router("http://127.0.0.1:9/model.onnx")
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            prometheus::TEXT_FORMAT
        );
    }
}
