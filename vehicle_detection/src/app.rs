use crate::{
    config::Config,
    metrics::Metrics,
    server::{HttpServer, SharedState},
    session::Session,
    telemetry::build_sink,
};
use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};
use yolo_detector::{ModelProvider, OrtLoader};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let metrics = match Metrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => {
            tracing::error!("Failed to initialize metrics: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let loader = Arc::new(OrtLoader::new(&config.model));
    let provider = match ModelProvider::new(&config.model, loader) {
        Ok(provider) => Arc::new(provider),
        Err(e) => {
            tracing::error!("Failed to initialize model provider: {:?}", e);
            return Err(Box::new(e));
        }
    };
    tracing::info!("Model will be fetched from {} on first use", provider.url());

    let telemetry = build_sink(&config.telemetry).await;

    let session = Session::new(provider, telemetry, config.session.clone())
        .with_metrics(metrics.clone());
    let state = SharedState {
        session: Arc::new(session),
        metrics,
    };

    let server = HttpServer::new(state, &config.server).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    match server_handle.await {
        Ok(Err(e)) => tracing::error!("Server stopped with error: {}", e),
        Err(e) => tracing::error!("Server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
