use crate::collector::exporter::Exporter;
use crate::error::{MeterError, Result};
use crate::metrics::render::render_prometheus;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

pub struct HttpServer {
    addr: SocketAddr,
    exporter: Arc<Exporter>,
}

impl HttpServer {
    pub fn new(host: &str, port: u16, exporter: Arc<Exporter>) -> Result<Self> {
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| MeterError::Config(format!("invalid listen address: {e}")))?;
        Ok(Self { addr, exporter })
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let app = router(self.exporter);

        info!(addr = %self.addr, "starting http server");

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| MeterError::Http(e.to_string()))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                info!("http server shutting down");
            })
            .await
            .map_err(|e| MeterError::Http(e.to_string()))?;

        Ok(())
    }
}

fn router(exporter: Arc<Exporter>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/", get(root_handler))
        .with_state(exporter)
}

/// Each request triggers a scrape; overlapping requests are coalesced by the
/// exporter unless concurrent collection is enabled.
async fn metrics_handler(State(exporter): State<Arc<Exporter>>) -> Response {
    let (sink, mut stream) = mpsc::unbounded_channel();
    exporter.collect(sink).await;

    let mut points = Vec::new();
    while let Some(point) = stream.recv().await {
        points.push(point);
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        render_prometheus(&points),
    )
        .into_response()
}

async fn health_handler() -> Response {
    (StatusCode::OK, "OK").into_response()
}

async fn root_handler() -> Response {
    let html = r#"<!DOCTYPE html>
<html>
<head><title>kmeter</title></head>
<body>
<h1>kmeter</h1>
<p>Kafka cluster telemetry collector</p>
<p><a href="/metrics">Metrics</a></p>
<p><a href="/health">Health</a></p>
</body>
</html>"#;

    (
        StatusCode::OK,
        [("content-type", "text/html; charset=utf-8")],
        html,
    )
        .into_response()
}
