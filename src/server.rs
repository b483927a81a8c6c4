//! HTTP surface of one poller.
//!
//! Serves the Prometheus scrape endpoint, a JSON status page with the
//! live state of every collector and exporter, and a liveness probe.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::collector::CollectorStatus;
use crate::exporter::{Exporter, prometheus::MetricsHandle};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub poller: String,
    /// Rendered scrape text; `None` when no prometheus exporter is configured.
    pub metrics: Option<MetricsHandle>,
    pub collectors: Vec<Arc<RwLock<CollectorStatus>>>,
    pub exporters: Vec<Arc<dyn Exporter>>,
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

/// One exporter row on the status page.
#[derive(Serialize)]
struct ExporterStatus {
    name: String,
    class: String,
    exported: u64,
    errors: u64,
}

/// Full status page payload.
#[derive(Serialize)]
struct StatusResponse {
    poller: String,
    collectors: Vec<CollectorStatus>,
    exporters: Vec<ExporterStatus>,
}

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    let app_state = Arc::new(state);

    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .route("/healthz", get(healthz_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

/// Prometheus scrape endpoint.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    let body = match &state.metrics {
        Some(handle) => handle.text().await,
        None => String::new(),
    };
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

/// Status page: one row per collector and exporter.
async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let mut collectors = Vec::with_capacity(state.collectors.len());
    for status in &state.collectors {
        collectors.push(status.read().await.clone());
    }

    let exporters = state
        .exporters
        .iter()
        .map(|exporter| {
            let (exported, errors) = exporter.counters().snapshot();
            ExporterStatus {
                name: exporter.name().to_string(),
                class: exporter.class().to_string(),
                exported,
                errors,
            }
        })
        .collect();

    Json(StatusResponse {
        poller: state.poller.clone(),
        collectors,
        exporters,
    })
}

/// Liveness probe.
async fn healthz_handler() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectorState;
    use crate::exporter::prometheus::PrometheusExporter;
    use crate::matrix::{Matrix, MetricKind};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn exported_prometheus() -> Arc<PrometheusExporter> {
        let exporter = Arc::new(PrometheusExporter::new("prom", "strata"));
        let mut matrix = Matrix::new("volume", "Mock:volume");
        matrix.add_metric("read_ops", MetricKind::Raw).unwrap();
        matrix.add_instance("vol1").unwrap();
        matrix.set_label("vol1", "volume", "vol1").unwrap();
        matrix.set_value("read_ops", "vol1", 42.0).unwrap();
        exporter.export(&matrix).await.unwrap();
        exporter
    }

    fn test_state(exporter: Arc<PrometheusExporter>) -> AppState {
        let status = Arc::new(RwLock::new(CollectorStatus {
            name: "Mock".to_string(),
            object: "volume".to_string(),
            state: CollectorState::Running,
            last_error: None,
            cycles: 7,
            last_cycle_ms: 12,
        }));
        AppState {
            poller: "cluster-a".to_string(),
            metrics: Some(exporter.handle()),
            collectors: vec![status],
            exporters: vec![exporter],
        }
    }

    #[tokio::test]
    async fn test_metrics_endpoint_serves_rendered_text() {
        let app = create_router(test_state(exported_prometheus().await));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8_lossy(&bytes);
        assert!(body.contains("strata_volume_read_ops{volume=\"vol1\"} 42"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_without_prometheus_is_empty() {
        let mut state = test_state(exported_prometheus().await);
        state.metrics = None;
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn test_status_endpoint_reports_collectors_and_exporters() {
        let app = create_router(test_state(exported_prometheus().await));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let status: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(status["poller"], "cluster-a");
        assert_eq!(status["collectors"][0]["object"], "volume");
        assert_eq!(status["collectors"][0]["state"], "running");
        assert_eq!(status["collectors"][0]["cycles"], 7);
        assert_eq!(status["exporters"][0]["class"], "prometheus");
        assert_eq!(status["exporters"][0]["exported"], 1);
        assert_eq!(status["exporters"][0]["errors"], 0);
    }

    #[tokio::test]
    async fn test_healthz() {
        let app = create_router(test_state(exported_prometheus().await));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
