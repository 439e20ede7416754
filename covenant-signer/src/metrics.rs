//! Prometheus counters for signing requests.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderName;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use tracing::{error, info};

/// Request counters, registered in a registry owned by the service.
#[derive(Clone)]
pub struct SignerMetrics {
    registry: Registry,
    received: IntCounter,
    succeeded: IntCounter,
    failed: IntCounter,
}

impl SignerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let received = IntCounter::new(
            "signer_received_signing_requests",
            "Number of well formed signing requests received",
        )?;
        let succeeded = IntCounter::new(
            "signer_succeeded_signing_requests",
            "Number of signing requests answered with a signature",
        )?;
        let failed = IntCounter::new(
            "signer_failed_signing_requests",
            "Number of well formed signing requests that were not signed",
        )?;

        registry.register(Box::new(received.clone()))?;
        registry.register(Box::new(succeeded.clone()))?;
        registry.register(Box::new(failed.clone()))?;

        Ok(Self {
            registry,
            received,
            succeeded,
            failed,
        })
    }

    pub fn inc_received(&self) {
        self.received.inc();
    }

    pub fn inc_succeeded(&self) {
        self.succeeded.inc();
    }

    pub fn inc_failed(&self) {
        self.failed.inc();
    }

    pub fn received(&self) -> u64 {
        self.received.get()
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.get()
    }

    pub fn failed(&self) -> u64 {
        self.failed.get()
    }

    /// Counters in the Prometheus text exposition format.
    pub fn encode(&self) -> (String, Vec<u8>) {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            error!("Failed to encode prometheus metrics: {}", e);
        }
        (encoder.format_type().to_string(), buf)
    }
}

async fn metrics_handler(
    State(metrics): State<Arc<SignerMetrics>>,
) -> ([(HeaderName, String); 1], Bytes) {
    let (content_type, body) = metrics.encode();
    ([(CONTENT_TYPE, content_type)], body.into())
}

pub fn metrics_router(metrics: Arc<SignerMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Serves `/metrics` on `addr` until `shutdown` resolves.
pub async fn serve_metrics(
    addr: SocketAddr,
    metrics: Arc<SignerMetrics>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", listener.local_addr()?);

    axum::serve(listener, metrics_router(metrics).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[test]
    fn test_counters_start_at_zero() {
        let metrics = SignerMetrics::new().unwrap();
        assert_eq!(metrics.received(), 0);
        assert_eq!(metrics.succeeded(), 0);
        assert_eq!(metrics.failed(), 0);
    }

    #[test]
    fn test_separate_instances_do_not_share_counters() {
        let a = SignerMetrics::new().unwrap();
        let b = SignerMetrics::new().unwrap();

        a.inc_received();
        a.inc_failed();

        assert_eq!(a.received(), 1);
        assert_eq!(b.received(), 0);
        assert_eq!(b.failed(), 0);
    }

    #[test]
    fn test_encode_lists_all_counters() {
        let metrics = SignerMetrics::new().unwrap();
        metrics.inc_received();
        metrics.inc_succeeded();

        let (content_type, body) = metrics.encode();
        let text = String::from_utf8(body).unwrap();

        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("signer_received_signing_requests 1"));
        assert!(text.contains("signer_succeeded_signing_requests 1"));
        assert!(text.contains("signer_failed_signing_requests 0"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let metrics = Arc::new(SignerMetrics::new().unwrap());
        metrics.inc_failed();

        let response = metrics_router(metrics)
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("signer_failed_signing_requests 1"));
    }
}
