//! HTTP signing service and its client.
//!
//! The server exposes a single JSON endpoint, `POST /v1/sign-unbonding-tx`.
//! Bodies are size-limited, optionally HMAC-authenticated and bounded by a
//! request timeout before they reach the policy engine.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body, Bytes};
use axum::error_handling::HandleErrorLayer;
use axum::extract::{Request, State};
use axum::http::header::CONTENT_LENGTH;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use bitcoin::secp256k1::schnorr;
use thiserror::Error;
use tokio::net::TcpListener;
use tower::timeout::TimeoutLayer;
use tower::{BoxError, ServiceBuilder};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::{generate_hmac, validate_hmac, AuthError, HEADER_COVENANT_HMAC};
use crate::metrics::SignerMetrics;
use crate::policy::{ErrorKind, PolicyError, SigningPolicyEngine};
use crate::protocol::{
    ErrorCode, ErrorResponse, PublicResponse, RequestParseError, SignUnbondingTxRequest,
    SignUnbondingTxResponse, SIGN_UNBONDING_TX_PATH,
};

const INTERNAL_ERROR_MESSAGE: &str = "Internal service error";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub addr: SocketAddr,
    /// Upper bound on handling a single request
    pub request_timeout: Duration,
    /// Largest accepted request body, in bytes
    pub max_content_length: usize,
    /// Shared HMAC key; requests are not authenticated when unset
    pub hmac_key: Option<String>,
}

/// Errors from the signer server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced to HTTP callers.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(AuthError),
    RequestTooLarge,
    /// Logged, never shown to the caller
    Internal(String),
}

impl From<PolicyError> for ApiError {
    fn from(err: PolicyError) -> Self {
        match err.kind() {
            ErrorKind::InvalidRequest => ApiError::BadRequest(err.to_string()),
            ErrorKind::Internal => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<RequestParseError> for ApiError {
    fn from(err: RequestParseError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(message) => {
                warn!("Rejected signing request: {}", message);
                (
                    StatusCode::BAD_REQUEST,
                    ErrorResponse::new(ErrorCode::BadRequest, message),
                )
            }
            ApiError::Unauthorized(e) => {
                warn!("Unauthorized signing request: {}", e);
                (
                    StatusCode::UNAUTHORIZED,
                    ErrorResponse::new(ErrorCode::Unauthorized, e.to_string()),
                )
            }
            ApiError::RequestTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                ErrorResponse::new(ErrorCode::RequestTooLarge, "request body too large"),
            ),
            ApiError::Internal(message) => {
                error!("Internal error while signing: {}", message);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new(ErrorCode::InternalServiceError, INTERNAL_ERROR_MESSAGE),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Clone)]
struct AppState {
    engine: Arc<SigningPolicyEngine>,
    metrics: Arc<SignerMetrics>,
}

async fn sign_unbonding_tx(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<PublicResponse<SignUnbondingTxResponse>>, ApiError> {
    let request: SignUnbondingTxRequest =
        serde_json::from_slice(&body).map_err(|_| RequestParseError::InvalidPayload)?;
    let parsed = request.parse()?;

    state.metrics.inc_received();

    let result = state
        .engine
        .sign_unbonding_transaction(
            &parsed.staking_output_pk_script,
            &parsed.unbonding_tx,
            &parsed.staker_unbonding_sig,
            &parsed.covenant_public_key,
        )
        .await;

    match result {
        Ok(signature) => {
            state.metrics.inc_succeeded();
            Ok(Json(PublicResponse {
                data: SignUnbondingTxResponse::new(&signature),
            }))
        }
        Err(e) => {
            state.metrics.inc_failed();
            Err(e.into())
        }
    }
}

/// Buffers the body, answering 413 once it exceeds `limit` bytes.
async fn limit_body(State(limit): State<usize>, req: Request, next: Next) -> Response {
    let declared_too_large = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .is_some_and(|len| len > limit as u64);
    if declared_too_large {
        return ApiError::RequestTooLarge.into_response();
    }

    let (parts, body) = req.into_parts();
    let bytes = match to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(_) => return ApiError::RequestTooLarge.into_response(),
    };

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

/// Rejects requests whose body does not carry a valid HMAC.
async fn verify_hmac(State(key): State<Arc<String>>, req: Request, next: Next) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return ApiError::from(RequestParseError::InvalidPayload).into_response(),
    };

    let provided = parts
        .headers
        .get(HEADER_COVENANT_HMAC)
        .and_then(|v| v.to_str().ok());
    if let Err(e) = validate_hmac(&key, &bytes, provided) {
        return ApiError::Unauthorized(e).into_response();
    }

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

async fn map_middleware_error(err: BoxError) -> ApiError {
    if err.is::<tower::timeout::error::Elapsed>() {
        ApiError::Internal("request timed out".to_string())
    } else {
        ApiError::Internal(format!("unhandled middleware error: {}", err))
    }
}

/// HTTP front end of the policy engine.
pub struct SignerServer {
    config: ServerConfig,
    engine: Arc<SigningPolicyEngine>,
    metrics: Arc<SignerMetrics>,
}

impl SignerServer {
    pub fn new(
        config: ServerConfig,
        engine: Arc<SigningPolicyEngine>,
        metrics: Arc<SignerMetrics>,
    ) -> Self {
        Self {
            config,
            engine,
            metrics,
        }
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            engine: self.engine.clone(),
            metrics: self.metrics.clone(),
        };

        let mut router = Router::new()
            .route(SIGN_UNBONDING_TX_PATH, post(sign_unbonding_tx))
            .with_state(state);

        // Layers added later run first: the body is limited before it is
        // authenticated.
        if let Some(key) = self.config.hmac_key.clone() {
            router = router.route_layer(middleware::from_fn_with_state(
                Arc::new(key),
                verify_hmac,
            ));
        }

        router
            .route_layer(middleware::from_fn_with_state(
                self.config.max_content_length,
                limit_body,
            ))
            .layer(
                ServiceBuilder::new()
                    .layer(HandleErrorLayer::new(map_middleware_error))
                    .layer(TimeoutLayer::new(self.config.request_timeout)),
            )
            .layer(TraceLayer::new_for_http())
    }

    /// Binds the configured address and serves until `shutdown` resolves.
    pub async fn run(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serves on an already bound listener until `shutdown` resolves.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        info!("Signer server listening on {}", listener.local_addr()?);
        if self.config.hmac_key.is_none() {
            warn!("HMAC key not configured, signing requests are not authenticated");
        }

        axum::serve(listener, self.router().into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Signer server stopped");
        Ok(())
    }
}

// ==================== Client ====================

/// Errors from [`SignerClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HMAC error: {0}")]
    Auth(#[from] AuthError),

    #[error("signer rejected request ({status}, {code:?}): {message}")]
    Rejected {
        status: u16,
        code: ErrorCode,
        message: String,
    },

    #[error("unexpected response status {0}")]
    UnexpectedStatus(u16),

    #[error("signer returned a malformed signature")]
    InvalidSignature,
}

/// Client for a remote covenant signer.
#[derive(Debug, Clone)]
pub struct SignerClient {
    http: reqwest::Client,
    url: String,
    hmac_key: Option<String>,
}

impl SignerClient {
    /// `base_url` is the signer's root, e.g. `http://127.0.0.1:9791`.
    pub fn new(
        base_url: &str,
        hmac_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: format!(
                "{}{}",
                base_url.trim_end_matches('/'),
                SIGN_UNBONDING_TX_PATH
            ),
            hmac_key,
        })
    }

    /// Asks the signer for its covenant signature over the unbonding transaction.
    pub async fn sign_unbonding_tx(
        &self,
        request: &SignUnbondingTxRequest,
    ) -> Result<schnorr::Signature, ClientError> {
        let body = serde_json::to_vec(request)?;

        let mut builder = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(key) = &self.hmac_key {
            builder = builder.header(HEADER_COVENANT_HMAC, generate_hmac(key, &body)?);
        }

        let response = builder.body(body).send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if status.is_success() {
            let decoded: PublicResponse<SignUnbondingTxResponse> = serde_json::from_slice(&bytes)?;
            return decoded.data.signature().ok_or(ClientError::InvalidSignature);
        }

        match serde_json::from_slice::<ErrorResponse>(&bytes) {
            Ok(err) => Err(ClientError::Rejected {
                status: status.as_u16(),
                code: err.error_code,
                message: err.message,
            }),
            Err(_) => Err(ClientError::UnexpectedStatus(status.as_u16())),
        }
    }
}
