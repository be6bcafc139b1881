use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Json, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use imager::{Imager, ImagerError, UploadInput, UploadResult};
use serde::Deserialize;
use tokio::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::metrics::ServiceMetrics;

#[derive(Clone)]
pub struct RouterCtx {
    pub imager: Arc<Imager>,
    pub api_key: String,
    pub metrics: Arc<ServiceMetrics>,
}

pub fn router(ctx: RouterCtx, max_body_size: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(vec![Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/_health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/images", post(upload_images).delete(remove_images))
        .with_state(ctx)
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(cors)
}

/// Error returned by handlers, rendered as `status` plus the error chain.
#[derive(Debug)]
pub struct AppError(pub StatusCode, pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.0.is_server_error() {
            error!("Request failed: {:#}", self.1);
        }
        (self.0, format!("{:#}", self.1)).into_response()
    }
}

impl From<ImagerError> for AppError {
    fn from(err: ImagerError) -> Self {
        let status = match err {
            ImagerError::Configuration(_) | ImagerError::Input(_) | ImagerError::UnsupportedType(_) => {
                StatusCode::BAD_REQUEST
            }
            ImagerError::Transform(_) | ImagerError::Backend { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError(status, err.into())
    }
}

async fn health() -> impl IntoResponse {
    Json("OK")
}

async fn metrics(State(ctx): State<RouterCtx>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        ctx.metrics.export(),
    )
}

// --------------------------------------------------------
//     Routes
// --------------------------------------------------------

const API_KEY_HEADER: &str = "x-api-key";

fn require_api_key(headers: &HeaderMap, expected: &str) -> Result<(), AppError> {
    let key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError(StatusCode::UNAUTHORIZED, anyhow::anyhow!("Missing API key")))?;
    if key != expected {
        return Err(AppError(
            StatusCode::UNAUTHORIZED,
            anyhow::anyhow!("Invalid API key"),
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct UploadPayload {
    files: Vec<UploadInput>,
    #[serde(default)]
    variant: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemovePayload {
    files: Vec<String>,
    #[serde(default)]
    variant: Option<String>,
}

async fn upload_images(
    State(ctx): State<RouterCtx>,
    headers: HeaderMap,
    Json(payload): Json<UploadPayload>,
) -> Result<Json<UploadResult>, AppError> {
    require_api_key(&headers, &ctx.api_key)?;

    let start = Instant::now();
    let count = payload.files.len();
    let result = ctx
        .imager
        .upload(payload.files, payload.variant.as_deref())
        .await;
    ctx.metrics
        .record("upload", start.elapsed().as_secs_f64(), result.is_ok());

    let result = result?;
    info!(
        "Uploaded {} input(s) as {} variant file(s)",
        count,
        result.files.len()
    );
    Ok(Json(result))
}

async fn remove_images(
    State(ctx): State<RouterCtx>,
    headers: HeaderMap,
    Json(payload): Json<RemovePayload>,
) -> Result<StatusCode, AppError> {
    require_api_key(&headers, &ctx.api_key)?;

    let start = Instant::now();
    let result = ctx
        .imager
        .remove(&payload.files, payload.variant.as_deref())
        .await;
    ctx.metrics
        .record("remove", start.elapsed().as_secs_f64(), result.is_ok());

    result?;
    Ok(StatusCode::NO_CONTENT)
}
