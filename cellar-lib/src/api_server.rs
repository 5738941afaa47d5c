use axum::{
    extract::Json,
    http::StatusCode,
    response::{IntoResponse, Response},
    Router,
};
use cellar_common::{CellarError, ErrorKind};
use cellar_lifecycle::operations::OperationError;
use cellar_lifecycle::Operation;
use serde::Serialize;
use std::future::Future;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::context::CellarContext;

/// Shared state for the API server
#[derive(Clone)]
pub struct ApiState {
    pub context: CellarContext,
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: ErrorKind,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        status_for(self.code)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        ErrorKind::InvalidState => StatusCode::CONFLICT,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Storage
        | ErrorKind::Persistence
        | ErrorKind::Runtime
        | ErrorKind::Io
        | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<CellarError> for ApiError {
    fn from(err: CellarError) -> Self {
        Self {
            code: err.kind(),
            error: err.to_string(),
        }
    }
}

impl From<OperationError> for ApiError {
    fn from(err: OperationError) -> Self {
        Self {
            code: err.kind,
            error: err.message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Envelope for immediate results.
#[derive(Debug, Serialize)]
pub struct SyncResponse<T: Serialize> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub status: &'static str,
    pub status_code: u16,
    pub metadata: T,
}

pub fn sync_response<T: Serialize>(metadata: T) -> Json<SyncResponse<T>> {
    Json(SyncResponse {
        kind: "sync",
        status: "Success",
        status_code: 200,
        metadata,
    })
}

/// Envelope pointing at a background operation.
#[derive(Debug, Serialize)]
pub struct AsyncResponse {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub status: &'static str,
    pub status_code: u16,
    pub operation: String,
    pub metadata: cellar_lifecycle::OperationState,
}

pub fn async_response(op: &Operation) -> Response {
    let body = AsyncResponse {
        kind: "async",
        status: "Operation created",
        status_code: 100,
        operation: op.url(),
        metadata: op.state(),
    };
    (StatusCode::ACCEPTED, Json(body)).into_response()
}

pub fn build_router(context: CellarContext) -> Router {
    crate::api_routes::build_api_router(ApiState { context }).layer(TraceLayer::new_for_http())
}

/// Serves the API until `shutdown` resolves.
pub async fn serve<F>(context: CellarContext, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = context.config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("API server listening on http://{}", addr);

    axum::serve(listener, build_router(context))
        .with_graceful_shutdown(shutdown)
        .await
}
