use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use cellar_common::{snapshot_full_name, CellarError};
use cellar_lifecycle::OperationState;
use serde::{Deserialize, Deserializer};
use std::io::{self, BufWriter, Write};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::api_server::{async_response, sync_response, ApiResult, ApiState};

#[derive(Debug, Default, Deserialize)]
pub struct RecursionQuery {
    #[serde(default)]
    pub recursion: u32,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotCreateRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub stateful: bool,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotRenameRequest {
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportQuery {
    /// An empty value means no label.
    #[serde(default, deserialize_with = "non_empty")]
    pub snapshot: Option<String>,
}

fn non_empty<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<String>::deserialize(de)?.filter(|s| !s.is_empty()))
}

const EXPORT_CHUNK: usize = 64 * 1024;
const EXPORT_CHUNKS_IN_FLIGHT: usize = 8;

/// Forwards archive bytes to the response body.
struct ChunkWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "export client went away"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct WaitQuery {
    /// Seconds; absent waits until the operation finishes.
    pub timeout: Option<u64>,
}

fn decode<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, CellarError> {
    serde_json::from_slice(body).map_err(|e| CellarError::BadRequest(format!("invalid request body: {e}")))
}

#[instrument(skip(state))]
pub async fn list_snapshots_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(query): Query<RecursionQuery>,
) -> ApiResult<Response> {
    let listing = state
        .context
        .lifecycle
        .list_snapshots(&name, query.recursion)
        .await?;
    Ok(sync_response(listing).into_response())
}

#[instrument(skip(state, body))]
pub async fn create_snapshot_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let request: SnapshotCreateRequest = decode(&body)?;
    let op = state
        .context
        .lifecycle
        .create_snapshot(&name, request.name.as_deref(), request.stateful)
        .await?;
    Ok(async_response(&op))
}

#[instrument(skip(state))]
pub async fn get_snapshot_handler(
    State(state): State<ApiState>,
    Path((name, snapshot)): Path<(String, String)>,
) -> ApiResult<Response> {
    let summary = state.context.lifecycle.get_snapshot(&name, &snapshot).await?;
    Ok(sync_response(summary).into_response())
}

#[instrument(skip(state, body))]
pub async fn rename_snapshot_handler(
    State(state): State<ApiState>,
    Path((name, snapshot)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Response> {
    let request: SnapshotRenameRequest = decode(&body)?;
    let op = state
        .context
        .lifecycle
        .rename_snapshot(&snapshot_full_name(&name, &snapshot), &request.name)
        .await?;
    Ok(async_response(&op))
}

#[instrument(skip(state))]
pub async fn delete_snapshot_handler(
    State(state): State<ApiState>,
    Path((name, snapshot)): Path<(String, String)>,
) -> ApiResult<Response> {
    let op = state
        .context
        .lifecycle
        .delete_snapshot(&snapshot_full_name(&name, &snapshot))
        .await?;
    Ok(async_response(&op))
}

#[instrument(skip(state))]
pub async fn delete_container_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let op = state.context.lifecycle.delete_container(&name).await?;
    Ok(async_response(&op))
}

#[instrument(skip(state))]
pub async fn export_container_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<Response> {
    let exporter = state
        .context
        .lifecycle
        .prepare_export(&name, query.snapshot.as_deref())
        .await?;

    let (tx, rx) = mpsc::channel(EXPORT_CHUNKS_IN_FLIGHT);
    tokio::task::spawn_blocking(move || {
        let writer = BufWriter::with_capacity(EXPORT_CHUNK, ChunkWriter { tx: tx.clone() });
        let result = exporter
            .export(writer)
            .and_then(|mut w| w.flush().map_err(CellarError::from));
        if let Err(e) = result {
            debug!(container = %name, error = %e, "Export aborted");
            // Fails the body so the client sees a truncated transfer.
            let _ = tx.blocking_send(Err(io::Error::other(e.to_string())));
        }
    });

    let body = Body::from_stream(ReceiverStream::new(rx));
    Ok(([(header::CONTENT_TYPE, "application/x-tar")], body).into_response())
}

fn find_operation(state: &ApiState, id: &str) -> Result<cellar_lifecycle::Operation, CellarError> {
    let id = Uuid::parse_str(id)
        .map_err(|_| CellarError::BadRequest(format!("invalid operation id {id:?}")))?;
    state
        .context
        .lifecycle
        .operations
        .get(&id)
        .ok_or_else(|| CellarError::NotFound(format!("operation {id}")))
}

pub async fn list_operations_handler(State(state): State<ApiState>) -> Json<Vec<OperationState>> {
    Json(state.context.lifecycle.operations.list())
}

#[instrument(skip(state))]
pub async fn get_operation_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let op = find_operation(&state, &id)?;
    Ok(sync_response(op.state()).into_response())
}

#[instrument(skip(state))]
pub async fn wait_operation_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> ApiResult<Response> {
    let op = find_operation(&state, &id)?;
    let finished = match query.timeout {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), op.wait())
            .await
            .unwrap_or_else(|_| op.state()),
        None => op.wait().await,
    };
    Ok(sync_response(finished).into_response())
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "cellar"
    }))
}

pub fn build_api_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/1.0/containers/:name", delete(delete_container_handler))
        .route(
            "/1.0/containers/:name/snapshots",
            get(list_snapshots_handler).post(create_snapshot_handler),
        )
        .route(
            "/1.0/containers/:name/snapshots/:snapshot",
            get(get_snapshot_handler)
                .post(rename_snapshot_handler)
                .delete(delete_snapshot_handler),
        )
        .route("/1.0/containers/:name/export", get(export_container_handler))
        .route("/1.0/operations", get(list_operations_handler))
        .route("/1.0/operations/:id", get(get_operation_handler))
        .route("/1.0/operations/:id/wait", get(wait_operation_handler))
        .with_state(state)
}
