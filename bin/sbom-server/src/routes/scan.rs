//! Archive upload and task status endpoints.

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::BytesMut;
use futures::{stream, StreamExt, TryStreamExt};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use sbom_core::{BlobError, BlobKind, TaskId, TaskLedger, TaskStatus};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::io::StreamReader;
use tracing::{info, warn};

use crate::error::ServerError;
use crate::state::AppState;

const ZIP_CONTENT_TYPE: &str = "application/zip";

/// Local file header, empty archive, spanned archive.
const ZIP_SIGNATURES: [&[u8; 4]; 3] = [b"PK\x03\x04", b"PK\x05\x06", b"PK\x07\x08"];

const SNIFF_LEN: usize = 4;

pub fn router<L: TaskLedger>() -> Router<Arc<AppState<L>>> {
    Router::new()
        .route(
            "/scan",
            post(upload::<L>).layer(DefaultBodyLimit::disable()),
        )
        .route("/scan/info", get(scan_info::<L>))
}

fn is_zip(head: &[u8]) -> bool {
    ZIP_SIGNATURES.iter().any(|sig| head.starts_with(*sig))
}

fn has_zip_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case(ZIP_CONTENT_TYPE))
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Body errors as I/O errors the handler can tell apart from disk errors.
fn body_error(e: Box<dyn std::error::Error + Send + Sync>) -> io::Error {
    if e.is::<LengthLimitError>() {
        io::Error::new(io::ErrorKind::FileTooLarge, e)
    } else {
        io::Error::new(io::ErrorKind::ConnectionAborted, e)
    }
}

fn classify_body_error(e: &io::Error, limit: u64) -> Option<ServerError> {
    match e.kind() {
        io::ErrorKind::FileTooLarge => Some(ServerError::PayloadTooLarge { limit }),
        io::ErrorKind::ConnectionAborted => {
            Some(ServerError::BadRequest("failed to read upload body".to_owned()))
        }
        _ => None,
    }
}

/// `POST /scan`: store a zip archive and queue it for scanning.
///
/// The archive is fully on disk before the task row exists, so a worker
/// never claims a task whose input is still being written.
pub async fn upload<L: TaskLedger>(
    State(state): State<Arc<AppState<L>>>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<Value>), ServerError> {
    if !has_zip_content_type(&headers) {
        return Err(ServerError::UnsupportedMediaType(
            "unsupported content-type".to_owned(),
        ));
    }
    let limit = state.config.max_upload_bytes;
    if declared_length(&headers).is_some_and(|n| n > limit) {
        return Err(ServerError::PayloadTooLarge { limit });
    }

    let mut chunks = Limited::new(body, usize::try_from(limit).unwrap_or(usize::MAX))
        .into_data_stream()
        .map_err(body_error)
        .boxed();

    let mut head = BytesMut::with_capacity(SNIFF_LEN);
    while head.len() < SNIFF_LEN {
        match chunks.try_next().await {
            Ok(Some(chunk)) => head.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(e) => {
                return Err(classify_body_error(&e, limit)
                    .unwrap_or_else(|| ServerError::BadRequest(e.to_string())));
            }
        }
    }
    if head.is_empty() {
        return Err(ServerError::BadRequest("empty body".to_owned()));
    }
    if !is_zip(&head) {
        return Err(ServerError::BadRequest("invalid file type".to_owned()));
    }

    let id = TaskId::generate();
    let mut reader = StreamReader::new(stream::iter([Ok(head.freeze())]).chain(chunks));
    let bytes = match state.blobs.save_stream(BlobKind::Input, &id, &mut reader).await {
        Ok(n) => n,
        Err(BlobError::Io { path, source }) => {
            return Err(match classify_body_error(&source, limit) {
                Some(err) => err,
                None => BlobError::Io { path, source }.into(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    if let Err(e) = state.ledger.enqueue(&id).await {
        if let Err(cleanup) = state.blobs.remove(BlobKind::Input, &id).await {
            warn!(task_id = %id, error = %cleanup, "failed to remove orphaned upload");
        }
        return Err(e.into());
    }

    info!(task_id = %id, bytes, "archive queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "zip_id": id, "status": TaskStatus::Queued })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct InfoQuery {
    id: Option<String>,
}

/// `GET /scan/info?id=…`: task status, or the result document once done.
pub async fn scan_info<L: TaskLedger>(
    State(state): State<Arc<AppState<L>>>,
    Query(query): Query<InfoQuery>,
) -> Result<Response, ServerError> {
    let raw = query
        .id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ServerError::BadRequest("missing id".to_owned()))?;
    let id = TaskId::parse(&raw).map_err(|e| ServerError::BadRequest(format!("invalid id: {e}")))?;

    let task = state.ledger.get(&id).await?;
    match task.status {
        TaskStatus::Queued | TaskStatus::Running => Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "zip_id": task.id,
                "status": task.status,
                "ts":     task.timestamp,
            })),
        )
            .into_response()),
        TaskStatus::Failed => Ok(Json(json!({
            "zip_id": task.id,
            "status": task.status,
            "error":  task.error,
            "ts":     task.timestamp,
        }))
        .into_response()),
        TaskStatus::Done => match state.blobs.read(BlobKind::Result, &id).await {
            Ok(result) => Ok(([(header::CONTENT_TYPE, "application/json")], result).into_response()),
            Err(BlobError::NotFound { .. }) => {
                Err(ServerError::NotFound("result not found".to_owned()))
            }
            Err(e) => Err(e.into()),
        },
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
