use super::{error_response, response_error, FileCreated, FileListEntry, FileQuery, ServerState};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use fedbak_core::metadata_store::FileEntry;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_ID_RETRIES: usize = 10;

pub(crate) async fn list_files(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    match state.store.list_files() {
        Ok(files) => Json(
            files
                .into_iter()
                .map(|file| FileListEntry {
                    id: file.id,
                    path: file.path,
                })
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(err) => error_response(err),
    }
}

/// Stores a new client file, chunks it into blocks and queues those
/// blocks for replication.
pub(crate) async fn create_file(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<FileQuery>,
    body: Bytes,
) -> impl IntoResponse {
    if query.path.is_empty() {
        return response_error(StatusCode::BAD_REQUEST, "path must not be empty");
    }

    let mut retries = 0;
    let file = loop {
        let candidate = FileEntry {
            id: Uuid::new_v4().to_string(),
            path: query.path.clone(),
        };
        match state.store.add_new_file(&candidate) {
            Ok(true) => break candidate,
            Ok(false) => {
                retries += 1;
                if retries > MAX_ID_RETRIES {
                    return error_response(fedbak_core::BakError::InvariantViolation(
                        "could not allocate a unique file id".to_string(),
                    ));
                }
            }
            Err(err) => return error_response(err),
        }
    };

    let blocks = match state
        .data
        .create_file(state.store.as_ref(), &file, body)
        .await
    {
        Ok(blocks) => blocks,
        Err(err) => {
            if let Err(err) = state.store.delete_file(&file.id) {
                warn!(id = %file.id, %err, "could not roll back file record");
            }
            return error_response(err);
        }
    };
    for block in blocks {
        state.queue.push(block);
    }

    info!(id = %file.id, path = %file.path, "file stored");
    (StatusCode::CREATED, Json(FileCreated { id: file.id })).into_response()
}

pub(crate) async fn download_file(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.data.read_file(&id).await {
        Ok(content) => {
            let mut response = Response::new(content.into());
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            response
        }
        Err(err) => error_response(err),
    }
}

/// Replaces a file's content and queues its blocks for re-propagation.
pub(crate) async fn update_file(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let file = match state.store.get_file(&id) {
        Ok(Some(file)) => file,
        Ok(None) => return response_error(StatusCode::NOT_FOUND, "unknown file"),
        Err(err) => return error_response(err),
    };

    let blocks = match state
        .data
        .update_file(state.store.as_ref(), &file, body)
        .await
    {
        Ok(blocks) => blocks,
        Err(err) => return error_response(err),
    };
    for block in blocks {
        state.queue.push(block);
    }
    StatusCode::OK.into_response()
}

/// Deletes a file. Blocks that still carry other files get refreshed
/// remotely; blocks left empty are deleted here and their remote
/// copies cleaned up by the propagation worker.
pub(crate) async fn delete_file(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let file = match state.store.get_file(&id) {
        Ok(Some(file)) => file,
        Ok(None) => return response_error(StatusCode::NOT_FOUND, "unknown file"),
        Err(err) => return error_response(err),
    };

    let touched = match state.data.delete_file(state.store.as_ref(), &file).await {
        Ok(touched) => touched,
        Err(err) => return error_response(err),
    };
    if let Err(err) = state.store.delete_file(&id) {
        return error_response(err);
    }
    for block in touched {
        state.queue.push(block);
    }

    info!(id = %file.id, "file deleted");
    StatusCode::OK.into_response()
}
