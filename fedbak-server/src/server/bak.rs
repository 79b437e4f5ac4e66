use super::{error_response, response_error, ServerState};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::debug;

/// Checks the bearer token for a block transfer: it must be the exact
/// token last issued for this block, still valid, and issued to the
/// peer owning the reservation. A stored token that no longer
/// validates is dropped so a fresh one must be fetched.
fn authorize(state: &ServerState, headers: &HeaderMap, block_id: &str) -> Result<(), Response> {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| response_error(StatusCode::UNAUTHORIZED, "bearer token required"))?;

    let stored = match state.store.get_jwt_key(block_id) {
        Ok(Some(stored)) => stored,
        Ok(None) => {
            return Err(response_error(
                StatusCode::UNAUTHORIZED,
                "no token issued for this block",
            ))
        }
        Err(err) => return Err(error_response(err)),
    };
    if stored != presented {
        return Err(response_error(StatusCode::UNAUTHORIZED, "token mismatch"));
    }

    let hostname = match state.tokens.validate(presented) {
        Ok(hostname) => hostname,
        Err(err) => {
            debug!(block_id, "stored token no longer valid; discarding");
            if let Err(err) = state.store.delete_jwt_key(block_id) {
                return Err(error_response(err));
            }
            return Err(error_response(err));
        }
    };

    match state.store.get_external_block(block_id) {
        Ok(Some(ext)) if ext.server_hostname == hostname => Ok(()),
        Ok(Some(_)) => Err(response_error(
            StatusCode::UNAUTHORIZED,
            "token issued to a different peer",
        )),
        Ok(None) => Err(response_error(StatusCode::NOT_FOUND, "unknown block")),
        Err(err) => Err(error_response(err)),
    }
}

fn check_size(state: &ServerState, body: &Bytes) -> Result<(), Response> {
    if body.len() as u64 != state.config.block_size {
        return Err(response_error(
            StatusCode::BAD_REQUEST,
            format!(
                "body must be exactly {} bytes, got {}",
                state.config.block_size,
                body.len()
            ),
        ));
    }
    Ok(())
}

pub(crate) async fn create_block(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Err(response) = authorize(&state, &headers, &id) {
        return response;
    }
    if let Err(response) = check_size(&state, &body) {
        return response;
    }

    match state.data.create_external_block(&id, body).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn update_block(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Err(response) = authorize(&state, &headers, &id) {
        return response;
    }
    if let Err(response) = check_size(&state, &body) {
        return response;
    }

    match state.data.update_external_block(&id, body).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn download_block(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(response) = authorize(&state, &headers, &id) {
        return response;
    }

    match state.data.read_external_block(&id).await {
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
