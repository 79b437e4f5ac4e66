use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use fedbak_core::error::BakError;
use fedbak_core::fed_client::{
    BackupClient, FederationClient, HttpBackupClient, HttpFederationClient,
};
use fedbak_core::jwt::TokenIssuer;
use fedbak_core::workers::health::HealthWorker;
use fedbak_core::workers::placement::PlacementWorker;
use fedbak_core::workers::propagation::PropagationWorker;
use fedbak_core::workers::queue::ChangeQueue;
use fedbak_core::{DataStore, MetadataStore, NodeConfig, Result, SqliteStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

mod bak;
mod client;
mod fed;
mod types;

pub(crate) use types::*;

pub struct ServerState {
    pub(crate) config: NodeConfig,
    pub(crate) store: Arc<dyn MetadataStore>,
    pub(crate) data: Arc<DataStore>,
    pub(crate) fed: Arc<dyn FederationClient>,
    pub(crate) tokens: TokenIssuer,
    pub(crate) queue: ChangeQueue,
}

pub async fn run_server(config: NodeConfig) -> Result<()> {
    config.validate()?;

    let store: Arc<dyn MetadataStore> = Arc::new(SqliteStore::new(config.db_path())?);
    let data = Arc::new(DataStore::new(
        config.mount_path.clone(),
        config.block_size,
        config.external_capacity(),
    )?);
    let fed: Arc<dyn FederationClient> = Arc::new(HttpFederationClient::new(
        config.hostname.clone(),
        config.peer_scheme.clone(),
    ));
    let backup: Arc<dyn BackupClient> =
        Arc::new(HttpBackupClient::new(config.peer_scheme.clone()));

    let (queue, receiver) = ChangeQueue::channel();

    let placement = Arc::new(PlacementWorker::new(
        store.clone(),
        data.clone(),
        fed.clone(),
        backup.clone(),
        Duration::from_secs(config.placement_interval_secs),
    ));
    tokio::spawn(placement.run());

    let propagation = Arc::new(PropagationWorker::new(
        store.clone(),
        data.clone(),
        fed.clone(),
        backup.clone(),
        queue.clone(),
        receiver,
        Duration::from_secs(config.propagation_interval_secs),
    ));
    tokio::spawn(propagation.run());

    let health = Arc::new(HealthWorker::new(
        store.clone(),
        data.clone(),
        fed.clone(),
        config.health_check_percent,
        config.health_check_interval,
    ));
    tokio::spawn(health.run());

    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(ServerState {
        config,
        store,
        data,
        fed,
        tokens: TokenIssuer::new(),
        queue,
    });

    let app = build_router(state);

    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("fedbak listening on {}", bind_addr);

    axum::serve(listener, app)
        .await
        .map_err(|error| BakError::Config(error.to_string()))?;

    Ok(())
}

pub(crate) fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/api/fed/v1/server/info", get(fed::server_info))
        .route(
            "/api/fed/v1/server/verify",
            put(fed::request_verify).post(fed::confirm_verify),
        )
        .route("/api/fed/v1/server/restore", put(fed::restore_server))
        .route("/api/fed/v1/server/migrate", put(fed::migrate_server))
        .route("/api/fed/v1/server/maintenance", post(fed::set_maintenance))
        .route("/api/fed/v1/server", delete(fed::delete_server))
        .route(
            "/api/fed/v1/block",
            get(fed::list_blocks).post(fed::reserve_blocks),
        )
        .route("/api/fed/v1/block/:id/jwt", get(fed::block_jwt))
        .route(
            "/api/fed/v1/block/:id",
            post(fed::verify_block).delete(fed::delete_block),
        )
        .route(
            "/api/bak/v1/block/:id",
            post(bak::create_block)
                .put(bak::update_block)
                .get(bak::download_block),
        )
        .route(
            "/api/client/v1/file",
            get(client::list_files).post(client::create_file),
        )
        .route(
            "/api/client/v1/file/:id",
            get(client::download_file)
                .put(client::update_file)
                .delete(client::delete_file),
        )
        .with_state(state)
}

pub(crate) fn response_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Default mapping from the error taxonomy to HTTP statuses; handlers
/// with endpoint-specific codes match the variants themselves.
pub(crate) fn error_response(err: BakError) -> Response {
    match err {
        BakError::NotFound(message) => response_error(StatusCode::NOT_FOUND, message),
        BakError::Conflict(message) => response_error(StatusCode::CONFLICT, message),
        BakError::Unauthorized(message) => response_error(StatusCode::UNAUTHORIZED, message),
        BakError::CapacityExceeded(message) => {
            response_error(StatusCode::INSUFFICIENT_STORAGE, message)
        }
        other => response_error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

/// Caller hostname from the `domain` header of a federation request.
pub(crate) fn caller_hostname(headers: &HeaderMap) -> Option<String> {
    headers
        .get("domain")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
pub(crate) mod test_support;
