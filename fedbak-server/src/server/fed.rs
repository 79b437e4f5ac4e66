use super::{caller_hostname, error_response, response_error, ServerState};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine;
use chrono::{DateTime, Utc};
use fedbak_core::error::BakError;
use fedbak_core::fed_client::{
    Amount, BackupCode, BlockInfo, BlockList, BlockVerify, DomainField, FedInfo, HashField,
    JwtField, MaintenanceWindow,
};
use fedbak_core::hash::HashMethod;
use fedbak_core::metadata_store::{
    ExternalBlock, Maintenance, ServerEntry, MAX_MAINTENANCE_SECS,
};
use rand::RngCore;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Non-standard code the original wire protocol uses for a freshly
/// issued verification code (202 means "already verified").
fn status_issued() -> StatusCode {
    StatusCode::from_u16(209).unwrap_or(StatusCode::ACCEPTED)
}

fn new_backup_code() -> String {
    let mut raw = [0u8; 16];
    rand::rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

fn require_caller(headers: &HeaderMap) -> Result<String, Response> {
    caller_hostname(headers)
        .ok_or_else(|| response_error(StatusCode::BAD_REQUEST, "domain header is required"))
}

pub(crate) async fn server_info(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let caller = match require_caller(&headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    let record = match state.store.get_server(&caller) {
        Ok(record) => record,
        Err(err) => return error_response(err),
    };
    let free_blocks = match state.data.free_external_blocks(state.store.as_ref()) {
        Ok(free) => free,
        Err(err) => return error_response(err),
    };
    let known_server = match state.store.list_servers() {
        Ok(servers) => servers
            .into_iter()
            .filter(|server| server.is_verified)
            .map(|server| server.hostname)
            .collect(),
        Err(err) => return error_response(err),
    };

    Json(FedInfo {
        hostname: state.config.hostname.clone(),
        owner: state.config.owner.clone(),
        block_size: state.config.block_size,
        free_blocks,
        healthcheck_percent: state.config.health_check_percent,
        healthcheck_interval: state.config.health_check_interval,
        hash_methods: HashMethod::supported_names(),
        is_verified: record.map(|record| record.is_verified).unwrap_or(false),
        known_server,
    })
    .into_response()
}

/// A peer introduces itself. A new or pending peer gets (or re-gets)
/// its backup code with 209; a peer we already verified gets 202.
pub(crate) async fn request_verify(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let caller = match require_caller(&headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    match state.store.get_server(&caller) {
        Ok(Some(record)) if record.is_verified => (
            StatusCode::ACCEPTED,
            Json(BackupCode {
                backup_code: record.backup_code,
            }),
        )
            .into_response(),
        Ok(Some(record)) => (
            status_issued(),
            Json(BackupCode {
                backup_code: record.backup_code,
            }),
        )
            .into_response(),
        Ok(None) => {
            let record = ServerEntry {
                hostname: caller.clone(),
                old_hostnames: Vec::new(),
                is_verified: false,
                healthy: true,
                maintenance: None,
                future_hostname: None,
                backup_code: new_backup_code(),
            };
            match state.store.add_new_server(&record) {
                Ok(true) => {
                    info!(peer = %caller, "verification requested");
                    (
                        status_issued(),
                        Json(BackupCode {
                            backup_code: record.backup_code,
                        }),
                    )
                        .into_response()
                }
                Ok(false) => response_error(StatusCode::CONFLICT, "peer registered concurrently"),
                Err(err) => error_response(err),
            }
        }
        Err(err) => error_response(err),
    }
}

/// Marks a pending peer as verified and hands back the shared code.
pub(crate) async fn confirm_verify(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let caller = match require_caller(&headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    match state.store.get_server(&caller) {
        Ok(Some(mut record)) => {
            record.is_verified = true;
            if let Err(err) = state.store.update_server(&record) {
                return error_response(err);
            }
            info!(peer = %caller, "peer verified");
            Json(BackupCode {
                backup_code: record.backup_code,
            })
            .into_response()
        }
        Ok(None) => response_error(StatusCode::NOT_FOUND, "unknown peer"),
        Err(err) => error_response(err),
    }
}

/// Rebinds an existing peer record to the calling hostname after the
/// peer lost its identity (proven by the backup code) or completes an
/// announced migration. More than one matching record means the
/// metadata is corrupt; that aborts the request.
pub(crate) async fn restore_server(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<BackupCode>,
) -> impl IntoResponse {
    let caller = match require_caller(&headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    let servers = match state.store.list_servers() {
        Ok(servers) => servers,
        Err(err) => return error_response(err),
    };
    let matches: Vec<&ServerEntry> = servers
        .iter()
        .filter(|server| {
            server.backup_code == body.backup_code
                || server.future_hostname.as_deref() == Some(caller.as_str())
        })
        .collect();

    match matches.as_slice() {
        [] => response_error(StatusCode::NOT_FOUND, "no matching peer record"),
        [record] => {
            let old_hostname = record.hostname.clone();
            match state.store.update_server_hostname(&old_hostname, &caller) {
                Ok(true) => {
                    info!(old = %old_hostname, new = %caller, "peer hostname restored");
                    StatusCode::OK.into_response()
                }
                Ok(false) => response_error(StatusCode::NOT_FOUND, "no matching peer record"),
                Err(err) => error_response(err),
            }
        }
        _ => {
            error!(peer = %caller, "ambiguous restore: multiple records match");
            error_response(BakError::InvariantViolation(
                "ambiguous restore match".to_string(),
            ))
        }
    }
}

/// A peer announces it will move to a new hostname.
pub(crate) async fn migrate_server(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<DomainField>,
) -> impl IntoResponse {
    let caller = match require_caller(&headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    match state.store.get_server(&body.domain) {
        Ok(Some(_)) => {
            return response_error(StatusCode::CONFLICT, "target hostname already known")
        }
        Ok(None) => {}
        Err(err) => return error_response(err),
    }

    match state.store.get_server(&caller) {
        Ok(Some(mut record)) => {
            record.future_hostname = Some(body.domain.clone());
            if let Err(err) = state.store.update_server(&record) {
                return error_response(err);
            }
            info!(peer = %caller, future = %body.domain, "migration announced");
            StatusCode::OK.into_response()
        }
        Ok(None) => response_error(StatusCode::NOT_FOUND, "unknown peer"),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn set_maintenance(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<MaintenanceWindow>,
) -> impl IntoResponse {
    let caller = match require_caller(&headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    if body.to <= body.from {
        return response_error(StatusCode::BAD_REQUEST, "window must end after it starts");
    }
    if body.to - body.from > MAX_MAINTENANCE_SECS {
        return response_error(
            StatusCode::NOT_ACCEPTABLE,
            "maintenance window exceeds two days",
        );
    }
    let (Some(start), Some(end)) = (
        DateTime::<Utc>::from_timestamp(body.from, 0),
        DateTime::<Utc>::from_timestamp(body.to, 0),
    ) else {
        return response_error(StatusCode::BAD_REQUEST, "invalid timestamps");
    };

    match state.store.get_server(&caller) {
        Ok(Some(mut record)) => {
            record.maintenance = Some(Maintenance { start, end });
            if let Err(err) = state.store.update_server(&record) {
                return error_response(err);
            }
            StatusCode::OK.into_response()
        }
        Ok(None) => response_error(StatusCode::NOT_FOUND, "unknown peer"),
        Err(err) => error_response(err),
    }
}

/// Removes a peer entirely: its reserved capacity, its replica
/// entries and its record. Detached blocks go on the change queue so
/// the placement worker finds them under-replicated.
pub(crate) async fn delete_server(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let caller = match require_caller(&headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    match state.store.get_server(&caller) {
        Ok(Some(_)) => {}
        Ok(None) => return response_error(StatusCode::NOT_FOUND, "unknown peer"),
        Err(err) => return error_response(err),
    }

    let reserved = match state.store.list_external_blocks_for(&caller) {
        Ok(reserved) => reserved,
        Err(err) => return error_response(err),
    };
    for ext in &reserved {
        if let Err(err) = state.data.delete_external_block_content(&ext.id).await {
            warn!(id = %ext.id, %err, "could not delete external block content");
        }
        if let Err(err) = state.store.delete_external_block(&ext.id) {
            return error_response(err);
        }
    }

    let blocks = match state.store.list_blocks() {
        Ok(blocks) => blocks,
        Err(err) => return error_response(err),
    };
    for mut block in blocks {
        if block.server_to_id.remove(&caller).is_none() {
            continue;
        }
        if let Err(err) = state.store.remove_block_server(&block.id, &caller) {
            return error_response(err);
        }
        state.queue.push(block);
    }

    match state.store.delete_server(&caller) {
        Ok(_) => {
            info!(peer = %caller, "peer deleted");
            StatusCode::OK.into_response()
        }
        Err(err) => error_response(err),
    }
}

pub(crate) async fn list_blocks(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let caller = match require_caller(&headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    let reserved = match state.store.list_external_blocks_for(&caller) {
        Ok(reserved) => reserved,
        Err(err) => return error_response(err),
    };

    let mut blocks = Vec::with_capacity(reserved.len());
    for ext in reserved {
        let last_modified = match state.data.external_last_modified(&ext.id).await {
            Ok(last_modified) => last_modified,
            Err(err) => return error_response(err),
        };
        blocks.push(BlockInfo {
            id: ext.id,
            last_modified,
        });
    }
    Json(BlockList { blocks }).into_response()
}

/// Reserves fresh external blocks for the caller. Rejected when we
/// lack the capacity (507) or when the caller asks for more bytes
/// than it advertises back to the federation (406).
pub(crate) async fn reserve_blocks(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<Amount>,
) -> impl IntoResponse {
    let caller = match require_caller(&headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    match state.store.get_server(&caller) {
        Ok(Some(record)) if record.is_verified => {}
        Ok(Some(_)) => return response_error(StatusCode::UNAUTHORIZED, "peer not verified"),
        Ok(None) => return response_error(StatusCode::NOT_FOUND, "unknown peer"),
        Err(err) => return error_response(err),
    }

    let free = match state.data.free_external_blocks(state.store.as_ref()) {
        Ok(free) => free,
        Err(err) => return error_response(err),
    };
    if (body.amount as i64) > free {
        return response_error(
            StatusCode::INSUFFICIENT_STORAGE,
            "not enough free capacity",
        );
    }

    // Reciprocity: the caller may not take more bytes from us than it
    // advertises to the federation.
    let info = match state.fed.server_info(&caller).await {
        Ok(info) => info,
        Err(err) => return error_response(err),
    };
    let existing = match state.store.list_external_blocks_for(&caller) {
        Ok(existing) => existing.len() as u64,
        Err(err) => return error_response(err),
    };
    let advertised = info.free_blocks.max(0) as u64 * info.block_size;
    let requested = (existing + body.amount) * state.config.block_size;
    if advertised < requested {
        return response_error(
            StatusCode::NOT_ACCEPTABLE,
            "reservation exceeds advertised capacity",
        );
    }

    let mut created = Vec::with_capacity(body.amount as usize);
    for _ in 0..body.amount {
        let mut retries = 0;
        loop {
            let candidate = ExternalBlock {
                id: Uuid::new_v4().to_string(),
                server_hostname: caller.clone(),
            };
            match state.store.add_new_external_block(&candidate) {
                Ok(true) => {
                    created.push(candidate.id);
                    break;
                }
                Ok(false) => {
                    retries += 1;
                    if retries >= 1000 {
                        for id in &created {
                            if let Err(err) = state.store.delete_external_block(id) {
                                warn!(id, %err, "could not roll back reservation");
                            }
                        }
                        return error_response(BakError::InvariantViolation(
                            "could not allocate a unique reservation id".to_string(),
                        ));
                    }
                }
                Err(err) => return error_response(err),
            }
        }
    }

    info!(peer = %caller, amount = body.amount, "external blocks reserved");
    (
        StatusCode::CREATED,
        Json(BlockList {
            blocks: created
                .into_iter()
                .map(|id| BlockInfo {
                    id,
                    last_modified: 0,
                })
                .collect(),
        }),
    )
        .into_response()
}

fn owned_external_block(
    state: &ServerState,
    caller: &str,
    id: &str,
) -> Result<ExternalBlock, Response> {
    match state.store.get_external_block(id) {
        Ok(Some(ext)) if ext.server_hostname == caller => Ok(ext),
        Ok(_) => Err(response_error(StatusCode::NOT_FOUND, "unknown block")),
        Err(err) => Err(error_response(err)),
    }
}

pub(crate) async fn block_jwt(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let caller = match require_caller(&headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    if let Err(response) = owned_external_block(&state, &caller, &id) {
        return response;
    }

    let token = match state.tokens.issue(&caller) {
        Ok(token) => token,
        Err(err) => return error_response(err),
    };
    if let Err(err) = state.store.put_jwt_key(&id, &token) {
        return error_response(err);
    }
    Json(JwtField { jwt: token }).into_response()
}

/// Answers an integrity challenge: salted hash of the content we hold
/// for this block.
pub(crate) async fn verify_block(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<BlockVerify>,
) -> impl IntoResponse {
    let caller = match require_caller(&headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    if let Err(response) = owned_external_block(&state, &caller, &id) {
        return response;
    }

    let Some(method) = HashMethod::from_name(&body.hash_method) else {
        return response_error(StatusCode::NOT_ACCEPTABLE, "unsupported hash method");
    };
    let Ok(salt) = base64::engine::general_purpose::STANDARD.decode(&body.salt) else {
        return response_error(StatusCode::BAD_REQUEST, "salt is not valid base64");
    };

    match state.data.external_salted_hash(&id, &salt, method).await {
        Ok(hash) => Json(HashField { hash }).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn delete_block(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let caller = match require_caller(&headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    if let Err(response) = owned_external_block(&state, &caller, &id) {
        return response;
    }

    if let Err(err) = state.data.delete_external_block_content(&id).await {
        return error_response(err);
    }
    match state.store.delete_external_block(&id) {
        Ok(_) => StatusCode::OK.into_response(),
        Err(err) => error_response(err),
    }
}
