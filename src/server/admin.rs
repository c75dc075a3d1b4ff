//! Admin pipeline: key upload / list / public fetch / delete, audit queries.
//!
//! All routes sit behind a bearer-token check against the configured admin
//! token, compared in constant time.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use super::request_id;
use super::router::AppState;
use super::sign::spawn_audit;
use crate::audit::{AuditAction, AuditEvent, AuditQueryParams};
use crate::error::{AppError, ErrorCode};
use crate::keystore::{KeyStoreError, StoredKey, normalize_key_id};
use crate::signer::{Signer, SignerError, validate_armored_private_key};

/// Constant-time admin bearer check applied to every `/admin/*` route.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(ref admin_token) = state.admin_token else {
        warn!("Admin request rejected: no admin token configured");
        return AppError::code(ErrorCode::AuthMissing).into_response();
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")));

    let Some(provided) = provided else {
        return with_authenticate_header(AppError::code(ErrorCode::AuthMissing).into_response());
    };

    // Constant-time comparison to prevent timing side-channels
    let matches: bool = provided
        .as_bytes()
        .ct_eq(admin_token.as_bytes())
        .into();
    if !matches {
        warn!(path = %request.uri().path(), "Invalid admin token");
        return with_authenticate_header(AppError::code(ErrorCode::AuthInvalid).into_response());
    }

    next.run(request).await
}

fn with_authenticate_header(mut response: Response) -> Response {
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        axum::http::HeaderValue::from_static("Bearer"),
    );
    response
}

/// `POST /admin/keys` request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadKeyRequest {
    /// Armored private key block.
    pub armored_private_key: String,
    /// Expected key id; must match the derived id when present.
    pub key_id: Option<String>,
}

/// `POST /admin/keys` — parse, validate, re-armor, and persist a key.
pub async fn upload_key(
    State(state): State<Arc<AppState>>,
    body: Result<Json<UploadKeyRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = body.map_err(|e| AppError::new(ErrorCode::InvalidRequest, e.to_string()))?;

    validate_armored_private_key(&request.armored_private_key)
        .map_err(|e| AppError::new(ErrorCode::InvalidRequest, e.to_string()))?;

    let info = Signer::parse_and_validate(&request.armored_private_key, Some(&state.passphrase))
        .map_err(upload_error)?;

    // The derived id is authoritative; a supplied id must agree with it.
    if let Some(ref requested) = request.key_id {
        let requested = normalize_key_id(requested)
            .map_err(|e| AppError::new(ErrorCode::InvalidRequest, e.to_string()))?;
        if requested != info.key_id {
            return Err(AppError::new(
                ErrorCode::InvalidRequest,
                format!(
                    "keyId {requested} does not match the id {} derived from the key material",
                    info.key_id
                ),
            ));
        }
    }

    let armored = Signer::rearmor(&request.armored_private_key).map_err(upload_error)?;

    let existing = state
        .key_store
        .get(&info.key_id)
        .await
        .map_err(|e| AppError::new(ErrorCode::KeyUploadError, e.to_string()))?;
    let action = if existing.is_some() {
        AuditAction::KeyRotate
    } else {
        AuditAction::KeyUpload
    };

    let stored = StoredKey {
        armored_private_key: armored,
        key_id: info.key_id.clone(),
        fingerprint: info.fingerprint.clone(),
        created_at: Utc::now(),
        algorithm: info.algorithm.clone(),
    };

    if let Err(e) = state.key_store.put(stored).await {
        let rid = request_id::current().unwrap_or_default();
        spawn_audit(
            Arc::clone(&state.audit),
            AuditEvent::failure(action, rid, "", "admin", &info.key_id, ErrorCode::KeyUploadError),
        );
        return Err(AppError::new(ErrorCode::KeyUploadError, e.to_string()));
    }

    // A rotated key must not keep serving its old unlocked handle.
    state.signer.cache().invalidate(&info.key_id);

    info!(
        key_id = %info.key_id,
        fingerprint = %info.fingerprint,
        algorithm = %info.algorithm,
        rotated = existing.is_some(),
        "Key stored"
    );
    let rid = request_id::current().unwrap_or_default();
    spawn_audit(
        Arc::clone(&state.audit),
        AuditEvent::success(action, rid, "", "admin", &info.key_id).with_metadata(json!({
            "fingerprint": info.fingerprint,
            "algorithm": info.algorithm,
            "userId": info.user_id,
        })),
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "keyId": info.key_id,
            "fingerprint": info.fingerprint,
            "algorithm": info.algorithm,
        })),
    )
        .into_response())
}

fn upload_error(err: SignerError) -> AppError {
    AppError::new(ErrorCode::KeyUploadError, err.to_string())
}

/// `GET /admin/keys` — metadata listing, private material omitted.
pub async fn list_keys(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let keys = state
        .key_store
        .list()
        .await
        .map_err(|e| AppError::new(ErrorCode::KeyListError, e.to_string()))?;

    Ok(Json(json!({ "keys": keys })).into_response())
}

/// `GET /admin/keys/:keyId/public` — armored public half.
pub async fn get_public_key(
    State(state): State<Arc<AppState>>,
    Path(key_id): Path<String>,
) -> Result<Response, AppError> {
    let stored = match state.key_store.get(&key_id).await {
        Ok(Some(key)) => key,
        Ok(None) | Err(KeyStoreError::InvalidKeyId(_)) => {
            return Err(AppError::code(ErrorCode::KeyNotFound));
        }
        Err(e) => return Err(AppError::new(ErrorCode::KeyProcessingError, e.to_string())),
    };

    match Signer::extract_public(&stored.armored_private_key) {
        Ok(public) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/pgp-keys")],
            public,
        )
            .into_response()),
        Err(e) => {
            // Not representable in the audit action set; the structured log
            // carries the request id instead.
            tracing::error!(
                key_id = %stored.key_id,
                request_id = %request_id::current().unwrap_or_default(),
                error = %e,
                "Stored private material failed public extraction"
            );
            Err(AppError::new(ErrorCode::KeyProcessingError, e.to_string()))
        }
    }
}

/// `DELETE /admin/keys/:keyId` — idempotent delete, always 200.
pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(key_id): Path<String>,
) -> Result<Response, AppError> {
    let deleted = match state.key_store.delete(&key_id).await {
        Ok(deleted) => deleted,
        // Malformed ids cannot name a stored key; deleting one is a no-op.
        Err(KeyStoreError::InvalidKeyId(_)) => false,
        Err(e) => return Err(AppError::new(ErrorCode::KeyDeleteError, e.to_string())),
    };

    if deleted {
        state.signer.cache().invalidate(&key_id.to_ascii_uppercase());
        info!(key_id = %key_id, "Key deleted");
    }

    Ok(Json(json!({ "success": true, "deleted": deleted })).into_response())
}

/// `GET /admin/audit` — paginated, filtered audit query.
pub async fn query_audit(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuditQueryParams>,
) -> Result<Response, AppError> {
    let query = params
        .validate()
        .map_err(|e| AppError::new(ErrorCode::InvalidRequest, e.to_string()))?;

    let logs = state
        .audit
        .query(&query)
        .await
        .map_err(|e| AppError::new(ErrorCode::AuditError, e.to_string()))?;

    Ok(Json(json!({ "logs": logs, "count": logs.len() })).into_response())
}
