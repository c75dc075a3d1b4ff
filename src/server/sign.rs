//! The signing pipeline: auth → rate limit → key fetch → sign → audit.
//!
//! Stages run strictly in order; the first failure decides the response.
//! Everything from the rate-limit stage onward has an authenticated subject,
//! so those outcomes (success or failure) produce an audit row. The audit
//! append runs as a detached task: client disconnects cannot cancel it, and
//! its failure is logged without touching the response.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{error, info, warn};

use super::request_id;
use super::router::AppState;
use crate::audit::{AuditAction, AuditEvent, AuditStore};
use crate::error::{AppError, ErrorCode};
use crate::keystore::{KeyStoreError, StoredKey};
use crate::oidc::VerifiedClaims;
use crate::signer::SignerError;

/// Query parameters accepted by `POST /sign`.
#[derive(Debug, Deserialize)]
pub struct SignParams {
    /// Key to sign with; falls back to the configured default.
    #[serde(rename = "keyId")]
    pub key_id: Option<String>,
}

/// `POST /sign` — produce a detached armored signature over the body bytes.
pub async fn sign_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SignParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    if body.is_empty() {
        return Err(AppError::new(
            ErrorCode::InvalidRequest,
            "Request body is empty; supply the payload to sign",
        ));
    }

    // Authentication: no audit row before this point (there is no subject).
    let token = bearer_token(&headers).ok_or_else(|| AppError::code(ErrorCode::AuthMissing))?;
    let claims = state.verifier.verify(token).await.map_err(|e| {
        warn!(error = %e, "OIDC verification failed");
        AppError::code(ErrorCode::AuthInvalid)
    })?;

    sign_authenticated(&state, &claims, params.key_id, &body).await
}

/// The post-auth pipeline, split out so stages can be exercised with fixture
/// claims in tests.
pub async fn sign_authenticated(
    state: &AppState,
    claims: &VerifiedClaims,
    requested_key_id: Option<String>,
    payload: &[u8],
) -> Result<Response, AppError> {
    let request_id = request_id::current().unwrap_or_default();
    let audit_identity = |key_id: &str| {
        (
            request_id.clone(),
            claims.issuer.clone(),
            claims.subject.clone(),
            key_id.to_string(),
        )
    };

    // Rate limiting
    let identity = claims.rate_limit_identity();
    let decision = match state.limiter.consume(&identity).await {
        Ok(decision) => decision,
        Err(e) => {
            error!(error = %e, "Rate limiter unreachable");
            let (rid, iss, sub, kid) = audit_identity("");
            spawn_audit(
                Arc::clone(&state.audit),
                AuditEvent::failure(AuditAction::Sign, rid, iss, sub, kid, ErrorCode::RateLimitError),
            );
            return Err(AppError::code(ErrorCode::RateLimitError));
        }
    };
    if !decision.allowed {
        info!(identity = %identity, reset_at = %decision.reset_at, "Rate limited");
        let (rid, iss, sub, kid) = audit_identity("");
        spawn_audit(
            Arc::clone(&state.audit),
            AuditEvent::failure(AuditAction::Sign, rid, iss, sub, kid, ErrorCode::RateLimited),
        );
        return Err(AppError::code(ErrorCode::RateLimited));
    }

    // Key resolution: query param, else configured default, else invalid.
    let key_id = requested_key_id
        .or_else(|| state.default_key_id.clone())
        .ok_or_else(|| {
            AppError::new(
                ErrorCode::InvalidRequest,
                "No keyId requested and no default key configured",
            )
        })?;

    let stored = match fetch_key(state, &key_id).await {
        Ok(stored) => stored,
        Err(err) => {
            let (rid, iss, sub, kid) = audit_identity(&key_id);
            spawn_audit(
                Arc::clone(&state.audit),
                AuditEvent::failure(AuditAction::Sign, rid, iss, sub, kid, err.code),
            );
            return Err(err);
        }
    };

    // Signing
    match state.signer.sign(payload, &stored, &state.passphrase) {
        Ok(result) => {
            info!(
                key_id = %result.key_id,
                algorithm = %result.algorithm,
                subject = %claims.subject,
                payload_bytes = payload.len(),
                "Payload signed"
            );
            let (rid, iss, sub, kid) = audit_identity(&stored.key_id);
            spawn_audit(
                Arc::clone(&state.audit),
                AuditEvent::success(AuditAction::Sign, rid, iss, sub, kid)
                    .with_metadata(serde_json::json!({
                        "fingerprint": result.fingerprint,
                        "algorithm": result.algorithm,
                        "payloadBytes": payload.len(),
                    })),
            );
            Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/pgp-signature")],
                result.signature,
            )
                .into_response())
        }
        Err(e) => {
            error!(error = %e, key_id = %stored.key_id, "Signing failed");
            let (rid, iss, sub, kid) = audit_identity(&stored.key_id);
            spawn_audit(
                Arc::clone(&state.audit),
                AuditEvent::failure(AuditAction::Sign, rid, iss, sub, kid, ErrorCode::SignError),
            );
            Err(sign_error(&e))
        }
    }
}

/// Resolve the stored key, mapping store outcomes to pipeline errors.
async fn fetch_key(state: &AppState, key_id: &str) -> Result<StoredKey, AppError> {
    match state.key_store.get(key_id).await {
        Ok(Some(stored)) => Ok(stored),
        Ok(None) | Err(KeyStoreError::InvalidKeyId(_)) => {
            Err(AppError::code(ErrorCode::KeyNotFound))
        }
        // Upstream store failures carry their own message; surface it.
        Err(e) => Err(AppError::new(ErrorCode::InternalError, e.to_string())),
    }
}

fn sign_error(err: &SignerError) -> AppError {
    // All signer failures on this route report SIGN_ERROR per the contract;
    // the precise cause stays in the logs.
    AppError::new(ErrorCode::SignError, err.to_string())
}

/// Extract a bearer token from the Authorization header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .filter(|t| !t.is_empty())
}

/// Detached audit append: survives client cancellation, failure is logged.
pub(crate) fn spawn_audit(audit: Arc<dyn AuditStore>, event: AuditEvent) {
    tokio::spawn(async move {
        if let Err(e) = audit.append(event).await {
            error!(error = %e, "Audit append failed");
        }
    });
}
