//! HTTP router and public handlers.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router, middleware};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use super::{admin, request_id, sign};
use crate::audit::AuditStore;
use crate::error::{AppError, ErrorCode};
use crate::keystore::{KeyStore, KeyStoreError};
use crate::oidc::OidcVerifier;
use crate::ratelimit::RateLimiter;
use crate::signer::Signer;

/// Request body cap for `/sign` payloads.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared application state, assembled once at startup.
pub struct AppState {
    /// OIDC verifier (JWKS cache inside).
    pub verifier: Arc<OidcVerifier>,
    /// Per-identity rate limiter.
    pub limiter: Arc<dyn RateLimiter>,
    /// Durable key store.
    pub key_store: Arc<dyn KeyStore>,
    /// Audit writer/reader.
    pub audit: Arc<dyn AuditStore>,
    /// Signing engine (owns the decrypted-key cache).
    pub signer: Arc<Signer>,
    /// Admin bearer token.
    pub admin_token: Option<String>,
    /// Service-wide key passphrase.
    pub passphrase: String,
    /// Default key id when the request omits one.
    pub default_key_id: Option<String>,
    /// CORS origins; empty means `*`.
    pub allowed_origins: Vec<String>,
}

/// Build the service router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.allowed_origins);

    let admin_routes = Router::new()
        .route("/admin/keys", post(admin::upload_key).get(admin::list_keys))
        .route("/admin/keys/{key_id}/public", get(admin::get_public_key))
        .route("/admin/keys/{key_id}", delete(admin::delete_key))
        .route("/admin/audit", get(admin::query_audit))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            admin::auth_middleware,
        ));

    Router::new()
        .route("/sign", post(sign::sign_handler))
        .route("/public-key", get(public_key_handler))
        .route("/health", get(health_handler))
        .merge(admin_routes)
        .fallback(not_found_handler)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn(request_id::middleware))
        .layer(CatchPanicLayer::new())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS: `*` on public endpoints unless an explicit origin list is set.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    if allowed_origins.is_empty() {
        base.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .iter()
            .filter_map(|o| {
                HeaderValue::from_str(o)
                    .map_err(|e| warn!(origin = %o, error = %e, "Ignoring invalid CORS origin"))
                    .ok()
            })
            .collect();
        base.allow_origin(AllowOrigin::list(origins))
    }
}

#[derive(Debug, Deserialize)]
struct PublicKeyParams {
    #[serde(rename = "keyId")]
    key_id: Option<String>,
}

/// `GET /public-key?keyId=…` — unauthenticated public-half fetch.
async fn public_key_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PublicKeyParams>,
) -> Result<Response, AppError> {
    let key_id = params
        .key_id
        .or_else(|| state.default_key_id.clone())
        .ok_or_else(|| AppError::new(ErrorCode::InvalidRequest, "No key id requested and no default configured"))?;

    let stored = match state.key_store.get(&key_id).await {
        Ok(Some(key)) => key,
        // A malformed id can match nothing; report it the same way
        Ok(None) | Err(KeyStoreError::InvalidKeyId(_)) => {
            return Err(AppError::code(ErrorCode::KeyNotFound));
        }
        Err(e) => return Err(AppError::new(ErrorCode::KeyProcessingError, e.to_string())),
    };

    let public = Signer::extract_public(&stored.armored_private_key)
        .map_err(|e| AppError::new(ErrorCode::KeyProcessingError, e.to_string()))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/pgp-keys")],
        public,
    )
        .into_response())
}

/// `GET /health` — liveness plus dependency probes.
///
/// Always 200; `status` degrades when a dependency probe fails.
async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let key_storage_ok = state.key_store.list().await.is_ok();
    let database_ok = state.audit.ping().await.is_ok();

    let healthy = key_storage_ok && database_ok;
    if !healthy {
        warn!(
            key_storage = key_storage_ok,
            database = database_ok,
            "Health probe degraded"
        );
    }

    Json(json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "checks": {
            "keyStorage": if key_storage_ok { "ok" } else { "failed" },
            "database": if database_ok { "ok" } else { "failed" },
        },
    }))
    .into_response()
}

/// Fallback for unknown routes.
async fn not_found_handler() -> AppError {
    AppError::code(ErrorCode::NotFound)
}
