//! Shared fixtures for integration tests.
#![allow(dead_code)] // each test binary uses a subset

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, header};
use http_body_util::BodyExt;
use pgp::composed::{KeyType, SecretKeyParamsBuilder};
use tower::ServiceExt;

use pgp_signer::audit::{AuditEvent, AuditQuery, AuditStore, SqliteAuditStore};
use pgp_signer::keystore::FileKeyStore;
use pgp_signer::oidc::OidcVerifier;
use pgp_signer::ratelimit::FixedWindowLimiter;
use pgp_signer::server::{AppState, create_router};
use pgp_signer::signer::{DecryptedKeyCache, Signer};

pub const ADMIN_TOKEN: &str = "test-admin-token";
pub const PASSPHRASE: &str = "integration test passphrase";
pub const ISSUER: &str = "https://token.actions.githubusercontent.com";

/// Everything a test needs to drive the service in-process.
pub struct TestContext {
    pub state: Arc<AppState>,
    pub audit: Arc<SqliteAuditStore>,
    _dir: tempfile::TempDir,
}

impl TestContext {
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }
}

/// Build a service over a tempdir key store and in-memory audit database.
pub async fn build_context() -> TestContext {
    build_context_with_rate_limit(60, 30).await
}

pub async fn build_context_with_rate_limit(window_secs: u64, capacity: u32) -> TestContext {
    let dir = tempfile::tempdir().expect("tempdir");
    let key_store = Arc::new(
        FileKeyStore::open(dir.path().join("keys.json"))
            .await
            .expect("key store"),
    );
    let audit = Arc::new(
        SqliteAuditStore::connect("sqlite::memory:")
            .await
            .expect("audit store"),
    );

    let state = Arc::new(AppState {
        verifier: Arc::new(OidcVerifier::new(
            [ISSUER.to_string()],
            None,
            Duration::from_secs(5),
        )),
        limiter: Arc::new(FixedWindowLimiter::new(
            Duration::from_secs(window_secs),
            capacity,
        )),
        key_store,
        audit: Arc::clone(&audit) as Arc<dyn AuditStore>,
        signer: Arc::new(Signer::new(DecryptedKeyCache::default())),
        admin_token: Some(ADMIN_TOKEN.to_string()),
        passphrase: PASSPHRASE.to_string(),
        default_key_id: None,
        allowed_origins: Vec::new(),
    });

    TestContext {
        state,
        audit,
        _dir: dir,
    }
}

/// Generate a passphrase-protected Ed25519 signing key, armored.
pub fn generate_test_key() -> String {
    let params = SecretKeyParamsBuilder::default()
        .key_type(KeyType::EdDSA)
        .can_sign(true)
        .primary_user_id("CI Signer <ci@example.com>".into())
        .passphrase(Some(PASSPHRASE.into()))
        .build()
        .expect("key params");
    let secret_key = params.generate().expect("generate key");
    let signed = secret_key
        .sign(|| PASSPHRASE.to_string())
        .expect("self-sign key");
    signed.to_armored_string(None.into()).expect("armor key")
}

/// Send one request through a fresh router instance.
pub async fn send(ctx: &TestContext, request: Request<Body>) -> Response<Body> {
    ctx.router().oneshot(request).await.expect("infallible")
}

pub fn admin_request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"));
    match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("JSON body")
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("UTF-8 body")
}

/// Upload a key through the admin API and return its derived key id.
pub async fn upload_key(ctx: &TestContext, armored: &str) -> String {
    let response = send(
        ctx,
        admin_request(
            "POST",
            "/admin/keys",
            Some(serde_json::json!({ "armoredPrivateKey": armored })),
        ),
    )
    .await;
    assert_eq!(response.status(), 201, "upload failed");
    body_json(response).await["keyId"]
        .as_str()
        .expect("keyId in response")
        .to_string()
}

/// Detached audit appends land asynchronously; poll until `expect` rows show.
pub async fn wait_for_audit_rows(ctx: &TestContext, expect: usize) -> Vec<AuditEvent> {
    for _ in 0..100 {
        let rows = ctx
            .audit
            .query(&AuditQuery::default())
            .await
            .expect("audit query");
        if rows.len() >= expect {
            return rows;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {expect} audit rows, they never appeared");
}
