//! Signing-pipeline tests: the post-auth stages with fixture claims, plus
//! the pre-auth behavior of `POST /sign` through the router.
//!
//! OIDC verification itself needs a live issuer; its pure pieces are covered
//! in the verifier's own tests. Everything after it runs for real here:
//! rate limiter, key store, signer, audit.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use pgp::composed::{Deserializable, SignedPublicKey, StandaloneSignature};
use pretty_assertions::assert_eq;

use pgp_signer::audit::{AuditAction, AuditStore};
use pgp_signer::oidc::VerifiedClaims;
use pgp_signer::server::request_id;
use pgp_signer::server::sign::sign_authenticated;

use common::{
    body_json, body_text, build_context, build_context_with_rate_limit, generate_test_key, send,
    upload_key, wait_for_audit_rows,
};

const PAYLOAD: &[u8] = b"tree 29ff16c9c14e2652b22f8b78bb08a5a07930c147\nparent 0000\n";

fn github_claims() -> VerifiedClaims {
    VerifiedClaims {
        issuer: common::ISSUER.to_string(),
        subject: "repo:user/repo:ref:refs/heads/main".to_string(),
        issued_at: 1_700_000_000,
        expires_at: 4_102_444_800,
    }
}

// ── pre-auth router behavior ──────────────────────────────────────────

#[tokio::test]
async fn empty_body_is_invalid_request() {
    let ctx = build_context().await;

    let response = send(
        &ctx,
        Request::builder()
            .method("POST")
            .uri("/sign")
            .header(header::AUTHORIZATION, "Bearer whatever")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn missing_bearer_is_auth_missing() {
    let ctx = build_context().await;

    let response = send(
        &ctx,
        Request::builder()
            .method("POST")
            .uri("/sign")
            .body(Body::from("payload"))
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "AUTH_MISSING");
}

#[tokio::test]
async fn malformed_token_is_auth_invalid_without_audit() {
    let ctx = build_context().await;

    let response = send(
        &ctx,
        Request::builder()
            .method("POST")
            .uri("/sign")
            .header(header::AUTHORIZATION, "Bearer not.a.jwt")
            .body(Body::from("payload"))
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "AUTH_INVALID");

    // No authenticated subject yet, so no audit row
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let rows = ctx
        .audit
        .query(&pgp_signer::audit::AuditQuery::default())
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn disallowed_issuer_token_is_auth_invalid() {
    let ctx = build_context().await;

    // Unsigned JWT claiming an issuer outside the allow-list; rejected
    // before any network fetch.
    let header_b64 = base64::Engine::encode(
        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
        br#"{"alg":"RS256","kid":"k1"}"#,
    );
    let payload_b64 = base64::Engine::encode(
        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
        serde_json::json!({
            "iss": "https://evil.example.com",
            "sub": "attacker",
            "exp": 4_102_444_800_u64,
            "iat": 1_700_000_000_u64,
        })
        .to_string(),
    );
    let token = format!("{header_b64}.{payload_b64}.c2ln");

    let response = send(
        &ctx,
        Request::builder()
            .method("POST")
            .uri("/sign")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::from("payload"))
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "AUTH_INVALID");
}

// ── post-auth pipeline ────────────────────────────────────────────────

#[tokio::test]
async fn happy_sign_returns_verifiable_signature_and_audits() {
    let ctx = build_context().await;
    let armored = generate_test_key();
    let key_id = upload_key(&ctx, &armored).await;
    wait_for_audit_rows(&ctx, 1).await;

    let response = request_id::with_request_id("sign-req-1".to_string(), async {
        sign_authenticated(&ctx.state, &github_claims(), Some(key_id.clone()), PAYLOAD).await
    })
    .await
    .expect("sign succeeds");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/pgp-signature"
    );

    let signature = body_text(response).await;
    assert!(signature.starts_with("-----BEGIN PGP SIGNATURE-----"));

    // Verify against the stored key's public half
    let public_armor = pgp_signer::signer::Signer::extract_public(&armored).unwrap();
    let (public, _) = SignedPublicKey::from_string(&public_armor).unwrap();
    let (sig, _) = StandaloneSignature::from_string(&signature).unwrap();
    sig.verify(&public, PAYLOAD).expect("signature verifies");

    // Audit: upload row + success sign row
    let rows = wait_for_audit_rows(&ctx, 2).await;
    let sign_row = rows
        .iter()
        .find(|r| r.action == AuditAction::Sign)
        .expect("sign audit row");
    assert!(sign_row.success);
    assert_eq!(sign_row.request_id, "sign-req-1");
    assert_eq!(sign_row.subject, "repo:user/repo:ref:refs/heads/main");
    assert_eq!(sign_row.key_id, key_id);
}

#[tokio::test]
async fn missing_key_is_404_and_audited() {
    let ctx = build_context().await;

    let err = sign_authenticated(
        &ctx.state,
        &github_claims(),
        Some("FFFFFFFFFFFFFFFF".to_string()),
        PAYLOAD,
    )
    .await
    .expect_err("no key stored");

    assert_eq!(err.code, pgp_signer::ErrorCode::KeyNotFound);
    assert_eq!(err.status, StatusCode::NOT_FOUND);

    let rows = wait_for_audit_rows(&ctx, 1).await;
    assert!(!rows[0].success);
    assert_eq!(rows[0].error_code.as_deref(), Some("KEY_NOT_FOUND"));
}

#[tokio::test]
async fn no_key_id_and_no_default_is_invalid_request() {
    let ctx = build_context().await;

    let err = sign_authenticated(&ctx.state, &github_claims(), None, PAYLOAD)
        .await
        .expect_err("nothing to resolve");

    assert_eq!(err.code, pgp_signer::ErrorCode::InvalidRequest);
}

#[tokio::test]
async fn default_key_id_resolves_when_query_is_absent() {
    let ctx = build_context().await;
    let key_id = upload_key(&ctx, &generate_test_key()).await;

    // Rebuild state with the uploaded key as the configured default
    let state = pgp_signer::server::AppState {
        verifier: std::sync::Arc::clone(&ctx.state.verifier),
        limiter: std::sync::Arc::clone(&ctx.state.limiter),
        key_store: std::sync::Arc::clone(&ctx.state.key_store),
        audit: std::sync::Arc::clone(&ctx.state.audit),
        signer: std::sync::Arc::clone(&ctx.state.signer),
        admin_token: ctx.state.admin_token.clone(),
        passphrase: ctx.state.passphrase.clone(),
        default_key_id: Some(key_id.clone()),
        allowed_origins: Vec::new(),
    };

    let response = sign_authenticated(&state, &github_claims(), None, PAYLOAD)
        .await
        .expect("default key used");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn rate_limit_exhaustion_returns_429_and_audits() {
    // Capacity 2 so the third call trips
    let ctx = build_context_with_rate_limit(60, 2).await;
    let key_id = upload_key(&ctx, &generate_test_key()).await;
    wait_for_audit_rows(&ctx, 1).await;

    for _ in 0..2 {
        sign_authenticated(&ctx.state, &github_claims(), Some(key_id.clone()), PAYLOAD)
            .await
            .expect("within capacity");
    }
    let err = sign_authenticated(&ctx.state, &github_claims(), Some(key_id.clone()), PAYLOAD)
        .await
        .expect_err("over capacity");

    assert_eq!(err.code, pgp_signer::ErrorCode::RateLimited);
    assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);

    // upload + 2 successes + 1 denial
    let rows = wait_for_audit_rows(&ctx, 4).await;
    let denied = rows
        .iter()
        .find(|r| r.error_code.as_deref() == Some("RATE_LIMITED"))
        .expect("denial audited");
    assert_eq!(denied.action, AuditAction::Sign);
    assert!(!denied.success);
}

#[tokio::test]
async fn rate_limit_is_per_identity() {
    let ctx = build_context_with_rate_limit(60, 1).await;
    let key_id = upload_key(&ctx, &generate_test_key()).await;

    let main_branch = github_claims();
    let mut other = github_claims();
    other.subject = "repo:user/repo:ref:refs/heads/dev".to_string();

    sign_authenticated(&ctx.state, &main_branch, Some(key_id.clone()), PAYLOAD)
        .await
        .expect("first identity within capacity");
    sign_authenticated(&ctx.state, &other, Some(key_id.clone()), PAYLOAD)
        .await
        .expect("second identity has its own bucket");

    let err = sign_authenticated(&ctx.state, &main_branch, Some(key_id), PAYLOAD)
        .await
        .expect_err("first identity exhausted");
    assert_eq!(err.code, pgp_signer::ErrorCode::RateLimited);
}
