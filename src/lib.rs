//! PGP Signing Service
//!
//! Multi-tenant signing service producing detached armored OpenPGP
//! signatures over arbitrary payloads (typically git commit objects) for
//! workload identities authenticated through OIDC.
//!
//! # Pipeline
//!
//! `POST /sign` → request-id middleware → OIDC verification (JWKS cached,
//! SSRF-guarded discovery) → per-identity rate limit → key store fetch →
//! decrypted-key cache / signer → detached audit append.
//!
//! # Operational surface
//!
//! - Admin key management (`/admin/keys*`) behind a constant-time bearer check
//! - Audit querying (`/admin/audit`) over a SQL store
//! - Public-half fetch (`/public-key`) and `/health` without authentication

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod keystore;
pub mod oidc;
pub mod ratelimit;
pub mod security;
pub mod server;
pub mod signer;

pub use error::{AppError, ErrorCode, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Currently infallible; kept fallible for parity with future sinks.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
