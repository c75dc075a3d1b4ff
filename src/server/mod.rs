//! Server assembly and lifecycle.
//!
//! All per-process services (OIDC verifier, rate limiter, key store, signer,
//! audit store) are built here once and handed to the router via
//! [`AppState`]; handlers never reach for globals.

pub mod admin;
pub mod request_id;
pub mod router;
pub mod sign;

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

pub use router::{AppState, create_router};

use crate::audit::{AuditStoreError, SqliteAuditStore};
use crate::config::{Config, ConfigError};
use crate::keystore::{FileKeyStore, KeyStoreError};
use crate::oidc::OidcVerifier;
use crate::ratelimit::FixedWindowLimiter;
use crate::signer::{DecryptedKeyCache, Signer};

/// Startup/runtime failures.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Key store could not be opened.
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    /// Audit database could not be opened.
    #[error(transparent)]
    Audit(#[from] AuditStoreError),

    /// Bind or serve failure.
    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

/// The signing service.
pub struct Server {
    config: Config,
}

impl Server {
    /// Create a server from validated configuration.
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`] when a required setting is missing.
    pub fn new(config: Config) -> Result<Self, ServerError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Assemble services, bind, and serve until a shutdown signal.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] when a dependency cannot be opened or the
    /// listener cannot bind.
    pub async fn run(self) -> Result<(), ServerError> {
        let config = self.config;

        let keys_path = config.storage.resolved_keys_path();
        let key_store = Arc::new(FileKeyStore::open(&keys_path).await?);

        let audit_url = config.audit.resolved_database_url(&config.storage);
        let audit = Arc::new(SqliteAuditStore::connect(&audit_url).await?);

        let verifier = Arc::new(OidcVerifier::new(
            config.oidc.allowed_issuers.clone(),
            config.oidc.audience.clone(),
            config.oidc.fetch_deadline,
        ));
        let limiter = Arc::new(FixedWindowLimiter::new(
            config.rate_limit.window,
            config.rate_limit.capacity,
        ));
        let signer = Arc::new(Signer::new(DecryptedKeyCache::new(
            config.signing.key_cache_ttl,
        )));

        let state = Arc::new(AppState {
            verifier,
            limiter,
            key_store,
            audit,
            signer,
            admin_token: config.auth.admin_token.clone(),
            passphrase: config.signing.passphrase.clone(),
            default_key_id: config.signing.default_key_id.clone(),
            allowed_origins: config.server.allowed_origins.clone(),
        });

        let app = create_router(state);

        let addr = SocketAddr::new(
            config
                .server
                .host
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid host: {e}")))?,
            config.server.port,
        );
        let listener = TcpListener::bind(addr).await?;

        info!(
            version = env!("CARGO_PKG_VERSION"),
            addr = %addr,
            issuers = config.oidc.allowed_issuers.len(),
            audience = config.oidc.audience.as_deref().unwrap_or("-"),
            rate_window = ?config.rate_limit.window,
            rate_capacity = config.rate_limit.capacity,
            "PGP signing service listening"
        );
        for issuer in &config.oidc.allowed_issuers {
            info!(issuer = %issuer, "Trusting OIDC issuer");
        }
        if config.signing.default_key_id.is_none() {
            warn!("No default KEY_ID configured; sign requests must pass ?keyId=");
        }

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Shutdown complete");
        Ok(())
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
