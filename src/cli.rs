//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// Multi-tenant PGP signing service for OIDC-authenticated workloads
#[derive(Parser, Debug)]
#[command(name = "pgp-signer")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "PGP_SIGNER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "PGP_SIGNER_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "PGP_SIGNER_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "PGP_SIGNER_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "PGP_SIGNER_LOG_FORMAT")]
    pub log_format: Option<String>,
}
