//! Audit trail — append-only event log with paginated, filtered queries.
//!
//! The writer is **fail-closed**: [`AuditStore::append`] propagates storage
//! errors to its caller. The signing pipeline runs the append as a detached
//! background task and downgrades a failure there to a log line, so an
//! unreachable audit database never suppresses a signature that was already
//! produced.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorCode;

/// Default page size for audit queries.
pub const DEFAULT_QUERY_LIMIT: i64 = 100;

/// Maximum page size for audit queries.
pub const MAX_QUERY_LIMIT: i64 = 1000;

/// Auditable actions. Closed set, CHECK-constrained in the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A signing attempt (success or failure).
    Sign,
    /// First upload of a key id.
    KeyUpload,
    /// Upload overwriting an existing key id.
    KeyRotate,
}

impl AuditAction {
    /// Wire/database representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sign => "sign",
            Self::KeyUpload => "key_upload",
            Self::KeyRotate => "key_rotate",
        }
    }

    /// Parse a query-parameter value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sign" => Some(Self::Sign),
            "key_upload" => Some(Self::KeyUpload),
            "key_rotate" => Some(Self::KeyRotate),
            _ => None,
        }
    }
}

/// One append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Row id.
    pub id: Uuid,
    /// Event time.
    pub timestamp: DateTime<Utc>,
    /// Request id the event belongs to.
    pub request_id: String,
    /// What happened.
    pub action: AuditAction,
    /// OIDC issuer of the acting identity (empty for admin actions).
    pub issuer: String,
    /// Subject of the acting identity (admin actions record `admin`).
    pub subject: String,
    /// Key id the event references.
    pub key_id: String,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Error code for failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Free-form structured context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl AuditEvent {
    /// Build a success event.
    #[must_use]
    pub fn success(
        action: AuditAction,
        request_id: impl Into<String>,
        issuer: impl Into<String>,
        subject: impl Into<String>,
        key_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            request_id: request_id.into(),
            action,
            issuer: issuer.into(),
            subject: subject.into(),
            key_id: key_id.into(),
            success: true,
            error_code: None,
            metadata: None,
        }
    }

    /// Build a failure event carrying the wire error code.
    #[must_use]
    pub fn failure(
        action: AuditAction,
        request_id: impl Into<String>,
        issuer: impl Into<String>,
        subject: impl Into<String>,
        key_id: impl Into<String>,
        code: ErrorCode,
    ) -> Self {
        let mut event = Self::success(action, request_id, issuer, subject, key_id);
        event.success = false;
        event.error_code = Some(code.as_str().to_string());
        event
    }

    /// Attach structured metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Validated audit query.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditQuery {
    /// Page size, 1..=1000.
    pub limit: i64,
    /// Row offset, ≥ 0.
    pub offset: i64,
    /// Restrict to one action.
    pub action: Option<AuditAction>,
    /// Case-sensitive contains-match on subject (matched literally).
    pub subject: Option<String>,
    /// Inclusive lower bound on timestamp.
    pub start_date: Option<DateTime<Utc>>,
    /// Inclusive upper bound on timestamp.
    pub end_date: Option<DateTime<Utc>>,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_QUERY_LIMIT,
            offset: 0,
            action: None,
            subject: None,
            start_date: None,
            end_date: None,
        }
    }
}

/// Raw query parameters as they arrive on `/admin/audit`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditQueryParams {
    /// Page size.
    pub limit: Option<i64>,
    /// Row offset.
    pub offset: Option<i64>,
    /// Action filter.
    pub action: Option<String>,
    /// Subject contains-filter.
    pub subject: Option<String>,
    /// RFC3339 lower bound.
    pub start_date: Option<String>,
    /// RFC3339 upper bound.
    pub end_date: Option<String>,
}

/// Parameter-validation failures; all surface as 400 `INVALID_REQUEST`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuditQueryError {
    /// Limit outside 1..=1000.
    #[error("limit must be between 1 and {MAX_QUERY_LIMIT}")]
    LimitOutOfRange,

    /// Negative offset.
    #[error("offset must be non-negative")]
    NegativeOffset,

    /// Action not in the closed set.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// Unparseable RFC3339 date bound.
    #[error("invalid {field} date: {value}")]
    InvalidDate {
        /// Which bound failed.
        field: &'static str,
        /// The offending value.
        value: String,
    },
}

impl AuditQueryParams {
    /// Validate ranges and shapes into an [`AuditQuery`].
    ///
    /// # Errors
    ///
    /// [`AuditQueryError`] naming the first invalid parameter.
    pub fn validate(self) -> Result<AuditQuery, AuditQueryError> {
        let limit = self.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        if !(1..=MAX_QUERY_LIMIT).contains(&limit) {
            return Err(AuditQueryError::LimitOutOfRange);
        }

        let offset = self.offset.unwrap_or(0);
        if offset < 0 {
            return Err(AuditQueryError::NegativeOffset);
        }

        let action = match self.action {
            None => None,
            Some(raw) => Some(
                AuditAction::parse(&raw).ok_or_else(|| AuditQueryError::UnknownAction(raw))?,
            ),
        };

        let start_date = parse_bound(self.start_date, "start")?;
        let end_date = parse_bound(self.end_date, "end")?;

        Ok(AuditQuery {
            limit,
            offset,
            action,
            subject: self.subject,
            start_date,
            end_date,
        })
    }
}

fn parse_bound(
    value: Option<String>,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, AuditQueryError> {
    match value {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| AuditQueryError::InvalidDate { field, value: raw }),
    }
}

/// Escape `LIKE` metacharacters so user input matches literally.
///
/// The escape character itself must be escaped first.
#[must_use]
pub fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Storage-level audit failures.
#[derive(Debug, Error)]
pub enum AuditStoreError {
    /// Database failure.
    #[error("Audit database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A persisted row could not be decoded.
    #[error("Corrupt audit row: {0}")]
    Corrupt(String),
}

/// Audit persistence interface.
#[async_trait]
pub trait AuditStore: Send + Sync + 'static {
    /// Insert one row. Fail-closed: the error propagates.
    async fn append(&self, event: AuditEvent) -> Result<(), AuditStoreError>;

    /// Query rows ordered by timestamp descending.
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>, AuditStoreError>;

    /// Liveness probe for the health endpoint.
    async fn ping(&self) -> Result<(), AuditStoreError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS audit_logs (
    id          TEXT PRIMARY KEY,
    timestamp   TEXT NOT NULL,
    request_id  TEXT NOT NULL,
    action      TEXT NOT NULL CHECK (action IN ('sign', 'key_upload', 'key_rotate')),
    issuer      TEXT NOT NULL,
    subject     TEXT NOT NULL,
    key_id      TEXT NOT NULL,
    success     INTEGER NOT NULL,
    error_code  TEXT,
    metadata    TEXT
);
CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_logs (timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_logs (action);
CREATE INDEX IF NOT EXISTS idx_audit_subject ON audit_logs (subject);
CREATE INDEX IF NOT EXISTS idx_audit_request_id ON audit_logs (request_id);
CREATE INDEX IF NOT EXISTS idx_audit_key_id ON audit_logs (key_id);
CREATE INDEX IF NOT EXISTS idx_audit_action_timestamp ON audit_logs (action, timestamp DESC);
";

/// SQLite-backed audit store.
pub struct SqliteAuditStore {
    pool: SqlitePool,
}

impl SqliteAuditStore {
    /// Connect to `url` (e.g. `sqlite:audit.db?mode=rwc` or
    /// `sqlite::memory:`) and ensure the schema exists.
    ///
    /// # Errors
    ///
    /// [`AuditStoreError::Database`] on connect or migration failure.
    pub async fn connect(url: &str) -> Result<Self, AuditStoreError> {
        // An in-memory database lives inside its single connection; pooling
        // more than one would shard the data.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(url)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn append(&self, event: AuditEvent) -> Result<(), AuditStoreError> {
        let metadata = event
            .metadata
            .as_ref()
            .map(serde_json::Value::to_string);

        sqlx::query(
            "INSERT INTO audit_logs \
             (id, timestamp, request_id, action, issuer, subject, key_id, success, error_code, metadata) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.id.to_string())
        .bind(event.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(&event.request_id)
        .bind(event.action.as_str())
        .bind(&event.issuer)
        .bind(&event.subject)
        .bind(&event.key_id)
        .bind(i64::from(event.success))
        .bind(&event.error_code)
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>, AuditStoreError> {
        let mut sql = String::from(
            "SELECT id, timestamp, request_id, action, issuer, subject, key_id, \
             success, error_code, metadata FROM audit_logs WHERE 1 = 1",
        );
        if query.action.is_some() {
            sql.push_str(" AND action = ?");
        }
        if query.subject.is_some() {
            sql.push_str(" AND subject LIKE ? ESCAPE '\\'");
        }
        if query.start_date.is_some() {
            sql.push_str(" AND timestamp >= ?");
        }
        if query.end_date.is_some() {
            sql.push_str(" AND timestamp <= ?");
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT ? OFFSET ?");

        let mut q = sqlx::query(&sql);
        if let Some(action) = query.action {
            q = q.bind(action.as_str());
        }
        if let Some(ref subject) = query.subject {
            q = q.bind(format!("%{}%", escape_like(subject)));
        }
        if let Some(start) = query.start_date {
            q = q.bind(start.to_rfc3339_opts(SecondsFormat::Micros, true));
        }
        if let Some(end) = query.end_date {
            q = q.bind(end.to_rfc3339_opts(SecondsFormat::Micros, true));
        }
        q = q.bind(query.limit).bind(query.offset);

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn ping(&self) -> Result<(), AuditStoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<AuditEvent, AuditStoreError> {
    let id: String = row.try_get("id")?;
    let timestamp: String = row.try_get("timestamp")?;
    let action: String = row.try_get("action")?;
    let metadata: Option<String> = row.try_get("metadata")?;

    Ok(AuditEvent {
        id: Uuid::parse_str(&id).map_err(|e| AuditStoreError::Corrupt(format!("id: {e}")))?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| AuditStoreError::Corrupt(format!("timestamp: {e}")))?
            .with_timezone(&Utc),
        request_id: row.try_get("request_id")?,
        action: AuditAction::parse(&action)
            .ok_or_else(|| AuditStoreError::Corrupt(format!("action: {action}")))?,
        issuer: row.try_get("issuer")?,
        subject: row.try_get("subject")?,
        key_id: row.try_get("key_id")?,
        success: row.try_get::<i64, _>("success")? != 0,
        error_code: row.try_get("error_code")?,
        metadata: metadata
            .map(|m| {
                serde_json::from_str(&m)
                    .map_err(|e| AuditStoreError::Corrupt(format!("metadata: {e}")))
            })
            .transpose()?,
    })
}
