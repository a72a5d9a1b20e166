//! Warehouse bridge boundary: the four operations the lifecycle engine
//! calls against the target warehouse. This crate defines the trait and
//! a mock for tests; the real implementation lives outside this crate.

pub mod mock;

use async_trait::async_trait;
use std::fmt;

/// A staging credential handed out by `CreateFileResource`, attached to
/// a File and later read back from `TokenRepository` for `UploadSlice`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingCredentials {
    pub credentials: String,
    pub expires_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableKey {
    pub project_id: crate::ids::ProjectId,
    pub table_id: crate::ids::TableId,
}

/// Machine-readable bridge error code. `credentialsExpired` is the one
/// code the engine itself acts on; every other code surfaces to
/// `IncrementRetry` unclassified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCode(pub String);

impl ErrorCode {
    pub const CREDENTIALS_EXPIRED: &'static str = "credentialsExpired";
    pub const TABLE_NOT_FOUND: &'static str = "storage.tables.notFound";

    pub fn is_credentials_expired(&self) -> bool {
        self.0 == Self::CREDENTIALS_EXPIRED
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("bridge error {code}: {message}")]
pub struct BridgeError {
    pub code: ErrorCode,
    pub message: String,
}

impl BridgeError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: ErrorCode(code.into()), message: message.into() }
    }
}

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// The warehouse-side operations the engine drives. Implementations are
/// expected to be cheap to clone (an `Arc`-wrapped client) since the
/// lifecycle engine calls them from many concurrent tasks.
#[async_trait]
pub trait WarehouseBridge: Send + Sync {
    /// Issues staging credentials for a new File, called during `Rotate`.
    async fn create_file_resource(&self, sink: &crate::ids::SinkKey) -> BridgeResult<StagingCredentials>;

    /// Uploads one Slice's bytes to staging, called during `slice.upload`.
    async fn upload_slice(&self, credentials: &str, bytes: Vec<u8>) -> BridgeResult<()>;

    /// Ensures the target table exists with the given schema, called
    /// once per distinct table before its first import.
    async fn ensure_table(&self, table: &TableKey, columns: &[String], primary_key: &[String]) -> BridgeResult<()>;

    /// Loads the staged files into the target table, called during
    /// `file.import`.
    async fn load_table(
        &self,
        table: &TableKey,
        staged_files: &[String],
        columns: &[String],
        primary_key: &[String],
    ) -> BridgeResult<()>;
}
