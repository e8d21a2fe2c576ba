//! Build record and fragment persistence.
//!
//! The orchestration core only ever talks to the [`BuildStore`] and
//! [`FragmentStore`] traits; the bundled [`MemoryStore`] backs a
//! single-process deployment and the tests. Backend-specific failures must
//! surface as [`StoreError`] variants so callers and logs never see
//! provider error codes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::types::{BuildNumber, BuildRecord, BuildStatus, ProjectId, RequestId};

pub mod memory;

pub use memory::MemoryStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Friendly store failure taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Incorrect build store access key or session token")]
    BadCredentials,

    #[error("Incorrect build store secret key")]
    BadSignature,

    #[error("Insufficient credentials to access table {table}")]
    InsufficientPermissions { table: String },

    #[error("Table {table} does not exist")]
    MissingTable { table: String },

    #[error("{0}")]
    Backend(String),
}

/// Persistence operations for build records and configuration.
#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Atomically assigns the next build number for a project. Numbers start
    /// at 1 and every call returns a fresh one, including for rebuilds.
    async fn next_build_number(&self, project: &ProjectId) -> StoreResult<BuildNumber>;

    /// Looks up a build that was already opened under this request id, which
    /// is how retried deliveries are absorbed.
    async fn find_by_request_id(
        &self,
        project: &ProjectId,
        request_id: &RequestId,
    ) -> StoreResult<Option<BuildRecord>>;

    async fn get_build(
        &self,
        project: &ProjectId,
        build_num: BuildNumber,
    ) -> StoreResult<Option<BuildRecord>>;

    async fn put_build(&self, record: &BuildRecord) -> StoreResult<()>;

    /// Sets terminal status and end time on an existing record. Doing it
    /// again with the same values is harmless.
    async fn update_terminal(
        &self,
        project: &ProjectId,
        build_num: BuildNumber,
        status: BuildStatus,
        ended_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Batch config fetch. The result has one entry per requested key, in
    /// request order, with `None` holes for keys that have no stored config.
    async fn get_configs(&self, keys: &[String]) -> StoreResult<Vec<Option<Value>>>;

    /// Reads a single top-level key out of the stored global config.
    async fn get_global_config_value(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Read-merge-writes a partial config into the stored global config,
    /// using the layer merge rule.
    async fn upsert_global_config(&self, partial: &Value) -> StoreResult<()>;
}

/// One stored piece of a partial notification payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Groups fragments of one message; hex SHA-256 of the reassembled
    /// payload.
    pub checksum: String,
    /// 1-based position of this fragment.
    pub page_number: u32,
    pub page_total: u32,
    /// This fragment's slice of the compressed payload.
    pub payload: Vec<u8>,
}

/// Persistence for in-flight partial messages.
#[async_trait]
pub trait FragmentStore: Send + Sync {
    /// Stores a fragment and returns how many distinct pages are now held
    /// for its checksum. Re-delivering an already-stored page does not
    /// change the count.
    async fn put_fragment(&self, fragment: &Fragment) -> StoreResult<u64>;

    async fn count_fragments(&self, checksum: &str) -> StoreResult<u64>;

    /// Returns stored fragments ordered by page number.
    async fn get_fragments(&self, checksum: &str) -> StoreResult<Vec<Fragment>>;

    async fn delete_fragments(&self, checksum: &str) -> StoreResult<()>;
}
