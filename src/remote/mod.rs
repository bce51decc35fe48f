//! Remote table service boundary.
//!
//! The mirror core consumes the remote service through these traits only;
//! the HTTP client itself lives outside this crate. A client object is
//! explicitly constructed and passed into [`MirrorEngine`](crate::MirrorEngine)
//! (dependency injection), never a process-wide singleton, which is also
//! what makes the [`memory`] test double possible.

pub mod memory;

use std::sync::Arc;
use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::record::Record;

pub use memory::{InMemoryClient, InMemoryTable};

/// Field the remote service maintains on every record write; incremental
/// mirrors filter on it with a `{Last modified time} >= '<iso>'` formula.
pub const LAST_MODIFIED_FIELD: &str = "Last modified time";

/// Errors from the remote table service.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// HTTP 404-class failure: the record does not exist (or transiently
    /// appears not to). Point reads recover this into "not found".
    #[error("remote record not found")]
    NotFound,
    /// Any other remote failure (transport, throttling, 5xx).
    #[error("remote service error: {0}")]
    Service(String),
}

/// One table within a base, as exposed by the remote service.
///
/// Each returned record has `{id, createdTime, fields}`. Writes that
/// resolve without error but carry an empty id are "failure-shaped"; the
/// caller checks for that rather than this layer.
#[async_trait]
pub trait RemoteTable: Send + Sync {
    /// Fetch a single record by opaque id.
    async fn get(&self, id: &str) -> Result<Record, RemoteError>;

    /// Fetch every record visible in `view`, optionally filtered by a
    /// remote-side formula expression.
    async fn get_all(&self, view: &str, formula: Option<&str>) -> Result<Vec<Record>, RemoteError>;

    /// Create a record from a field bag.
    async fn insert(&self, fields: &Map<String, Value>) -> Result<Record, RemoteError>;

    /// Update an existing record by id.
    async fn update(&self, id: &str, fields: &Map<String, Value>) -> Result<Record, RemoteError>;
}

/// Resolves table handles within the remote service.
pub trait RemoteClient: Send + Sync {
    /// Handle for `tablename` within the base identified by `base_key`.
    fn table(&self, base_key: &str, tablename: &str) -> Arc<dyn RemoteTable>;
}
