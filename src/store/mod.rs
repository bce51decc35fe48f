pub mod sql;

use thiserror::Error;

pub use sql::MirrorStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unsupported database url '{0}': expected a postgres:// or sqlite: connection string")]
    UnsupportedUrl(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("malformed mirror row: {0}")]
    Malformed(String),
}
