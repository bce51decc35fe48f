// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the mirror engine.

use thiserror::Error;
use crate::remote::RemoteError;
use crate::store::StoreError;

/// Errors surfaced by the mirror engine.
///
/// Configuration and write-ambiguity errors are fatal and never retried:
/// a write with ambiguous remote state must not be silently repeated.
/// Transient remote *read* failures never appear here; they are recovered
/// into "not found" after a bounded retry.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Missing or malformed construction arguments. Fatal at construction.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A remote insert/update resolved without a record id. The remote
    /// state is ambiguous, so the operation fails hard instead of retrying.
    #[error("remote write to '{tablename}' did not return a record id")]
    RemoteWrite { tablename: String },

    /// The per-base change-summary record could not be obtained even via a
    /// full mirror. Disables orchestrated incremental sync for the base.
    #[error("no change-summary record could be obtained for base '{0}'")]
    ChangeSummaryMissing(String),

    /// A registered table has no count column in the change-summary record.
    #[error("table '{0}' is not tracked by the change-summary record")]
    ChangeSummaryUntracked(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}
