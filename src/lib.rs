// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Table Mirror
//!
//! Mirrors records from a remotely-hosted, rate-limited, eventually-consistent
//! tabular data source into a local relational store (Postgres in production,
//! SQLite in tests), providing fast, query-able, consistent reads while
//! minimizing calls to the remote service.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        BaseMirror                           │
//! │  • One per remote base                                     │
//! │  • Consults the "Record counts" change-summary record      │
//! │  • Per table: full mirror / incremental / short-circuit    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        ViewCache                            │
//! │  • One per (base, table, view)                             │
//! │  • Write-through insert/update, freshness-bounded reads    │
//! │  • In-memory business-key → remote-id index                │
//! └─────────────────────────────────────────────────────────────┘
//!               │                              │
//!               ▼                              ▼
//! ┌───────────────────────────┐  ┌───────────────────────────────┐
//! │       MirrorStore         │  │       RemoteTable             │
//! │  mirror / mirror_metadata │  │  get / get_all / insert /     │
//! │  upsert-on-conflict keyed │  │  update against the remote    │
//! │  by (base, table, view,   │  │  service (trait boundary;     │
//! │  id)                      │  │  client is injected)          │
//! └───────────────────────────┘  └───────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use table_mirror::{BaseConfig, BaseMirror, InMemoryClient, MirrorConfig, MirrorEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), table_mirror::MirrorError> {
//!     let mut config = MirrorConfig::default();
//!     config.sql_url = "postgres://mirror@localhost/mirror".into();
//!     config.bases.insert("covid_response".into(), BaseConfig {
//!         base_key: "appuEuhgDiR5GtOlR".into(),
//!         table_names: vec!["Cameras".into(), "Record counts".into()],
//!     });
//!
//!     // Swap in a real client for the in-memory one in production
//!     let client = Arc::new(InMemoryClient::new());
//!     let engine = MirrorEngine::connect(config, client).await?;
//!
//!     let base = BaseMirror::new(engine, "covid_response")?;
//!     base.add_view("Cameras", "Grid view", Some("Camera ID"))?;
//!
//!     // Full mirror on first call, cheap change-summary checks after
//!     let report = base.incremental_mirror_all(None).await?;
//!     println!("mirrored={} unchanged={}", report.mirrored, report.unchanged);
//!     Ok(())
//! }
//! ```
//!
//! ## Consistency model
//!
//! - Writes are **write-through**: the remote service is updated first and
//!   the mirror reflects the response, so the mirror never leads the source
//!   of truth.
//! - Every batch upsert shares one `mirroredTime`, giving
//!   atomicity-of-observation per batch.
//! - The business-key map is a derived index over the mirror table:
//!   rebuildable at any time, eventually consistent, never a source of truth.
//! - No mutual exclusion is provided for concurrent mirrors of the same
//!   view; multi-writer deployments must wrap `mirror_all` /
//!   `incremental_mirror` in an external advisory lock.
//!
//! ## Modules
//!
//! - [`base`]: [`BaseMirror`] orchestration over a shared change summary
//! - [`view`]: [`ViewCache`] per-(base, table, view) caching
//! - [`store`]: the relational mirror tables
//! - [`remote`]: the remote service trait boundary and in-memory double
//! - [`engine`]: configuration validation and handle resolution
//! - [`resilience`]: retry policies
//! - [`metrics`]: `metrics`-facade instrumentation

pub mod base;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod record;
pub mod remote;
pub mod resilience;
pub mod store;
pub mod view;

pub use base::{BaseMirror, RecordCountsSnapshot, SyncReport};
pub use config::{BaseConfig, MirrorConfig};
pub use engine::MirrorEngine;
pub use error::MirrorError;
pub use record::{Freshness, MirrorRow, Record, UpsertStats, ViewScope};
pub use remote::{InMemoryClient, InMemoryTable, RemoteClient, RemoteError, RemoteTable, LAST_MODIFIED_FIELD};
pub use resilience::retry::RetryConfig;
pub use store::{MirrorStore, StoreError};
pub use view::ViewCache;
