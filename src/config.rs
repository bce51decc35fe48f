//! Configuration for the mirror engine.
//!
//! # Example
//!
//! ```
//! use table_mirror::{MirrorConfig, BaseConfig};
//!
//! let mut config = MirrorConfig::default();
//! config.sql_url = "sqlite:mirror.db?mode=rwc".into();
//! config.bases.insert("covid_response".into(), BaseConfig {
//!     base_key: "appK8JGIG94ZXozX".into(),
//!     table_names: vec!["Cameras".into(), "Record counts".into()],
//! });
//!
//! assert_eq!(config.lookback_secs, 3600);
//! assert_eq!(config.record_counts_table, "Record counts");
//! ```

use std::collections::HashMap;
use serde::Deserialize;

/// One remote base: its opaque key and the tables registered for mirroring.
#[derive(Debug, Clone, Deserialize)]
pub struct BaseConfig {
    /// Opaque base identifier used by the remote service (e.g., "appXXXXXXXXXXXX")
    pub base_key: String,
    /// Tables that may be mirrored from this base
    pub table_names: Vec<String>,
}

/// Configuration for [`MirrorEngine`](crate::MirrorEngine).
///
/// All tuning fields have defaults; `sql_url` and at least one base entry
/// are required for the engine to start.
#[derive(Debug, Clone, Deserialize)]
pub struct MirrorConfig {
    /// SQL connection string (e.g., "postgres://user@host/db" or "sqlite:mirror.db?mode=rwc")
    #[serde(default)]
    pub sql_url: String,

    /// Base name -> base config, mirroring the remote service's namespace
    #[serde(default)]
    pub bases: HashMap<String, BaseConfig>,

    /// Safety margin subtracted from the previous mirror time when building
    /// the incremental fetch window. Covers remote clock/ordering skew; the
    /// right value is environment-dependent.
    #[serde(default = "default_lookback_secs")]
    pub lookback_secs: u64,

    /// Attempts for a remote point read before resolving to "not found"
    #[serde(default = "default_remote_read_attempts")]
    pub remote_read_attempts: usize,

    /// Pause between remote point-read attempts, in milliseconds
    #[serde(default = "default_remote_read_delay_ms")]
    pub remote_read_delay_ms: u64,

    /// Name of the per-base change-summary table
    #[serde(default = "default_record_counts_table")]
    pub record_counts_table: String,

    /// View used when reading the change-summary table
    #[serde(default = "default_record_counts_view")]
    pub record_counts_view: String,

    /// View name assumed when none is given to `get_view`
    #[serde(default = "default_view_name")]
    pub default_view: String,

    /// Postgres role to GRANT table access to after schema creation (optional)
    #[serde(default)]
    pub grant_to: Option<String>,
}

fn default_lookback_secs() -> u64 { 3600 }
fn default_remote_read_attempts() -> usize { 2 }
fn default_remote_read_delay_ms() -> u64 { 500 }
fn default_record_counts_table() -> String { "Record counts".to_string() }
fn default_record_counts_view() -> String { "Grid view".to_string() }
fn default_view_name() -> String { "Grid view".to_string() }

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            sql_url: String::new(),
            bases: HashMap::new(),
            lookback_secs: default_lookback_secs(),
            remote_read_attempts: default_remote_read_attempts(),
            remote_read_delay_ms: default_remote_read_delay_ms(),
            record_counts_table: default_record_counts_table(),
            record_counts_view: default_record_counts_view(),
            default_view: default_view_name(),
            grant_to: None,
        }
    }
}
