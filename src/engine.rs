// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mirror engine: connection plumbing and table-handle resolution.
//!
//! The engine owns the store pool and the remote client, and is the single
//! place configuration is validated. View caches and base mirrors borrow
//! both through an `Arc<MirrorEngine>`, so the remote client has an
//! explicit owner instead of living in process-wide state.

use std::sync::Arc;

use tracing::info;

use crate::config::MirrorConfig;
use crate::error::MirrorError;
use crate::remote::{RemoteClient, RemoteTable};
use crate::store::MirrorStore;

pub struct MirrorEngine {
    config: MirrorConfig,
    store: MirrorStore,
    client: Arc<dyn RemoteClient>,
}

impl MirrorEngine {
    /// Validate configuration, connect the store, and ensure the schema.
    ///
    /// Missing or malformed construction arguments are fatal here; a
    /// misconfigured engine must not limp along and fail mid-mirror.
    pub async fn connect(
        config: MirrorConfig,
        client: Arc<dyn RemoteClient>,
    ) -> Result<Arc<Self>, MirrorError> {
        if config.sql_url.is_empty() {
            return Err(MirrorError::Configuration(
                "sql_url is required to create a MirrorEngine".into(),
            ));
        }
        if config.bases.is_empty() {
            return Err(MirrorError::Configuration(
                "at least one base must be configured".into(),
            ));
        }
        for (name, base) in &config.bases {
            if base.base_key.is_empty() {
                return Err(MirrorError::Configuration(format!(
                    "base '{}' has an empty base_key",
                    name
                )));
            }
        }

        let store = MirrorStore::connect(&config.sql_url, config.grant_to.as_deref()).await?;
        info!(bases = config.bases.len(), "Mirror engine connected");

        Ok(Arc::new(Self { config, store, client }))
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn store(&self) -> &MirrorStore {
        &self.store
    }

    /// Resolve a (base name, tablename) registration to the base key and a
    /// remote table handle. Unregistered names are configuration errors:
    /// mirroring a table nobody declared is a deployment mistake, not a
    /// runtime condition.
    pub fn resolve_table(
        &self,
        base_name: &str,
        tablename: &str,
    ) -> Result<(String, Arc<dyn RemoteTable>), MirrorError> {
        let base = self.config.bases.get(base_name).ok_or_else(|| {
            MirrorError::Configuration(format!("no base '{}' in the configured base map", base_name))
        })?;
        if !base.table_names.iter().any(|t| t == tablename) {
            return Err(MirrorError::Configuration(format!(
                "table '{}' is not registered for base '{}'",
                tablename, base_name
            )));
        }
        let table = self.client.table(&base.base_key, tablename);
        Ok((base.base_key.clone(), table))
    }
}

impl std::fmt::Debug for MirrorEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorEngine")
            .field("sql_url", &self.config.sql_url)
            .field("bases", &self.config.bases.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BaseConfig;
    use crate::remote::InMemoryClient;

    fn test_config(sql_url: &str) -> MirrorConfig {
        let mut config = MirrorConfig::default();
        config.sql_url = sql_url.to_string();
        config.bases.insert(
            "main".into(),
            BaseConfig {
                base_key: "appABC".into(),
                table_names: vec!["Widgets".into()],
            },
        );
        config
    }

    fn temp_url(name: &str) -> String {
        let path = std::env::temp_dir().join(format!(
            "mirror_engine_test_{}_{}.db",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        format!("sqlite://{}?mode=rwc", path.display())
    }

    #[tokio::test]
    async fn test_missing_sql_url_is_fatal() {
        let config = MirrorConfig::default();
        let err = MirrorEngine::connect(config, Arc::new(InMemoryClient::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_empty_base_map_is_fatal() {
        let mut config = MirrorConfig::default();
        config.sql_url = "sqlite:unused.db".into();
        let err = MirrorEngine::connect(config, Arc::new(InMemoryClient::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_resolve_table_checks_registration() {
        let engine = MirrorEngine::connect(
            test_config(&temp_url("resolve")),
            Arc::new(InMemoryClient::new()),
        )
        .await
        .unwrap();

        let (base_key, _table) = engine.resolve_table("main", "Widgets").unwrap();
        assert_eq!(base_key, "appABC");

        assert!(matches!(
            engine.resolve_table("main", "Gadgets"),
            Err(MirrorError::Configuration(_))
        ));
        assert!(matches!(
            engine.resolve_table("nope", "Widgets"),
            Err(MirrorError::Configuration(_))
        ));
    }
}
