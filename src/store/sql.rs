// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL mirror store.
//!
//! Two tables hold the entire persisted state:
//!
//! ```sql
//! CREATE TABLE mirror (
//!   "baseKey"      TEXT,
//!   "tablename"    TEXT,
//!   "view"         TEXT,
//!   "id"           TEXT,
//!   "mirroredTime" TIMESTAMPTZ,
//!   "createdTime"  TIMESTAMPTZ,
//!   "fields"       JSONB,
//!   PRIMARY KEY ("baseKey", "tablename", "view", "id")
//! );
//! CREATE TABLE mirror_metadata (
//!   "baseKey"      TEXT,
//!   "tablename"    TEXT,
//!   "view"         TEXT,
//!   "mirroredTime" TIMESTAMPTZ,
//!   PRIMARY KEY ("baseKey", "tablename", "view")
//! );
//! ```
//!
//! Column names and types are an external contract: other systems read the
//! mirror directly, so the camelCase identifiers are quoted rather than
//! folded. Every mutation is an upsert keyed by the full composite primary
//! key: concurrent upserts of different keys are safe, and concurrent
//! upserts of the same key are last-write-wins at the relational layer.
//!
//! ## sqlx `Any` driver quirks
//!
//! Postgres is the production dialect and SQLite backs the test suite, both
//! through sqlx's `Any` driver. The driver only moves primitive types, so
//! timestamps cross as text (RFC 3339 on the way in, `::text` rendering on
//! the way out) and `fields` is serialized JSON with a `::jsonb` cast in the
//! Postgres dialect. Text columns may come back as blobs depending on the
//! backend, so reads try `String` first and fall back to `Vec<u8>`.

use chrono::{DateTime, Utc};
use serde_json::Map;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, info};

use super::StoreError;
use crate::record::{parse_timestamp, MirrorRow, Record, UpsertStats, ViewScope};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Rows per multi-row upsert statement; keeps statements under backend
/// packet/parameter limits.
const CHUNK_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    fn from_url(url: &str) -> Result<Self, StoreError> {
        if url.starts_with("sqlite:") {
            Ok(Dialect::Sqlite)
        } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Ok(Dialect::Postgres)
        } else {
            Err(StoreError::UnsupportedUrl(url.to_string()))
        }
    }
}

/// Pooled connection to the mirror tables. Cheap to clone; clones share the
/// underlying pool.
#[derive(Clone)]
pub struct MirrorStore {
    pool: AnyPool,
    dialect: Dialect,
}

impl MirrorStore {
    /// Connect and ensure the schema exists, with startup-mode retry
    /// (fails fast if the connection string is wrong).
    ///
    /// `grant_to` optionally names a Postgres role given ALL on both tables
    /// after creation; ignored for SQLite.
    pub async fn connect(url: &str, grant_to: Option<&str>) -> Result<Self, StoreError> {
        install_drivers();

        let dialect = Dialect::from_url(url)?;

        let pool = retry("mirror_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(url)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, dialect };

        if store.is_sqlite() {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;

        if let Some(role) = grant_to {
            store.grant_access(role).await?;
        }

        Ok(store)
    }

    fn is_sqlite(&self) -> bool {
        self.dialect == Dialect::Sqlite
    }

    /// One positional placeholder, 1-indexed. Postgres wants `$n`, SQLite `?`.
    fn placeholder(&self, n: usize) -> String {
        match self.dialect {
            Dialect::Postgres => format!("${}", n),
            Dialect::Sqlite => "?".to_string(),
        }
    }

    /// WAL mode gives SQLite concurrent reads during writes; `NORMAL` sync
    /// is safe under WAL.
    async fn enable_wal_mode(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let (ts_type, json_type) = match self.dialect {
            Dialect::Postgres => ("TIMESTAMPTZ", "JSONB"),
            Dialect::Sqlite => ("TEXT", "TEXT"),
        };

        let mirror_sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS mirror (
                "baseKey" TEXT NOT NULL,
                "tablename" TEXT NOT NULL,
                "view" TEXT NOT NULL,
                "id" TEXT NOT NULL,
                "mirroredTime" {ts} NOT NULL,
                "createdTime" {ts} NOT NULL,
                "fields" {json},
                PRIMARY KEY ("baseKey", "tablename", "view", "id")
            )
            "#,
            ts = ts_type,
            json = json_type,
        );

        let metadata_sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS mirror_metadata (
                "baseKey" TEXT NOT NULL,
                "tablename" TEXT NOT NULL,
                "view" TEXT NOT NULL,
                "mirroredTime" {ts} NOT NULL,
                PRIMARY KEY ("baseKey", "tablename", "view")
            )
            "#,
            ts = ts_type,
        );

        for sql in [mirror_sql, metadata_sql] {
            retry("mirror_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(&sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))
            })
            .await?;
        }

        Ok(())
    }

    /// Postgres-only: grant table access to a reader/writer role.
    async fn grant_access(&self, role: &str) -> Result<(), StoreError> {
        if self.is_sqlite() {
            return Ok(());
        }
        info!(role, "Granting mirror table access");
        for table in ["mirror", "mirror_metadata"] {
            let sql = format!(r#"GRANT ALL ON {} TO "{}""#, table, role);
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        Ok(())
    }

    /// Total mirror rows across every scope.
    pub async fn count_rows(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM mirror")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let count: i64 = row.try_get("cnt").map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(count as u64)
    }

    /// Batched insert-or-update of `records` under a single `mirrored_time`.
    ///
    /// One shared timestamp per batch gives atomicity-of-observation: a
    /// reader mid-scan sees each row's whole old or new state, never a mixed
    /// mirroredTime within the batch. On conflict the newest fetch wins for
    /// mirroredTime, createdTime, and fields. No-op on empty input.
    pub async fn upsert_batch(
        &self,
        scope: &ViewScope,
        records: &[Record],
        mirrored_time: DateTime<Utc>,
    ) -> Result<UpsertStats, StoreError> {
        if records.is_empty() {
            return Ok(UpsertStats::empty());
        }

        let before = self.count_rows().await?;

        for chunk in records.chunks(CHUNK_SIZE) {
            self.upsert_chunk(scope, chunk, mirrored_time).await?;
        }

        let after = self.count_rows().await?;
        let inserted = (after - before) as usize;

        Ok(UpsertStats {
            total: records.len(),
            inserted,
            updated: records.len() - inserted,
        })
    }

    async fn upsert_chunk(
        &self,
        scope: &ViewScope,
        chunk: &[Record],
        mirrored_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let tuples: Vec<String> = (0..chunk.len())
            .map(|i| {
                let base = i * 7;
                match self.dialect {
                    Dialect::Postgres => format!(
                        "(${}, ${}, ${}, ${}, ${}::timestamptz, ${}::timestamptz, ${}::jsonb)",
                        base + 1,
                        base + 2,
                        base + 3,
                        base + 4,
                        base + 5,
                        base + 6,
                        base + 7
                    ),
                    Dialect::Sqlite => "(?, ?, ?, ?, ?, ?, ?)".to_string(),
                }
            })
            .collect();

        let sql = format!(
            r#"INSERT INTO mirror ("baseKey", "tablename", "view", "id", "mirroredTime", "createdTime", "fields") VALUES {} ON CONFLICT ("baseKey", "tablename", "view", "id") DO UPDATE SET "mirroredTime" = excluded."mirroredTime", "createdTime" = excluded."createdTime", "fields" = excluded."fields""#,
            tuples.join(", ")
        );

        let mirrored = mirrored_time.to_rfc3339();
        let prepared: Vec<(String, String, String)> = chunk
            .iter()
            .map(|rec| {
                (
                    rec.id.clone(),
                    rec.created_time.to_rfc3339(),
                    serde_json::Value::Object(rec.fields.clone()).to_string(),
                )
            })
            .collect();

        retry("mirror_upsert", &RetryConfig::query(), || {
            let sql = sql.clone();
            let prepared = prepared.clone();
            let mirrored = mirrored.clone();
            async move {
                let mut query = sqlx::query(&sql);
                for (id, created, fields_json) in &prepared {
                    query = query
                        .bind(&scope.base_key)
                        .bind(&scope.tablename)
                        .bind(&scope.view)
                        .bind(id)
                        .bind(&mirrored)
                        .bind(created)
                        .bind(fields_json);
                }
                query
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok(())
            }
        })
        .await
    }

    fn select_columns(&self) -> &'static str {
        match self.dialect {
            Dialect::Sqlite => {
                r#""baseKey", "tablename", "view", "id", "mirroredTime", "createdTime", "fields""#
            }
            Dialect::Postgres => {
                r#""baseKey", "tablename", "view", "id", "mirroredTime"::text AS "mirroredTime", "createdTime"::text AS "createdTime", "fields"::text AS "fields""#
            }
        }
    }

    /// Every mirrored row in this scope.
    pub async fn select_view(&self, scope: &ViewScope) -> Result<Vec<MirrorRow>, StoreError> {
        let sql = format!(
            r#"SELECT {} FROM mirror WHERE "baseKey" = {} AND "tablename" = {} AND "view" = {} ORDER BY "id""#,
            self.select_columns(),
            self.placeholder(1),
            self.placeholder(2),
            self.placeholder(3),
        );

        let rows = sqlx::query(&sql)
            .bind(&scope.base_key)
            .bind(&scope.tablename)
            .bind(&scope.view)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        rows.iter().map(Self::parse_row).collect()
    }

    /// At most one row in this scope, optionally pinned to `id`.
    pub async fn find_row(
        &self,
        scope: &ViewScope,
        id: Option<&str>,
    ) -> Result<Option<MirrorRow>, StoreError> {
        let mut sql = format!(
            r#"SELECT {} FROM mirror WHERE "baseKey" = {} AND "tablename" = {} AND "view" = {}"#,
            self.select_columns(),
            self.placeholder(1),
            self.placeholder(2),
            self.placeholder(3),
        );
        if id.is_some() {
            sql.push_str(&format!(r#" AND "id" = {}"#, self.placeholder(4)));
        }
        sql.push_str(" LIMIT 1");

        let mut query = sqlx::query(&sql)
            .bind(&scope.base_key)
            .bind(&scope.tablename)
            .bind(&scope.view);
        if let Some(id) = id {
            query = query.bind(id);
        }

        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        row.as_ref().map(Self::parse_row).transpose()
    }

    /// Last successful mirror timestamp for the scope, if any.
    pub async fn view_mirrored_time(
        &self,
        scope: &ViewScope,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let col = match self.dialect {
            Dialect::Sqlite => r#""mirroredTime""#,
            Dialect::Postgres => r#""mirroredTime"::text AS "mirroredTime""#,
        };
        let sql = format!(
            r#"SELECT {} FROM mirror_metadata WHERE "baseKey" = {} AND "tablename" = {} AND "view" = {}"#,
            col,
            self.placeholder(1),
            self.placeholder(2),
            self.placeholder(3),
        );

        let row = sqlx::query(&sql)
            .bind(&scope.base_key)
            .bind(&scope.tablename)
            .bind(&scope.view)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        match row {
            Some(row) => {
                let text = text_column(&row, "mirroredTime")
                    .ok_or_else(|| StoreError::Malformed("mirror_metadata.mirroredTime".into()))?;
                let t = parse_timestamp(&text)
                    .map_err(|e| StoreError::Malformed(format!("mirroredTime '{}': {}", text, e)))?;
                Ok(Some(t))
            }
            None => Ok(None),
        }
    }

    /// Record that a mirror of this scope completed (or was transitively
    /// proven fresh) at `mirrored_time`.
    pub async fn set_view_mirrored_time(
        &self,
        scope: &ViewScope,
        mirrored_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let ts = match self.dialect {
            Dialect::Postgres => format!("{}::timestamptz", self.placeholder(4)),
            Dialect::Sqlite => self.placeholder(4),
        };
        let sql = format!(
            r#"INSERT INTO mirror_metadata ("baseKey", "tablename", "view", "mirroredTime") VALUES ({}, {}, {}, {}) ON CONFLICT ("baseKey", "tablename", "view") DO UPDATE SET "mirroredTime" = excluded."mirroredTime""#,
            self.placeholder(1),
            self.placeholder(2),
            self.placeholder(3),
            ts,
        );

        debug!(scope = %scope, %mirrored_time, "Setting view mirroredTime");

        retry("mirror_set_metadata", &RetryConfig::query(), || {
            let sql = sql.clone();
            let mirrored = mirrored_time.to_rfc3339();
            async move {
                sqlx::query(&sql)
                    .bind(&scope.base_key)
                    .bind(&scope.tablename)
                    .bind(&scope.view)
                    .bind(&mirrored)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok(())
            }
        })
        .await
    }

    fn parse_row(row: &sqlx::any::AnyRow) -> Result<MirrorRow, StoreError> {
        let text = |name: &str| {
            text_column(row, name).ok_or_else(|| StoreError::Malformed(format!("mirror.{}", name)))
        };

        let mirrored_text = text("mirroredTime")?;
        let created_text = text("createdTime")?;

        let fields: Map<String, serde_json::Value> = match text_column(row, "fields") {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| StoreError::Malformed(format!("mirror.fields: {}", e)))?,
            None => Map::new(),
        };

        Ok(MirrorRow {
            base_key: text("baseKey")?,
            tablename: text("tablename")?,
            view: text("view")?,
            id: text("id")?,
            mirrored_time: parse_timestamp(&mirrored_text)
                .map_err(|e| StoreError::Malformed(format!("mirroredTime '{}': {}", mirrored_text, e)))?,
            created_time: parse_timestamp(&created_text)
                .map_err(|e| StoreError::Malformed(format!("createdTime '{}': {}", created_text, e)))?,
            fields,
        })
    }
}

/// Read a text column as `String`, falling back to UTF-8 bytes; backends
/// disagree on whether TEXT comes back as a string or a blob.
fn text_column(row: &sqlx::any::AnyRow, name: &str) -> Option<String> {
    row.try_get::<String, _>(name).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(name)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}
