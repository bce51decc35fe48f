// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Base mirror: orchestrates the view caches of one remote base.
//!
//! The base is expected to carry a change-summary table ("Record counts"):
//! a single record whose columns aggregate, per underlying table, a row
//! count, a last-modified timestamp, and the list of currently-active
//! remote ids, in columns named `"{tablename} count"`,
//! `"{tablename} last modified"` and `"{tablename} links"`. Consulting that one record tells us, per
//! table, whether a remote scan is necessary at all, which is what makes
//! [`BaseMirror::incremental_mirror_all`] cheap when nothing changed.
//!
//! Per-view state machine: never mirrored → `mirror_all`; mirrored and the
//! summary says changed → `incremental_mirror`; mirrored and unchanged →
//! advance the stored mirroredTime to the summary's own mirror time (fresh
//! by transitivity, zero remote calls) and rebuild the key map from local
//! data.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::engine::MirrorEngine;
use crate::error::MirrorError;
use crate::metrics;
use crate::record::{parse_timestamp, Freshness, MirrorRow};
use crate::view::ViewCache;

/// What the change-summary record knew about one table, as of the moment
/// the summary itself was mirrored. Only trustworthy as of
/// `rc_mirrored_time`; refresh the summary before using it to judge a
/// newly-stale table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordCountsSnapshot {
    /// When the change-summary record this was parsed from was mirrored
    pub rc_mirrored_time: DateTime<Utc>,
    /// When the table's remote content last changed
    pub last_modified: DateTime<Utc>,
    pub count: i64,
    /// Remote ids currently active in the table
    pub links: Vec<String>,
}

impl RecordCountsSnapshot {
    /// Parse one table's columns out of the change-summary record.
    ///
    /// A table with no count column is not tracked by the summary at all;
    /// that is fatal for the table. A zero count (or a count with no
    /// usable last-modified value) synthesizes `last_modified` one second
    /// before the summary's own mirror time, so an empty table always
    /// compares as "not modified since" any real mirror.
    pub fn parse(rc: &MirrorRow, tablename: &str) -> Result<Self, MirrorError> {
        let count_field = format!("{} count", tablename);
        let last_mod_field = format!("{} last modified", tablename);
        let links_field = format!("{} links", tablename);

        let Some(count) = rc.fields.get(&count_field).and_then(Value::as_i64) else {
            return Err(MirrorError::ChangeSummaryUntracked(tablename.to_string()));
        };

        if count > 0 {
            if let Some(last_modified) = rc
                .field_str(&last_mod_field)
                .and_then(|s| parse_timestamp(s).ok())
            {
                let links = rc
                    .fields
                    .get(&links_field)
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                return Ok(Self {
                    rc_mirrored_time: rc.mirrored_time,
                    last_modified,
                    count,
                    links,
                });
            }
        }

        Ok(Self {
            rc_mirrored_time: rc.mirrored_time,
            last_modified: rc.mirrored_time - Duration::seconds(1),
            count: 0,
            links: Vec::new(),
        })
    }
}

/// Outcome of one [`BaseMirror::incremental_mirror_all`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    /// Views fully mirrored for the first time
    pub mirrored: usize,
    /// Views incrementally refreshed
    pub refreshed: usize,
    /// Views proven fresh without a remote fetch
    pub unchanged: usize,
    /// Views (or whole tables) that failed; the rest proceeded
    pub failed: usize,
}

pub struct BaseMirror {
    base_name: String,
    engine: Arc<MirrorEngine>,
    /// tablename → viewname → cache
    views: RwLock<HashMap<String, HashMap<String, Arc<ViewCache>>>>,
    /// tablename → last parsed change-summary state
    metadata: RwLock<HashMap<String, RecordCountsSnapshot>>,
    record_count_view: ViewCache,
    rc_rec: RwLock<Option<MirrorRow>>,
    created_at: DateTime<Utc>,
}

impl BaseMirror {
    pub fn new(engine: Arc<MirrorEngine>, base_name: &str) -> Result<Self, MirrorError> {
        let config = engine.config();
        let record_count_view = ViewCache::new(
            &engine,
            base_name,
            &config.record_counts_table,
            &config.record_counts_view,
            None,
        )?;

        Ok(Self {
            base_name: base_name.to_string(),
            engine,
            views: RwLock::new(HashMap::new()),
            metadata: RwLock::new(HashMap::new()),
            record_count_view,
            rc_rec: RwLock::new(None),
            created_at: Utc::now(),
        })
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Register a view cache for `tablename`/`viewname` under this base.
    pub fn add_view(
        &self,
        tablename: &str,
        viewname: &str,
        key_col: Option<&str>,
    ) -> Result<Arc<ViewCache>, MirrorError> {
        let view = Arc::new(ViewCache::new(
            &self.engine,
            &self.base_name,
            tablename,
            viewname,
            key_col,
        )?);
        self.views
            .write()
            .entry(tablename.to_string())
            .or_default()
            .insert(viewname.to_string(), view.clone());
        Ok(view)
    }

    /// Look up a registered view cache; `viewname` defaults to the
    /// configured default view name.
    pub fn get_view(&self, tablename: &str, viewname: Option<&str>) -> Option<Arc<ViewCache>> {
        let default_view = &self.engine.config().default_view;
        let viewname = viewname.unwrap_or(default_view);
        let found = self
            .views
            .read()
            .get(tablename)
            .and_then(|by_view| by_view.get(viewname))
            .cloned();
        if found.is_none() {
            warn!(tablename, viewname, "get_view found no registered view");
        }
        found
    }

    /// Last parsed change-summary state for a table, if any.
    pub fn snapshot_for(&self, tablename: &str) -> Option<RecordCountsSnapshot> {
        self.metadata.read().get(tablename).cloned()
    }

    /// The change-summary record, re-fetched if the cached copy is older
    /// than `freshness`.
    ///
    /// The default window is the smaller of one minute and the orchestrator's
    /// own age, which biases toward a forced refresh shortly after startup.
    /// Failing to obtain the record at all disables orchestrated sync for
    /// the base, so that is a hard error.
    pub async fn record_counts(
        &self,
        freshness: Option<Freshness>,
    ) -> Result<MirrorRow, MirrorError> {
        let now = Utc::now();
        let bound = freshness
            .unwrap_or_else(|| Freshness::MaxAge(Duration::minutes(1).min(now - self.created_at)));

        let cached = self.rc_rec.read().clone();

        if let Some(rc) = cached {
            if bound.is_fresh(rc.mirrored_time, now) {
                debug!(
                    base = %self.base_name,
                    age_secs = (now - rc.mirrored_time).num_seconds(),
                    "Change summary cache is fresh"
                );
                return Ok(rc);
            }
            debug!(base = %self.base_name, id = %rc.id, "Refreshing change summary record");
            if let Some(row) = self
                .record_count_view
                .find_one_or_none(None, Some(bound))
                .await?
            {
                *self.rc_rec.write() = Some(row.clone());
                return Ok(row);
            }
            return Err(MirrorError::ChangeSummaryMissing(self.base_name.clone()));
        }

        // Nothing cached yet: try the mirror (with remote fallback), then a
        // full mirror of the summary table for a cold store.
        if let Some(row) = self
            .record_count_view
            .find_one_or_none(None, Some(bound))
            .await?
        {
            *self.rc_rec.write() = Some(row.clone());
            return Ok(row);
        }

        info!(base = %self.base_name, "Change summary not mirrored yet, mirroring all");
        let all = self.record_count_view.mirror_all().await?;
        if let Some(row) = all.into_values().next() {
            *self.rc_rec.write() = Some(row.clone());
            return Ok(row);
        }

        Err(MirrorError::ChangeSummaryMissing(self.base_name.clone()))
    }

    /// Parse and cache the change-summary state for one table, from the
    /// currently-cached summary record.
    pub fn update_rc_metadata_for_view(
        &self,
        tablename: &str,
    ) -> Result<RecordCountsSnapshot, MirrorError> {
        let rc = self
            .rc_rec
            .read()
            .clone()
            .ok_or_else(|| MirrorError::ChangeSummaryMissing(self.base_name.clone()))?;

        let snapshot = RecordCountsSnapshot::parse(&rc, tablename)?;
        self.metadata
            .write()
            .insert(tablename.to_string(), snapshot.clone());
        Ok(snapshot)
    }

    /// Top-level sync entrypoint: refresh the change summary, then bring
    /// every registered view up to date with as few remote calls as the
    /// summary allows.
    ///
    /// A failure obtaining the change-summary record aborts the call; a
    /// failure in one table or view is logged, counted in the report, and
    /// does not quarantine the others.
    pub async fn incremental_mirror_all(
        &self,
        freshness: Option<Freshness>,
    ) -> Result<SyncReport, MirrorError> {
        let rc = self.record_counts(freshness).await?;
        let rc_mirrored_time = rc.mirrored_time;

        // Snapshot the registry so no lock is held across awaits
        let tables: Vec<(String, Vec<Arc<ViewCache>>)> = self
            .views
            .read()
            .iter()
            .map(|(t, by_view)| (t.clone(), by_view.values().cloned().collect()))
            .collect();

        let mut report = SyncReport::default();

        for (tablename, views) in tables {
            let snapshot = match self.update_rc_metadata_for_view(&tablename) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    error!(tablename, %err, "Skipping table: change summary state unavailable");
                    report.failed += views.len();
                    continue;
                }
            };

            for view in views {
                match self
                    .sync_view(&view, &tablename, &snapshot, rc_mirrored_time, &mut report)
                    .await
                {
                    Ok(()) => {}
                    Err(err) => {
                        error!(view = %view.composite_name(), %err, "View sync failed");
                        report.failed += 1;
                    }
                }
            }
        }

        info!(
            base = %self.base_name,
            mirrored = report.mirrored,
            refreshed = report.refreshed,
            unchanged = report.unchanged,
            failed = report.failed,
            "Incremental mirror pass complete"
        );
        Ok(report)
    }

    async fn sync_view(
        &self,
        view: &ViewCache,
        tablename: &str,
        snapshot: &RecordCountsSnapshot,
        rc_mirrored_time: DateTime<Utc>,
        report: &mut SyncReport,
    ) -> Result<(), MirrorError> {
        let prior = view.mirrored_time().await?;

        let Some(prior) = prior else {
            info!(view = %view.composite_name(), "Initializing view for the first time");
            let recs = view.mirror_all().await?;
            info!(view = %view.composite_name(), records = recs.len(), "Initial mirror done");
            report.mirrored += 1;
            return Ok(());
        };

        if prior < snapshot.last_modified {
            info!(
                view = %view.composite_name(),
                last_modified = %snapshot.last_modified,
                mirrored = %prior,
                active = snapshot.links.len(),
                "Remote content changed since last mirror, updating"
            );
            view.incremental_mirror(false, Some(&snapshot.links)).await?;
            report.refreshed += 1;
        } else {
            // Unchanged, confirmed as of the summary's own mirror time:
            // advance the stored timestamp and rebuild the key map from
            // local data alone. Zero remote calls.
            view.advance_mirrored_time(rc_mirrored_time).await?;
            let keys = view.update_key_map_from_store(Some(&snapshot.links)).await?;
            metrics::record_short_circuit(tablename);
            info!(
                view = %view.composite_name(),
                last_modified = %snapshot.last_modified,
                mirrored = %prior,
                advanced_to = %rc_mirrored_time,
                keys,
                "Unchanged since last mirror, advanced timestamp only"
            );
            report.unchanged += 1;
        }

        Ok(())
    }
}
