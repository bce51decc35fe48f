//! In-memory remote table service.
//!
//! A faithful in-process implementation of the [`RemoteTable`] contract,
//! used as the test double throughout the integration suite. Call counters
//! let tests assert how many remote round-trips an operation performed,
//! which is the whole point of the mirror.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};

use super::{RemoteClient, RemoteError, RemoteTable, LAST_MODIFIED_FIELD};
use crate::record::Record;

/// One in-memory table. Records live in a [`DashMap`]; ids are sequential
/// (`rec000001`, ...).
pub struct InMemoryTable {
    records: DashMap<String, Record>,
    seq: AtomicU64,
    fail_writes: AtomicBool,
    get_calls: AtomicUsize,
    get_all_calls: AtomicUsize,
    insert_calls: AtomicUsize,
    update_calls: AtomicUsize,
}

impl InMemoryTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            seq: AtomicU64::new(0),
            fail_writes: AtomicBool::new(false),
            get_calls: AtomicUsize::new(0),
            get_all_calls: AtomicUsize::new(0),
            insert_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
        }
    }

    /// Number of records currently in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Place a record directly, bypassing the write path and counters.
    pub fn seed(&self, record: Record) {
        self.records.insert(record.id.clone(), record);
    }

    /// Seed a record from a field bag, stamping id and timestamps the way
    /// the write path would.
    pub fn seed_fields(&self, fields: Map<String, Value>) -> Record {
        let rec = self.make_record(fields, Utc::now());
        self.records.insert(rec.id.clone(), rec.clone());
        rec
    }

    /// Remove a record (simulates the record dropping out of the remote view).
    pub fn remove(&self, id: &str) -> Option<Record> {
        self.records.remove(id).map(|(_, r)| r)
    }

    /// When set, writes resolve "failure-shaped": no error, but an empty id.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn get_all_calls(&self) -> usize {
        self.get_all_calls.load(Ordering::SeqCst)
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    fn make_record(&self, mut fields: Map<String, Value>, now: DateTime<Utc>) -> Record {
        let n = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        fields.insert(LAST_MODIFIED_FIELD.to_string(), Value::String(now.to_rfc3339()));
        Record::new(format!("rec{:06}", n), now, fields)
    }

    /// Parse the one formula shape the mirror emits:
    /// `{Last modified time} >= '<iso>'`.
    fn formula_threshold(formula: &str) -> Option<DateTime<Utc>> {
        let rest = formula.strip_prefix(&format!("{{{}}} >= '", LAST_MODIFIED_FIELD))?;
        let iso = rest.strip_suffix('\'')?;
        DateTime::parse_from_rfc3339(iso).ok().map(|t| t.with_timezone(&Utc))
    }

    fn modified_at_or_after(record: &Record, threshold: DateTime<Utc>) -> bool {
        match record.field_str(LAST_MODIFIED_FIELD) {
            Some(s) => match DateTime::parse_from_rfc3339(s) {
                Ok(t) => t.with_timezone(&Utc) >= threshold,
                // Unparseable stamp: err on the side of returning the record
                Err(_) => true,
            },
            None => true,
        }
    }
}

impl Default for InMemoryTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteTable for InMemoryTable {
    async fn get(&self, id: &str) -> Result<Record, RemoteError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.records
            .get(id)
            .map(|r| r.value().clone())
            .ok_or(RemoteError::NotFound)
    }

    async fn get_all(&self, _view: &str, formula: Option<&str>) -> Result<Vec<Record>, RemoteError> {
        self.get_all_calls.fetch_add(1, Ordering::SeqCst);
        let threshold = formula.and_then(Self::formula_threshold);
        let mut recs: Vec<Record> = self
            .records
            .iter()
            .map(|r| r.value().clone())
            .filter(|r| threshold.map_or(true, |t| Self::modified_at_or_after(r, t)))
            .collect();
        recs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(recs)
    }

    async fn insert(&self, fields: &Map<String, Value>) -> Result<Record, RemoteError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Ok(Record::new("", Utc::now(), Map::new()));
        }
        let rec = self.make_record(fields.clone(), Utc::now());
        self.records.insert(rec.id.clone(), rec.clone());
        Ok(rec)
    }

    async fn update(&self, id: &str, fields: &Map<String, Value>) -> Result<Record, RemoteError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Ok(Record::new("", Utc::now(), Map::new()));
        }
        let mut entry = self.records.get_mut(id).ok_or(RemoteError::NotFound)?;
        let now = Utc::now();
        for (k, v) in fields {
            entry.fields.insert(k.clone(), v.clone());
        }
        entry
            .fields
            .insert(LAST_MODIFIED_FIELD.to_string(), Value::String(now.to_rfc3339()));
        Ok(entry.value().clone())
    }
}

/// In-memory remote service: a set of tables keyed by (base_key, tablename).
/// Tables are created on first access so tests can seed them before or after
/// wiring the client into an engine.
pub struct InMemoryClient {
    tables: DashMap<(String, String), Arc<InMemoryTable>>,
}

impl InMemoryClient {
    #[must_use]
    pub fn new() -> Self {
        Self { tables: DashMap::new() }
    }

    /// Concrete handle for seeding and call-count assertions.
    pub fn table_handle(&self, base_key: &str, tablename: &str) -> Arc<InMemoryTable> {
        self.tables
            .entry((base_key.to_string(), tablename.to_string()))
            .or_insert_with(|| Arc::new(InMemoryTable::new()))
            .clone()
    }
}

impl Default for InMemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteClient for InMemoryClient {
    fn table(&self, base_key: &str, tablename: &str) -> Arc<dyn RemoteTable> {
        self.table_handle(base_key, tablename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_insert_assigns_sequential_ids() {
        let table = InMemoryTable::new();
        let a = table.insert(&fields(json!({"n": 1}))).await.unwrap();
        let b = table.insert(&fields(json!({"n": 2}))).await.unwrap();

        assert_eq!(a.id, "rec000001");
        assert_eq!(b.id, "rec000002");
        assert_eq!(table.insert_calls(), 2);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let table = InMemoryTable::new();
        assert!(matches!(table.get("rec999999").await, Err(RemoteError::NotFound)));
        assert_eq!(table.get_calls(), 1);
    }

    #[tokio::test]
    async fn test_update_merges_fields_and_restamps() {
        let table = InMemoryTable::new();
        let rec = table.insert(&fields(json!({"a": 1, "b": 2}))).await.unwrap();

        let updated = table.update(&rec.id, &fields(json!({"b": 3}))).await.unwrap();
        assert_eq!(updated.fields["a"], 1);
        assert_eq!(updated.fields["b"], 3);
        assert!(updated.field_str(LAST_MODIFIED_FIELD).is_some());
    }

    #[tokio::test]
    async fn test_get_all_formula_filters_by_last_modified() {
        let table = InMemoryTable::new();
        let old = table.insert(&fields(json!({"n": 1}))).await.unwrap();
        let cutoff = Utc::now() + chrono::Duration::milliseconds(5);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let new = table.insert(&fields(json!({"n": 2}))).await.unwrap();

        let formula = format!("{{{}}} >= '{}'", LAST_MODIFIED_FIELD, cutoff.to_rfc3339());
        let recent = table.get_all("Grid view", Some(&formula)).await.unwrap();

        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, new.id);

        let all = table.get_all("Grid view", None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|r| r.id == old.id));
    }

    #[tokio::test]
    async fn test_fail_writes_returns_empty_id() {
        let table = InMemoryTable::new();
        table.set_fail_writes(true);
        let rec = table.insert(&fields(json!({"n": 1}))).await.unwrap();
        assert!(rec.id.is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_client_reuses_table_handles() {
        let client = InMemoryClient::new();
        let a = client.table_handle("appABC", "Widgets");
        let b = client.table_handle("appABC", "Widgets");
        assert!(Arc::ptr_eq(&a, &b));

        let other = client.table_handle("appABC", "Gadgets");
        assert!(!Arc::ptr_eq(&a, &other));
    }
}
