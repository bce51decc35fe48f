//! Record data structures.
//!
//! A [`Record`] is the unit returned by the remote table service; a
//! [`MirrorRow`] is the same record stamped with the mirror scoping columns
//! and the time it was fetched. `fields` is a semantically opaque ordered
//! string-to-JSON map, preserved verbatim through the mirror round-trip.
//! The remote schema is caller-defined per base, so no fixed schema is
//! imposed on it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A record as returned by the remote table service.
///
/// # Example
///
/// ```
/// use table_mirror::Record;
/// use serde_json::json;
///
/// let rec: Record = serde_json::from_value(json!({
///     "id": "rec012345",
///     "createdTime": "2021-01-09T12:00:00.000Z",
///     "fields": {"email": "a@x.com", "v": 1}
/// })).unwrap();
///
/// assert_eq!(rec.id, "rec012345");
/// assert_eq!(rec.fields["v"], 1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Opaque remote record id
    pub id: String,
    /// Creation time reported by the remote service
    #[serde(rename = "createdTime")]
    pub created_time: DateTime<Utc>,
    /// Caller-defined field bag, kept verbatim
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>, created_time: DateTime<Utc>, fields: Map<String, Value>) -> Self {
        Self { id: id.into(), created_time, fields }
    }

    /// Field lookup that only returns string values.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

/// The (baseKey, tablename, view) tuple that scopes every mirror-table
/// operation. Views are independent namespaces: the same remote id may be
/// mirrored once per view it was fetched through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViewScope {
    pub base_key: String,
    pub tablename: String,
    pub view: String,
}

impl std::fmt::Display for ViewScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.base_key, self.tablename, self.view)
    }
}

/// A mirrored record: one row of the `mirror` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorRow {
    pub base_key: String,
    pub tablename: String,
    pub view: String,
    pub id: String,
    /// When this row was last fetched from the remote service.
    /// Monotonically non-decreasing per key: the upsert always supplies the
    /// newest fetch time.
    pub mirrored_time: DateTime<Utc>,
    pub created_time: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

impl MirrorRow {
    /// Stamp a remote record with view scoping and a mirror timestamp.
    pub fn stamp(scope: &ViewScope, record: &Record, mirrored_time: DateTime<Utc>) -> Self {
        Self {
            base_key: scope.base_key.clone(),
            tablename: scope.tablename.clone(),
            view: scope.view.clone(),
            id: record.id.clone(),
            mirrored_time,
            created_time: record.created_time,
            fields: record.fields.clone(),
        }
    }

    /// The remote-shaped record, without mirror scoping.
    pub fn record(&self) -> Record {
        Record {
            id: self.id.clone(),
            created_time: self.created_time,
            fields: self.fields.clone(),
        }
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

/// Freshness bound for point reads: either a maximum age relative to now,
/// or an absolute instant the data must have been mirrored at or after.
#[derive(Debug, Clone, Copy)]
pub enum Freshness {
    /// Fresh if `now - mirrored_time <= max_age`
    MaxAge(Duration),
    /// Fresh if mirrored at or after the instant; converted to the
    /// equivalent max age via `now - instant`
    Since(DateTime<Utc>),
}

impl Freshness {
    /// Resolve to a maximum age relative to `now`.
    pub fn max_age(&self, now: DateTime<Utc>) -> Duration {
        match self {
            Freshness::MaxAge(d) => *d,
            Freshness::Since(t) => now - *t,
        }
    }

    /// Whether data mirrored at `mirrored` still satisfies this bound at
    /// `now`. Monotonic in the bound: loosening it never turns fresh data
    /// stale.
    pub fn is_fresh(&self, mirrored: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - mirrored <= self.max_age(now)
    }
}

/// Outcome of a batch upsert, derived by diffing mirror row counts around
/// the statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertStats {
    pub total: usize,
    pub inserted: usize,
    pub updated: usize,
}

impl UpsertStats {
    pub fn empty() -> Self {
        Self { total: 0, inserted: 0, updated: 0 }
    }
}

/// Parse a timestamp as stored by the SQL layer.
///
/// SQLite hands back the RFC 3339 text we wrote; Postgres' `::text`
/// rendering is "YYYY-MM-DD HH:MM:SS[.ffffff]+TZ" with a possibly
/// minute-less offset, so fall back to that shape.
pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z").map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_record_wire_shape() {
        let rec: Record = serde_json::from_value(json!({
            "id": "rec000001",
            "createdTime": "2021-01-09T12:00:00Z",
            "fields": {"name": "X"}
        }))
        .unwrap();

        assert_eq!(rec.id, "rec000001");
        assert_eq!(rec.field_str("name"), Some("X"));

        // Round-trips with the wire field name
        let wire = serde_json::to_value(&rec).unwrap();
        assert!(wire.get("createdTime").is_some());
        assert!(wire.get("created_time").is_none());
    }

    #[test]
    fn test_record_missing_fields_defaults_empty() {
        let rec: Record = serde_json::from_value(json!({
            "id": "rec000002",
            "createdTime": "2021-01-09T12:00:00Z"
        }))
        .unwrap();
        assert!(rec.fields.is_empty());
    }

    #[test]
    fn test_stamp_and_unstamp() {
        let scope = ViewScope {
            base_key: "appABC".into(),
            tablename: "Widgets".into(),
            view: "Grid view".into(),
        };
        let now = Utc::now();
        let rec = Record::new("rec1", now, fields(json!({"a": 1, "b": [1, 2]})));

        let row = MirrorRow::stamp(&scope, &rec, now);
        assert_eq!(row.base_key, "appABC");
        assert_eq!(row.view, "Grid view");
        assert_eq!(row.mirrored_time, now);

        let back = row.record();
        assert_eq!(back.id, rec.id);
        assert_eq!(back.fields, rec.fields);
    }

    #[test]
    fn test_freshness_resolution() {
        let now = Utc::now();

        let rel = Freshness::MaxAge(Duration::minutes(5));
        assert_eq!(rel.max_age(now), Duration::minutes(5));

        let abs = Freshness::Since(now - Duration::minutes(7));
        assert_eq!(abs.max_age(now), Duration::minutes(7));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        // RFC 3339 as written by the store
        let t = parse_timestamp("2021-01-09T12:00:00.500+00:00").unwrap();
        assert_eq!(t.timestamp_millis() % 1000, 500);

        // Postgres ::text shapes
        assert!(parse_timestamp("2021-01-09 12:00:00+00").is_ok());
        assert!(parse_timestamp("2021-01-09 12:00:00.123456+00").is_ok());
        assert!(parse_timestamp("2021-01-09 07:00:00-05:00").is_ok());

        assert!(parse_timestamp("not a timestamp").is_err());
    }

    #[test]
    fn test_view_scope_display() {
        let scope = ViewScope {
            base_key: "appABC".into(),
            tablename: "Widgets".into(),
            view: "Grid view".into(),
        };
        assert_eq!(scope.to_string(), "appABC:Widgets:Grid view");
    }
}
