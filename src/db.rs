// 💾 Canonical Store - one SQLite table per record family
// Rows are keyed by natural key; a changed row is copied to history before it is replaced

use crate::router::{FieldType, ProjectedRow, RecordFamily};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

pub const LOADER_ACTOR: &str = "loader";

/// Columns every family table carries besides its own fields
const BOOKKEEPING_DDL: &str = "origin TEXT,
            extra TEXT,
            content_hash TEXT NOT NULL,
            source_ref TEXT NOT NULL,
            ingested_at TEXT NOT NULL,
            confidence REAL NOT NULL,
            validation_status TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1";

// ============================================================================
// EVENTS
// ============================================================================

/// Event for the in-store audit trail
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn open_database(path: &Path, families: &[RecordFamily]) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    setup_database(&conn, families)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection, families: &[RecordFamily]) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    for family in families {
        conn.execute(&family_table_sql(family), [])
            .with_context(|| format!("Failed to create table {}", family.table))?;
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_date ON {table}(date)",
                table = family.table
            ),
            [],
        )?;
    }

    // ==========================================================================
    // History Table (superseded rows, never deleted)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS record_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            natural_key TEXT NOT NULL,
            version INTEGER NOT NULL,
            row_data TEXT NOT NULL,
            superseded_by TEXT NOT NULL,
            superseded_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_history_key ON record_history(table_name, natural_key)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
        [],
    )?;

    Ok(())
}

fn family_table_sql(family: &RecordFamily) -> String {
    let columns: Vec<String> = family
        .fields()
        .map(|f| {
            let not_null = if family.natural_key.contains(&f.name) { " NOT NULL" } else { "" };
            format!("{} {}{}", f.name, f.field_type.sql_type(), not_null)
        })
        .collect();

    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            {},
            {},
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            UNIQUE({})
        )",
        family.table,
        columns.join(",\n            "),
        BOOKKEEPING_DDL,
        family.natural_key.join(", ")
    )
}

// ============================================================================
// MERGE
// ============================================================================

/// Batch-level defaults applied to every merged row
#[derive(Debug, Clone)]
pub struct MergeContext {
    pub batch_id: String,
    pub ingested_at: DateTime<Utc>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeStats {
    pub inserted: usize,
    pub unchanged: usize,
    pub superseded: usize,
    pub conflicts: usize,
    /// Rows missing part of their natural key
    pub skipped: usize,
    /// Earlier rows in the batch overwritten by a later row with the same key
    pub collapsed: usize,
}

impl MergeStats {
    pub fn add(&mut self, other: &MergeStats) {
        self.inserted += other.inserted;
        self.unchanged += other.unchanged;
        self.superseded += other.superseded;
        self.conflicts += other.conflicts;
        self.skipped += other.skipped;
        self.collapsed += other.collapsed;
    }
}

/// Typed SQL value for a cell, falling back to text when it does not parse
fn sql_value(field_type: FieldType, raw: &str) -> SqlValue {
    match field_type {
        FieldType::Text => SqlValue::Text(raw.to_string()),
        FieldType::Real => raw
            .parse::<f64>()
            .map(SqlValue::Real)
            .unwrap_or_else(|_| SqlValue::Text(raw.to_string())),
        FieldType::Integer => match raw.parse::<f64>() {
            Ok(v) if v.fract() == 0.0 => SqlValue::Integer(v as i64),
            Ok(v) => SqlValue::Real(v),
            Err(_) => SqlValue::Text(raw.to_string()),
        },
    }
}

/// Hash of the row's values (family fields and extras), not its bookkeeping
pub fn content_hash(family: &RecordFamily, row: &ProjectedRow) -> String {
    let mut hasher = Sha256::new();
    for field in family.fields() {
        let value = row.fields.get(&field.name).map(String::as_str).unwrap_or("");
        hasher.update(format!("{}={}\x1f", field.name, value));
    }
    for (name, value) in &row.extra {
        hasher.update(format!("+{}={}\x1f", name, value));
    }
    format!("{:x}", hasher.finalize())
}

fn natural_key(family: &RecordFamily, row: &ProjectedRow) -> Option<Vec<String>> {
    family
        .natural_key
        .iter()
        .map(|k| row.fields.get(k).cloned())
        .collect()
}

/// Merge one batch's rows into the family table inside a single IMMEDIATE
/// transaction. Re-running the same rows leaves the store unchanged.
pub fn merge_rows(
    conn: &mut Connection,
    family: &RecordFamily,
    rows: &[ProjectedRow],
    ctx: &MergeContext,
) -> Result<MergeStats> {
    let mut stats = MergeStats::default();

    // Last row wins within a batch
    let mut keyed: BTreeMap<Vec<String>, &ProjectedRow> = BTreeMap::new();
    for row in rows {
        match natural_key(family, row) {
            Some(key) => {
                if keyed.insert(key, row).is_some() {
                    stats.collapsed += 1;
                }
            }
            None => {
                warn!(table = %family.table, batch_id = %ctx.batch_id, "row missing natural key, skipped");
                stats.skipped += 1;
            }
        }
    }

    let mut columns: Vec<&str> = family.fields().map(|f| f.name.as_str()).collect();
    columns.extend([
        "origin",
        "extra",
        "content_hash",
        "source_ref",
        "ingested_at",
        "confidence",
        "validation_status",
    ]);

    let key_clause = family
        .natural_key
        .iter()
        .enumerate()
        .map(|(i, k)| format!("{} = ?{}", k, i + 1))
        .collect::<Vec<_>>()
        .join(" AND ");
    let select_sql = format!(
        "SELECT id, content_hash, ingested_at, source_ref, version FROM {} WHERE {}",
        family.table, key_clause
    );
    let insert_sql = format!(
        "INSERT INTO {} ({}, version) VALUES ({}, 1)",
        family.table,
        columns.join(", "),
        (1..=columns.len()).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ")
    );
    let update_sql = format!(
        "UPDATE {} SET {}, version = version + 1 WHERE id = ?{}",
        family.table,
        columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", c, i + 1))
            .collect::<Vec<_>>()
            .join(", "),
        columns.len() + 1
    );

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    for (key, row) in &keyed {
        let hash = content_hash(family, row);
        let incoming_at = row
            .bookkeeping
            .get("ingested_at")
            .cloned()
            .unwrap_or_else(|| ctx.ingested_at.to_rfc3339());
        let source_ref = row
            .bookkeeping
            .get("source_ref")
            .cloned()
            .unwrap_or_else(|| ctx.batch_id.clone());
        let confidence = row
            .bookkeeping
            .get("confidence")
            .and_then(|c| c.parse::<f64>().ok())
            .unwrap_or(ctx.confidence)
            .clamp(0.0, 1.0);
        let status = row
            .bookkeeping
            .get("validation_status")
            .cloned()
            .unwrap_or_else(|| "approved".to_string());
        let extra = if row.extra.is_empty() {
            SqlValue::Null
        } else {
            SqlValue::Text(serde_json::to_string(&row.extra)?)
        };

        let mut values: Vec<SqlValue> = family
            .fields()
            .map(|f| match row.fields.get(&f.name) {
                Some(raw) => sql_value(f.field_type, raw),
                None => SqlValue::Null,
            })
            .collect();
        values.push(
            row.bookkeeping
                .get("origin")
                .map(|o| SqlValue::Text(o.clone()))
                .unwrap_or(SqlValue::Null),
        );
        values.push(extra);
        values.push(SqlValue::Text(hash.clone()));
        values.push(SqlValue::Text(source_ref.clone()));
        values.push(SqlValue::Text(incoming_at.clone()));
        values.push(SqlValue::Real(confidence));
        values.push(SqlValue::Text(status));

        let existing: Option<(i64, String, String, String, i64)> = tx
            .query_row(&select_sql, params_from_iter(key.iter()), |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
            })
            .optional()?;

        match existing {
            None => {
                tx.execute(&insert_sql, params_from_iter(values.iter()))?;
                stats.inserted += 1;
            }
            Some((_, existing_hash, _, _, _)) if existing_hash == hash => {
                stats.unchanged += 1;
            }
            Some((id, _, existing_at, existing_ref, version)) => {
                let key_text = key.join("|");
                let old_row = row_as_json(&tx, &family.table, id)?;
                tx.execute(
                    "INSERT INTO record_history (
                        table_name, natural_key, version, row_data, superseded_by, superseded_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        family.table,
                        key_text,
                        version,
                        serde_json::to_string(&old_row)?,
                        source_ref,
                        Utc::now().to_rfc3339(),
                    ],
                )?;

                if is_newer(&existing_at, &incoming_at) {
                    warn!(
                        table = %family.table,
                        key = %key_text,
                        existing = %existing_ref,
                        incoming = %source_ref,
                        "merge conflict: stored row is newer, overwriting anyway"
                    );
                    let event = Event::new(
                        "merge_conflict",
                        &family.table,
                        &key_text,
                        serde_json::json!({
                            "existing_source_ref": existing_ref,
                            "existing_ingested_at": existing_at,
                            "incoming_source_ref": source_ref,
                            "incoming_ingested_at": incoming_at,
                        }),
                        LOADER_ACTOR,
                    );
                    insert_event(&tx, &event)?;
                    stats.conflicts += 1;
                }

                values.push(SqlValue::Integer(id));
                tx.execute(&update_sql, params_from_iter(values.iter()))?;
                stats.superseded += 1;
            }
        }
    }

    // A merge that changed nothing leaves no trace, events included
    if stats.inserted + stats.superseded > 0 {
        let event = Event::new(
            "batch_merged",
            &family.table,
            &ctx.batch_id,
            serde_json::to_value(&stats)?,
            LOADER_ACTOR,
        );
        insert_event(&tx, &event)?;
    }

    tx.commit()?;
    debug!(table = %family.table, batch_id = %ctx.batch_id, ?stats, "merge committed");
    Ok(stats)
}

/// RFC 3339 comparison, falling back to string order for unparsable values
fn is_newer(existing: &str, incoming: &str) -> bool {
    match (
        DateTime::parse_from_rfc3339(existing),
        DateTime::parse_from_rfc3339(incoming),
    ) {
        (Ok(a), Ok(b)) => a > b,
        _ => existing > incoming,
    }
}

fn row_as_json(conn: &Connection, table: &str, id: i64) -> Result<serde_json::Value> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {} WHERE id = ?1", table))?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let value = stmt.query_row(params![id], |row| {
        let mut map = serde_json::Map::new();
        for (i, name) in names.iter().enumerate() {
            let value = match row.get_ref(i)? {
                ValueRef::Null => serde_json::Value::Null,
                ValueRef::Integer(n) => serde_json::json!(n),
                ValueRef::Real(f) => serde_json::json!(f),
                ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
                ValueRef::Blob(b) => serde_json::json!(format!("<{} bytes>", b.len())),
            };
            map.insert(name.clone(), value);
        }
        Ok(serde_json::Value::Object(map))
    })?;
    Ok(value)
}

// ============================================================================
// QUERIES
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct FamilySummary {
    pub family: String,
    pub table: String,
    pub records: i64,
    pub first_date: Option<String>,
    pub last_date: Option<String>,
}

pub fn family_summary(conn: &Connection, family: &RecordFamily) -> Result<FamilySummary> {
    let (records, first_date, last_date): (i64, Option<String>, Option<String>) = conn.query_row(
        &format!("SELECT COUNT(*), MIN(date), MAX(date) FROM {}", family.table),
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    Ok(FamilySummary {
        family: family.name.clone(),
        table: family.table.clone(),
        records,
        first_date,
        last_date,
    })
}

pub fn count_records(conn: &Connection, table: &str) -> Result<i64> {
    let count = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
    Ok(count)
}

pub fn history_count(conn: &Connection, table: &str, natural_key: &str) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM record_history WHERE table_name = ?1 AND natural_key = ?2",
        params![table, natural_key],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Events of one type, newest first
pub fn get_events_by_type(conn: &Connection, event_type: &str) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE event_type = ?1
         ORDER BY timestamp DESC",
    )?;

    let events = stmt
        .query_map(params![event_type], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|_| rusqlite::Error::InvalidQuery)?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::builtin_families;
    use chrono::TimeZone;

    fn city() -> RecordFamily {
        builtin_families().into_iter().find(|f| f.name == "city").unwrap()
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn, &builtin_families()).unwrap();
        conn
    }

    fn row(date: &str, category: &str, sales: &str, price: &str) -> ProjectedRow {
        let mut r = ProjectedRow::default();
        r.fields.insert("date".to_string(), date.to_string());
        r.fields.insert("category".to_string(), category.to_string());
        r.fields.insert("sales".to_string(), sales.to_string());
        r.fields.insert("benchmark_price".to_string(), price.to_string());
        r
    }

    fn ctx(batch_id: &str, day: u32) -> MergeContext {
        MergeContext {
            batch_id: batch_id.to_string(),
            ingested_at: Utc.with_ymd_and_hms(2025, 3, day, 12, 0, 0).unwrap(),
            confidence: 0.95,
        }
    }

    fn dump(conn: &Connection) -> Vec<serde_json::Value> {
        let ids: Vec<i64> = conn
            .prepare("SELECT id FROM housing_city_monthly ORDER BY id")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        ids.into_iter()
            .map(|id| row_as_json(conn, "housing_city_monthly", id).unwrap())
            .collect()
    }

    #[test]
    fn test_reingest_identical_row_is_noop() {
        let mut conn = setup();
        let family = city();
        let rows = vec![row("2025-01-01", "Total", "150", "650000")];

        let first = merge_rows(&mut conn, &family, &rows, &ctx("b1", 1)).unwrap();
        let before = dump(&conn);
        let events_before = count_records(&conn, "events").unwrap();
        let second = merge_rows(&mut conn, &family, &rows, &ctx("b1", 1)).unwrap();
        let after = dump(&conn);
        let events_after = count_records(&conn, "events").unwrap();

        println!("First: {:?}, second: {:?}", first, second);

        assert_eq!(first.inserted, 1);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.unchanged, 1);
        assert_eq!(count_records(&conn, "housing_city_monthly").unwrap(), 1);
        assert_eq!(before, after, "second merge must not change stored state");
        assert_eq!(events_before, 1);
        assert_eq!(events_after, events_before, "second merge must not add events");
        assert_eq!(before[0]["sales"], serde_json::json!(150));
        assert_eq!(before[0]["validation_status"], serde_json::json!("approved"));
    }

    #[test]
    fn test_changed_row_supersedes_with_history() {
        let mut conn = setup();
        let family = city();
        merge_rows(&mut conn, &family, &[row("2025-01-01", "Total", "150", "650000")], &ctx("b1", 1)).unwrap();
        let stats = merge_rows(&mut conn, &family, &[row("2025-01-01", "Total", "152", "650000")], &ctx("b2", 2)).unwrap();

        assert_eq!(stats.superseded, 1);
        assert_eq!(stats.conflicts, 0);
        let rows = dump(&conn);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["sales"], serde_json::json!(152));
        assert_eq!(rows[0]["version"], serde_json::json!(2));
        assert_eq!(rows[0]["source_ref"], serde_json::json!("b2"));
        assert_eq!(
            history_count(&conn, "housing_city_monthly", "2025-01-01|Total").unwrap(),
            1
        );
    }

    #[test]
    fn test_older_batch_logs_conflict() {
        let mut conn = setup();
        let family = city();
        merge_rows(&mut conn, &family, &[row("2025-01-01", "Total", "150", "650000")], &ctx("newer", 5)).unwrap();
        let stats = merge_rows(&mut conn, &family, &[row("2025-01-01", "Total", "149", "650000")], &ctx("older", 1)).unwrap();

        // Last writer wins, but the conflict is recorded
        assert_eq!(stats.conflicts, 1);
        assert_eq!(dump(&conn)[0]["sales"], serde_json::json!(149));
        let events = get_events_by_type(&conn, "merge_conflict").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entity_id, "2025-01-01|Total");
        assert_eq!(events[0].data["existing_source_ref"], "newer");
    }

    #[test]
    fn test_in_batch_duplicates_collapse_to_last() {
        let mut conn = setup();
        let family = city();
        let rows = vec![
            row("2025-01-01", "Total", "150", "650000"),
            row("2025-01-01", "Total", "151", "650000"),
            row("2025-01-01", "Detached", "90", "780000"),
        ];
        let stats = merge_rows(&mut conn, &family, &rows, &ctx("b1", 1)).unwrap();
        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.collapsed, 1);
        let total = dump(&conn)
            .into_iter()
            .find(|r| r["category"] == "Total")
            .unwrap();
        assert_eq!(total["sales"], serde_json::json!(151));
    }

    #[test]
    fn test_missing_key_skipped() {
        let mut conn = setup();
        let family = city();
        let mut incomplete = row("2025-01-01", "Total", "150", "650000");
        incomplete.fields.remove("category");
        let stats = merge_rows(&mut conn, &family, &[incomplete], &ctx("b1", 1)).unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(count_records(&conn, "housing_city_monthly").unwrap(), 0);
    }

    #[test]
    fn test_natural_key_is_unique() {
        let conn = setup();
        let insert = "INSERT INTO housing_city_monthly
            (date, category, sales, benchmark_price, content_hash, source_ref, ingested_at, confidence, validation_status)
            VALUES ('2025-01-01', 'Total', 1, 1.0, 'h', 'b', 't', 1.0, 'approved')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }

    #[test]
    fn test_extra_columns_and_summary() {
        let mut conn = setup();
        let family = city();
        let mut r = row("2025-02-01", "Total", "150", "650000");
        r.extra.insert("region_code".to_string(), "AB".to_string());
        r.bookkeeping.insert("confidence".to_string(), "0.8".to_string());
        merge_rows(&mut conn, &family, &[r, row("2025-01-01", "Total", "140", "640000")], &ctx("b1", 1)).unwrap();

        let feb = dump(&conn).into_iter().find(|r| r["date"] == "2025-02-01").unwrap();
        assert_eq!(feb["extra"], serde_json::json!("{\"region_code\":\"AB\"}"));
        assert_eq!(feb["confidence"], serde_json::json!(0.8));

        let summary = family_summary(&conn, &family).unwrap();
        assert_eq!(summary.records, 2);
        assert_eq!(summary.first_date.as_deref(), Some("2025-01-01"));
        assert_eq!(summary.last_date.as_deref(), Some("2025-02-01"));

        let merged = get_events_by_type(&conn, "batch_merged").unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].data["inserted"], 2);
    }
}
