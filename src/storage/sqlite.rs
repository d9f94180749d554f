use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior,
};

use super::{check_write_mode, ChamberFilter, ChamberRecords, DetectionStore, RecordFilter, RecordKey, WriteMode};
use crate::aggregate::Counts;
use crate::detect::Detection;
use crate::error::{InspectError, Result};
use crate::record::{DetectionRecord, NewRecord};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_RECORD: &str = "SELECT id, seq, chamber_id, created_at, missing_count, good_count, \
     other_count, detections_json, image_path, result_image_path FROM detections";

/// SQLite-backed store.
///
/// The connection sits behind a mutex and every write runs in an IMMEDIATE
/// transaction, so concurrent writers for the same chamber are serialized and
/// readers never observe a half-replaced record.
pub struct SqliteDetectionStore {
    conn: Mutex<Connection>,
    mode: WriteMode,
}

impl SqliteDetectionStore {
    /// Open (or create) the database at `db_path`. `file:` URIs are accepted.
    pub fn open(db_path: &str, mode: WriteMode) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        let store = Self::from_connection(conn, mode)?;
        log::info!("detection store opened at {} (mode={})", db_path, mode);
        Ok(store)
    }

    pub fn open_in_memory(mode: WriteMode) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, mode)
    }

    fn from_connection(mut conn: Connection, mode: WriteMode) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        ensure_schema(&conn)?;
        bind_write_mode(&mut conn, mode)?;
        Ok(Self {
            conn: Mutex::new(conn),
            mode,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| InspectError::Persistence("store connection lock poisoned".into()))
    }
}

impl DetectionStore for SqliteDetectionStore {
    fn mode(&self) -> WriteMode {
        self.mode
    }

    fn write(&self, record: NewRecord, mode: WriteMode) -> Result<DetectionRecord> {
        check_write_mode(self.mode, mode)?;
        let detections_json = serde_json::to_string(&record.raw_detections)
            .map_err(|e| InspectError::persistence("cannot encode detections", e))?;

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (seq, timestamp) = next_write_stamp(&tx)?;

        if mode == WriteMode::Upsert {
            let replaced = tx.execute(
                "DELETE FROM detections WHERE chamber_id = ?1",
                params![record.chamber_id.as_str()],
            )?;
            if replaced > 0 {
                log::debug!(
                    "upsert replaces {} record(s) for chamber {}",
                    replaced,
                    record.chamber_id
                );
            }
        }

        tx.execute(
            r#"
            INSERT INTO detections(
              seq, chamber_id, created_at, missing_count, good_count, other_count,
              detections_json, image_path, result_image_path
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                to_sql_int(seq)?,
                record.chamber_id.as_str(),
                format_timestamp(timestamp),
                to_sql_int(record.counts.missing)?,
                to_sql_int(record.counts.good)?,
                to_sql_int(record.counts.other)?,
                detections_json,
                record.image_ref.as_deref(),
                record.result_image_ref.as_deref(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(DetectionRecord::from_new(record, id, seq, timestamp))
    }

    fn get(&self, chamber_id: &str) -> Result<ChamberRecords> {
        let records = self.list(&RecordFilter::exact(chamber_id))?;
        ChamberRecords::shaped(self.mode, records, chamber_id)
    }

    fn get_by_id(&self, id: i64) -> Result<DetectionRecord> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("{SELECT_RECORD} WHERE id = ?1"),
                params![id],
                RecordRow::read,
            )
            .optional()?;
        match row {
            Some(row) => row.into_record(),
            None => Err(InspectError::NotFound(format!("no record with id {id}"))),
        }
    }

    fn list(&self, filter: &RecordFilter) -> Result<Vec<DetectionRecord>> {
        let mut sql = String::from(SELECT_RECORD);
        let mut args: Vec<Value> = Vec::new();
        match &filter.chamber {
            Some(ChamberFilter::Exact(id)) => {
                sql.push_str(" WHERE chamber_id = ?1");
                args.push(Value::Text(id.clone()));
            }
            // instr() compares bytes, so the match stays case-sensitive (LIKE would not).
            Some(ChamberFilter::Contains(needle)) if !needle.is_empty() => {
                sql.push_str(" WHERE instr(chamber_id, ?1) > 0");
                args.push(Value::Text(needle.clone()));
            }
            _ => {}
        }
        sql.push_str(" ORDER BY seq DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let rows = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(args.iter()), RecordRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(RecordRow::into_record).collect()
    }

    fn delete(&self, key: &RecordKey) -> Result<DetectionRecord> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row = match key {
            RecordKey::Chamber(chamber_id) => tx
                .query_row(
                    &format!("{SELECT_RECORD} WHERE chamber_id = ?1 ORDER BY seq DESC LIMIT 1"),
                    params![chamber_id],
                    RecordRow::read,
                )
                .optional()?,
            RecordKey::Id(id) => tx
                .query_row(
                    &format!("{SELECT_RECORD} WHERE id = ?1"),
                    params![id],
                    RecordRow::read,
                )
                .optional()?,
        };
        let Some(row) = row else {
            return Err(InspectError::NotFound(format!("no record for {key}")));
        };
        let record = row.into_record()?;
        tx.execute("DELETE FROM detections WHERE id = ?1", params![record.id])?;
        tx.commit()?;
        log::info!(
            "deleted record #{} for chamber {} (image artifacts left in place)",
            record.id,
            record.chamber_id
        );
        Ok(record)
    }

    fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM detections", [], |row| row.get(0))?;
        usize::try_from(n).map_err(|_| InspectError::Persistence("negative row count".into()))
    }
}

fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS detections (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          seq INTEGER NOT NULL,
          chamber_id TEXT NOT NULL,
          created_at TEXT NOT NULL,
          missing_count INTEGER NOT NULL CHECK (missing_count >= 0),
          good_count INTEGER NOT NULL CHECK (good_count >= 0),
          detections_json TEXT NOT NULL DEFAULT '[]'
        );

        CREATE TABLE IF NOT EXISTS write_sequence (
          id INTEGER PRIMARY KEY CHECK (id = 1),
          last_seq INTEGER NOT NULL,
          last_created_at TEXT
        );

        INSERT OR IGNORE INTO write_sequence(id, last_seq, last_created_at)
          SELECT 1, COALESCE(MAX(seq), 0), MAX(created_at) FROM detections;

        CREATE TABLE IF NOT EXISTS store_meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_detections_chamber ON detections(chamber_id);
        CREATE INDEX IF NOT EXISTS idx_detections_seq ON detections(seq);
        "#,
    )?;
    // Columns added after the first table layout; older databases gain them in place.
    ensure_columns(
        conn,
        "detections",
        &[
            ("other_count", "INTEGER NOT NULL DEFAULT 0"),
            ("image_path", "TEXT"),
            ("result_image_path", "TEXT"),
        ],
    )?;
    Ok(())
}

/// Pin the database to one write mode.
///
/// The first open records `mode`; later opens in the other mode fail. A
/// database without a recorded mode can only become an upsert store if no
/// chamber already has several records.
fn bind_write_mode(conn: &mut Connection, mode: WriteMode) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let recorded: Option<String> = tx
        .query_row(
            "SELECT value FROM store_meta WHERE key = 'write_mode'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match recorded {
        Some(raw) => {
            let recorded: WriteMode = raw.parse().map_err(|_| {
                InspectError::Persistence(format!("corrupt store_meta write_mode '{raw}'"))
            })?;
            if recorded != mode {
                return Err(InspectError::Validation(format!(
                    "database was created in {recorded} mode and cannot be opened in {mode} mode"
                )));
            }
        }
        None => {
            if mode == WriteMode::Upsert {
                let duplicated: Option<String> = tx
                    .query_row(
                        "SELECT chamber_id FROM detections GROUP BY chamber_id \
                         HAVING COUNT(*) > 1 LIMIT 1",
                        [],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(chamber_id) = duplicated {
                    return Err(InspectError::Validation(format!(
                        "database holds several records for chamber '{chamber_id}' and cannot be opened in upsert mode"
                    )));
                }
            }
            tx.execute(
                "INSERT INTO store_meta(key, value) VALUES ('write_mode', ?1)",
                params![mode.to_string()],
            )?;
        }
    }
    tx.commit()?;
    Ok(())
}

pub(crate) fn ensure_columns(conn: &Connection, table: &str, columns: &[(&str, &str)]) -> Result<()> {
    let existing = {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        names
    };
    for (name, decl) in columns {
        if !existing.iter().any(|c| c == name) {
            conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {name} {decl}"), [])?;
        }
    }
    Ok(())
}

/// Next (seq, timestamp) pair. Must run inside the write transaction.
///
/// The timestamp never goes backwards even if the wall clock does; ties are
/// broken by `seq`.
fn next_write_stamp(conn: &Connection) -> Result<(u64, DateTime<Utc>)> {
    let (last_seq, last_created): (i64, Option<String>) = conn.query_row(
        "SELECT last_seq, last_created_at FROM write_sequence WHERE id = 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let now = Utc::now().trunc_subsecs(6);
    let timestamp = match last_created.as_deref().map(parse_timestamp).transpose()? {
        Some(prev) if prev > now => prev,
        _ => now,
    };
    let seq = u64::try_from(last_seq)
        .map_err(|_| InspectError::Persistence("corrupt write sequence".into()))?
        + 1;
    conn.execute(
        "UPDATE write_sequence SET last_seq = ?1, last_created_at = ?2 WHERE id = 1",
        params![to_sql_int(seq)?, format_timestamp(timestamp)],
    )?;
    Ok((seq, timestamp))
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| InspectError::persistence("corrupt timestamp", e))
}

fn to_sql_int(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| InspectError::Persistence(format!("{value} exceeds i64 range")))
}

fn from_sql_count(value: i64, column: &str) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| InspectError::Persistence(format!("corrupt row: negative {column}")))
}

struct RecordRow {
    id: i64,
    seq: i64,
    chamber_id: String,
    created_at: String,
    missing: i64,
    good: i64,
    other: i64,
    detections_json: String,
    image_path: Option<String>,
    result_image_path: Option<String>,
}

impl RecordRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            seq: row.get(1)?,
            chamber_id: row.get(2)?,
            created_at: row.get(3)?,
            missing: row.get(4)?,
            good: row.get(5)?,
            other: row.get(6)?,
            detections_json: row.get(7)?,
            image_path: row.get(8)?,
            result_image_path: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<DetectionRecord> {
        let raw_detections: Vec<Detection> = serde_json::from_str(&self.detections_json)
            .map_err(|e| InspectError::persistence("corrupt detections_json", e))?;
        Ok(DetectionRecord {
            id: self.id,
            seq: from_sql_count(self.seq, "seq")?,
            chamber_id: self.chamber_id,
            timestamp: parse_timestamp(&self.created_at)?,
            counts: Counts::new(
                from_sql_count(self.missing, "missing_count")?,
                from_sql_count(self.good, "good_count")?,
                from_sql_count(self.other, "other_count")?,
            ),
            raw_detections,
            image_ref: self.image_path,
            result_image_ref: self.result_image_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;
    use crate::record::ChamberId;

    fn new_record(chamber: &str, counts: Counts) -> NewRecord {
        let detections = vec![Detection::new(0, 0.9, BoundingBox::new(1.0, 2.0, 3.0, 4.0))];
        NewRecord::new(ChamberId::parse(chamber).unwrap(), counts, detections)
    }

    #[test]
    fn write_then_read_back_is_identical() {
        let store = SqliteDetectionStore::open_in_memory(WriteMode::Append).unwrap();
        let written = store
            .write(
                new_record("A1", Counts::new(1, 2, 0))
                    .with_images(Some("uploads/a.jpg".into()), Some("results/a.png".into())),
                WriteMode::Append,
            )
            .unwrap();
        let read = store.get_by_id(written.id).unwrap();
        assert_eq!(read, written);
        assert_eq!(read.raw_detections[0].bbox, BoundingBox::new(1.0, 2.0, 3.0, 4.0));
    }

    #[test]
    fn sequence_and_timestamps_are_monotonic() {
        let store = SqliteDetectionStore::open_in_memory(WriteMode::Append).unwrap();
        let mut last: Option<DetectionRecord> = None;
        for i in 0..10 {
            let rec = store
                .write(new_record("A1", Counts::new(i, 0, 0)), WriteMode::Append)
                .unwrap();
            if let Some(prev) = &last {
                assert!(rec.seq > prev.seq);
                assert!(rec.timestamp >= prev.timestamp);
            }
            last = Some(rec);
        }
    }

    #[test]
    fn contains_filter_skips_other_case() {
        let store = SqliteDetectionStore::open_in_memory(WriteMode::Append).unwrap();
        store.write(new_record("A1-01", Counts::default()), WriteMode::Append).unwrap();
        store.write(new_record("a1-02", Counts::default()), WriteMode::Append).unwrap();
        let hits = store.list(&RecordFilter::contains("A1")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chamber_id, "A1-01");
    }

    #[test]
    fn legacy_table_gains_new_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE detections (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               seq INTEGER NOT NULL,
               chamber_id TEXT NOT NULL,
               created_at TEXT NOT NULL,
               missing_count INTEGER NOT NULL,
               good_count INTEGER NOT NULL,
               detections_json TEXT NOT NULL DEFAULT '[]'
             );",
        )
        .unwrap();
        let store = SqliteDetectionStore::from_connection(conn, WriteMode::Upsert).unwrap();
        let rec = store
            .write(new_record("C3", Counts::new(0, 4, 1)), WriteMode::Upsert)
            .unwrap();
        assert_eq!(store.get_by_id(rec.id).unwrap().counts.other, 1);
    }

    #[test]
    fn unpinned_history_cannot_become_upsert_store() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        for chamber in ["A1", "A1"] {
            conn.execute(
                "INSERT INTO detections(seq, chamber_id, created_at, missing_count, good_count) \
                 VALUES (1, ?1, '2024-01-01T00:00:00.000000Z', 0, 0)",
                params![chamber],
            )
            .unwrap();
        }
        assert!(matches!(
            SqliteDetectionStore::from_connection(conn, WriteMode::Upsert),
            Err(InspectError::Validation(_))
        ));
    }
}
