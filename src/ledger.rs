/// Alert Ledger — append-only record of every raised alert
///
/// Two stores share one contract: a CSV sheet (Date, Time, Location, Source,
/// Image) that opens in any spreadsheet, and a SQLite table for sites that
/// want to query history. Appends from all sources and dispatch tasks go
/// through one mutex, so each read-modify-write is atomic and rows keep
/// their insertion order.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{LedgerConfig, LedgerFormat};
use crate::error::LedgerError;

pub const CSV_HEADER: [&str; 5] = ["Date", "Time", "Location", "Source", "Image"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub date: String,
    pub time: String,
    pub location: String,
    pub source_id: String,
    pub evidence_ref: String,
}

impl LedgerRecord {
    /// Date and time are written in the site's local time zone.
    pub fn new(
        at: DateTime<Utc>,
        location: impl Into<String>,
        source_id: impl Into<String>,
        evidence_ref: impl Into<String>,
    ) -> Self {
        let local = at.with_timezone(&Local);
        Self {
            date: local.format("%Y-%m-%d").to_string(),
            time: local.format("%H:%M:%S").to_string(),
            location: location.into(),
            source_id: source_id.into(),
            evidence_ref: evidence_ref.into(),
        }
    }

    fn fields(&self) -> [&str; 5] {
        [
            self.date.as_str(),
            self.time.as_str(),
            self.location.as_str(),
            self.source_id.as_str(),
            self.evidence_ref.as_str(),
        ]
    }
}

pub trait LedgerStore: Send {
    fn append(&mut self, record: &LedgerRecord) -> Result<(), LedgerError>;

    /// Latest `limit` rows, oldest first.
    fn recent(&mut self, limit: usize) -> Result<Vec<LedgerRecord>, LedgerError>;
}

// ─── CSV store ──────────────────────────────────────────────────────────────

pub struct CsvLedger {
    path: PathBuf,
}

impl CsvLedger {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Ok(Self { path })
    }

    fn io_err(&self, source: std::io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl LedgerStore for CsvLedger {
    fn append(&mut self, record: &LedgerRecord) -> Result<(), LedgerError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;
        let empty = file.metadata().map_err(|e| self.io_err(e))?.len() == 0;

        // One write per append so a row is never split across writers
        let mut buf = String::new();
        if empty {
            buf.push_str(&csv_line(&CSV_HEADER));
        }
        buf.push_str(&csv_line(&record.fields()));

        file.write_all(buf.as_bytes()).map_err(|e| self.io_err(e))?;
        file.sync_data().map_err(|e| self.io_err(e))?;
        Ok(())
    }

    fn recent(&mut self, limit: usize) -> Result<Vec<LedgerRecord>, LedgerError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(e)),
        };

        let rows: Vec<LedgerRecord> = parse_csv(&text)
            .into_iter()
            .skip(1)
            .filter_map(|mut row| {
                if row.len() < 5 {
                    return None;
                }
                row.truncate(5);
                let evidence_ref = row.pop()?;
                let source_id = row.pop()?;
                let location = row.pop()?;
                let time = row.pop()?;
                let date = row.pop()?;
                Some(LedgerRecord { date, time, location, source_id, evidence_ref })
            })
            .collect();

        let skip = rows.len().saturating_sub(limit);
        Ok(rows.into_iter().skip(skip).collect())
    }
}

fn csv_field(field: &str) -> String {
    if field.contains(|c: char| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn csv_line(fields: &[&str]) -> String {
    let mut line = fields.iter().map(|f| csv_field(f)).collect::<Vec<_>>().join(",");
    line.push_str("\r\n");
    line
}

/// RFC 4180 reader: quoted fields, doubled quotes, embedded line breaks.
fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if quoted {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => quoted = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => quoted = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}

// ─── SQLite store ───────────────────────────────────────────────────────────

pub struct SqliteLedger {
    conn: Connection,
}

impl SqliteLedger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let ledger = Self { conn };
        ledger.migrate()?;
        Ok(ledger)
    }

    #[cfg(test)]
    fn open_in_memory() -> Result<Self, LedgerError> {
        let ledger = Self { conn: Connection::open_in_memory()? };
        ledger.migrate()?;
        Ok(ledger)
    }

    fn migrate(&self) -> Result<(), LedgerError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS alerts (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                date         TEXT    NOT NULL,
                time         TEXT    NOT NULL,
                location     TEXT    NOT NULL,
                source_id    TEXT    NOT NULL,
                evidence_ref TEXT    NOT NULL,
                recorded_at  TEXT    NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_alerts_source ON alerts (source_id);
            CREATE INDEX IF NOT EXISTS idx_alerts_date   ON alerts (date);
        ",
        )?;
        Ok(())
    }
}

impl LedgerStore for SqliteLedger {
    fn append(&mut self, record: &LedgerRecord) -> Result<(), LedgerError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO alerts (date, time, location, source_id, evidence_ref, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.date,
                record.time,
                record.location,
                record.source_id,
                record.evidence_ref,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn recent(&mut self, limit: usize) -> Result<Vec<LedgerRecord>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "SELECT date, time, location, source_id, evidence_ref
             FROM alerts ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(LedgerRecord {
                date: row.get(0)?,
                time: row.get(1)?,
                location: row.get(2)?,
                source_id: row.get(3)?,
                evidence_ref: row.get(4)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        out.reverse();
        Ok(out)
    }
}

// ─── Shared handle ──────────────────────────────────────────────────────────

/// Cloneable handle serializing all access to one store.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<Mutex<Box<dyn LedgerStore>>>,
    description: Arc<str>,
}

impl Ledger {
    pub fn new(store: Box<dyn LedgerStore>, description: impl Into<Arc<str>>) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            description: description.into(),
        }
    }

    pub fn open(cfg: &LedgerConfig) -> Result<Self, LedgerError> {
        let path = PathBuf::from(&cfg.path);
        let store: Box<dyn LedgerStore> = match cfg.format {
            LedgerFormat::Csv => Box::new(CsvLedger::open(&path)?),
            LedgerFormat::Sqlite => Box::new(SqliteLedger::open(&path)?),
        };
        let format = match cfg.format {
            LedgerFormat::Csv => "csv",
            LedgerFormat::Sqlite => "sqlite",
        };
        Ok(Self::new(store, format!("{} ({})", path.display(), format)))
    }

    pub fn describe(&self) -> &str {
        &self.description
    }

    pub fn append_blocking(&self, record: &LedgerRecord) -> Result<(), LedgerError> {
        let mut store = self.store.lock().map_err(|_| LedgerError::Poisoned)?;
        store.append(record)?;
        debug!(source = %record.source_id, evidence = %record.evidence_ref, "Ledger row appended");
        Ok(())
    }

    /// Append on the blocking pool.
    pub async fn append(&self, record: LedgerRecord) -> Result<(), LedgerError> {
        let ledger = self.clone();
        tokio::task::spawn_blocking(move || ledger.append_blocking(&record))
            .await
            .map_err(|e| LedgerError::Join(e.to_string()))?
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<LedgerRecord>, LedgerError> {
        let mut store = self.store.lock().map_err(|_| LedgerError::Poisoned)?;
        store.recent(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: usize, location: &str) -> LedgerRecord {
        LedgerRecord {
            date: "2025-06-01".into(),
            time: format!("10:00:{:02}", n % 60),
            location: location.into(),
            source_id: format!("cam{}", n % 3),
            evidence_ref: format!("alerts/cam_{}.jpg", n),
        }
    }

    #[test]
    fn csv_writes_header_once_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let mut ledger = CsvLedger::open(&path).unwrap();
        ledger.append(&record(1, "Pune, Maharashtra, IN")).unwrap();
        ledger.append(&record(2, "Unknown Location")).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Date,Time,Location,Source,Image\r\n"));
        assert_eq!(text.matches("Date,Time").count(), 1);
        assert!(text.contains("\"Pune, Maharashtra, IN\""));

        let rows = ledger.recent(10).unwrap();
        assert_eq!(rows, vec![record(1, "Pune, Maharashtra, IN"), record(2, "Unknown Location")]);
    }

    #[test]
    fn csv_recent_limits_to_latest() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = CsvLedger::open(dir.path().join("nested/log.csv")).unwrap();
        for i in 0..5 {
            ledger.append(&record(i, "Site")).unwrap();
        }
        let rows = ledger.recent(2).unwrap();
        assert_eq!(rows, vec![record(3, "Site"), record(4, "Site")]);
    }

    #[test]
    fn csv_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = CsvLedger::open(dir.path().join("none.csv")).unwrap();
        assert!(ledger.recent(5).unwrap().is_empty());
    }

    #[test]
    fn parse_csv_handles_quotes() {
        let rows = parse_csv("a,\"b,\"\"c\"\"\",d\r\n\"multi\nline\",x,\r\n");
        assert_eq!(rows[0], vec!["a", "b,\"c\"", "d"]);
        assert_eq!(rows[1], vec!["multi\nline", "x", ""]);
    }

    #[test]
    fn sqlite_append_and_recent() {
        let mut ledger = SqliteLedger::open_in_memory().unwrap();
        for i in 0..4 {
            ledger.append(&record(i, "Gate")).unwrap();
        }
        let rows = ledger.recent(3).unwrap();
        assert_eq!(rows, vec![record(1, "Gate"), record(2, "Gate"), record(3, "Gate")]);
    }

    #[test]
    fn record_formats_local_date_and_time() {
        let r = LedgerRecord::new(Utc::now(), "Site", "cam0", "alerts/x.jpg");
        assert_eq!(r.date.len(), 10);
        assert_eq!(r.time.len(), 8);
        assert_eq!(r.source_id, "cam0");
    }

    #[test]
    fn concurrent_appends_keep_every_row() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LedgerConfig {
            path: dir.path().join("log.csv").to_string_lossy().into_owned(),
            format: LedgerFormat::Csv,
        };
        let ledger = Ledger::open(&cfg).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        ledger.append_blocking(&record(t * 100 + i, "Yard, North")).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let rows = ledger.recent(1000).unwrap();
        assert_eq!(rows.len(), 200);
        assert!(rows.iter().all(|r| r.location == "Yard, North"));
    }
}
