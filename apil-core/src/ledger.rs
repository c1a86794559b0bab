//! Append-only event ledger (C11): the audit and reconciliation-evidence
//! substrate every other component writes to. Grounded on the
//! proof-hash-plus-CSV-manifest export shape of the teacher's economy ledger.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::sqlite::configure_connection;

const SCHEMA: &str = include_str!("../../sql/ledger.sql");

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("ledger event {0} not found")]
    NotFound(i64),
    #[error("store path not configured")]
    MissingStore,
}

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;
    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "info" => Ok(Severity::Info),
            "warn" => Ok(Severity::Warn),
            "error" => Ok(Severity::Error),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEvent {
    pub id: i64,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub severity: Severity,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub proof: String,
}

impl LedgerEvent {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let severity: String = row.get("severity")?;
        let payload_raw: String = row.get("payload")?;
        Ok(Self {
            id: row.get("id")?,
            event_type: row.get("event_type")?,
            entity_type: row.get("entity_type")?,
            entity_id: row.get("entity_id")?,
            severity: severity.parse().unwrap_or(Severity::Info),
            payload: serde_json::from_str(&payload_raw).unwrap_or(Value::Null),
            created_at: row.get("created_at")?,
            proof: row.get("proof")?,
        })
    }
}

pub struct NewLedgerEvent {
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub severity: Severity,
    pub payload: Value,
}

impl NewLedgerEvent {
    pub fn new(
        event_type: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        severity: Severity,
        payload: Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            severity,
            payload,
        }
    }
}

/// SHA-256 tamper-evidence digest over the event's immutable fields.
pub fn compute_proof(
    created_at: DateTime<Utc>,
    event_type: &str,
    entity_type: &str,
    entity_id: &str,
    payload: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(created_at.to_rfc3339().as_bytes());
    hasher.update(event_type.as_bytes());
    hasher.update(entity_type.as_bytes());
    hasher.update(entity_id.as_bytes());
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerExport {
    pub csv_path: PathBuf,
    pub manifest_path: PathBuf,
    pub checksum: String,
    pub event_count: usize,
}

#[derive(Default)]
pub struct LedgerStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl LedgerStoreBuilder {
    pub fn new() -> Self {
        Self {
            create_if_missing: true,
            ..Self::default()
        }
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> Result<LedgerStore> {
        let path = self.path.ok_or(LedgerError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if self.create_if_missing && !self.read_only {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        let conn = Connection::open_with_flags(&path, flags)?;
        configure_connection(&conn)?;
        Ok(LedgerStore { conn })
    }
}

pub struct LedgerStore {
    conn: Connection,
}

impl LedgerStore {
    pub fn builder() -> LedgerStoreBuilder {
        LedgerStoreBuilder::new()
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn record(&self, event: NewLedgerEvent) -> Result<LedgerEvent> {
        let created_at = Utc::now();
        let payload_raw = serde_json::to_string(&event.payload)?;
        let proof = compute_proof(
            created_at,
            &event.event_type,
            &event.entity_type,
            &event.entity_id,
            &payload_raw,
        );
        self.conn.execute(
            "INSERT INTO ledger_events
                (event_type, entity_type, entity_id, severity, payload, created_at, proof)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.event_type,
                event.entity_type,
                event.entity_id,
                event.severity.as_str(),
                payload_raw,
                created_at,
                proof,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.fetch(id)?.ok_or(LedgerError::NotFound(id))
    }

    pub fn fetch(&self, id: i64) -> Result<Option<LedgerEvent>> {
        self.conn
            .query_row(
                "SELECT * FROM ledger_events WHERE id = ?1",
                params![id],
                LedgerEvent::from_row,
            )
            .optional()
            .map_err(LedgerError::from)
    }

    pub fn for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        limit: usize,
    ) -> Result<Vec<LedgerEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM ledger_events
             WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY created_at DESC, id DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![entity_type, entity_id, limit as i64], LedgerEvent::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn export_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        output_dir: &Path,
    ) -> Result<LedgerExport> {
        std::fs::create_dir_all(output_dir)?;
        let mut stmt = self.conn.prepare(
            "SELECT * FROM ledger_events
             WHERE created_at >= ?1 AND created_at <= ?2
             ORDER BY created_at ASC, id ASC",
        )?;
        let events = stmt
            .query_map(params![start, end], LedgerEvent::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let csv_path = output_dir.join(format!(
            "ledger_{}_{}.csv",
            start.format("%Y%m%dT%H%M%S"),
            end.format("%Y%m%dT%H%M%S")
        ));
        let mut csv = String::from("id,event_type,entity_type,entity_id,severity,created_at,proof\n");
        for event in &events {
            csv.push_str(&format!(
                "{},{},{},{},{},{},{}\n",
                event.id,
                escape_field(&event.event_type),
                escape_field(&event.entity_type),
                escape_field(&event.entity_id),
                event.severity.as_str(),
                event.created_at.to_rfc3339(),
                event.proof
            ));
        }
        std::fs::write(&csv_path, csv.as_bytes())?;
        let checksum = file_checksum(&csv_path)?;

        let manifest_path = csv_path.with_extension("manifest.json");
        let manifest = serde_json::json!({
            "csv_file": csv_path.file_name().and_then(|n| n.to_str()),
            "checksum_sha256": checksum,
            "event_count": events.len(),
            "range_start": start.to_rfc3339(),
            "range_end": end.to_rfc3339(),
        });
        std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;

        Ok(LedgerExport {
            csv_path,
            manifest_path,
            checksum,
            event_count: events.len(),
        })
    }
}

fn escape_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn file_checksum(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, LedgerStore) {
        let dir = tempdir().unwrap();
        let store = LedgerStore::builder()
            .path(dir.path().join("ledger.sqlite"))
            .build()
            .unwrap();
        store.initialize().unwrap();
        (dir, store)
    }

    #[test]
    fn records_and_fetches_events_with_stable_proof() {
        let (_dir, store) = store();
        let event = store
            .record(NewLedgerEvent::new(
                "publish_successful",
                "publish_log",
                "log-1",
                Severity::Info,
                json!({"platform": "tiktok"}),
            ))
            .unwrap();
        assert_eq!(event.id, 1);
        assert!(!event.proof.is_empty());

        let fetched = store.fetch(event.id).unwrap().unwrap();
        assert_eq!(fetched.proof, event.proof);
    }

    #[test]
    fn for_entity_orders_newest_first() {
        let (_dir, store) = store();
        for i in 0..3 {
            store
                .record(NewLedgerEvent::new(
                    "schedule_conflict_detected",
                    "publish_log",
                    "log-1",
                    Severity::Info,
                    json!({"seq": i}),
                ))
                .unwrap();
        }
        let events = store.for_entity("publish_log", "log-1", 10).unwrap();
        assert_eq!(events.len(), 3);
        assert!(events[0].id > events[1].id);
    }

    #[test]
    fn export_range_writes_csv_and_manifest_with_matching_checksum() {
        let (dir, store) = store();
        store
            .record(NewLedgerEvent::new(
                "optimization_executed",
                "optimization_action",
                "action-1",
                Severity::Info,
                json!({"amount_pct": 0.1}),
            ))
            .unwrap();
        let export = store
            .export_range(
                Utc::now() - chrono::Duration::hours(1),
                Utc::now() + chrono::Duration::hours(1),
                &dir.path().join("out"),
            )
            .unwrap();
        assert_eq!(export.event_count, 1);
        assert_eq!(file_checksum(&export.csv_path).unwrap(), export.checksum);
    }
}
