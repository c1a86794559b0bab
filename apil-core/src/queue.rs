//! Publication Queue (C3): the durable truth for publication attempts.
//! Generalizes the teacher's `PlayoutQueueStore` (builder pattern, `Connection`
//! opened per-call against stored `OpenFlags`) and `plan/store.rs`'s
//! `reserve_next` atomic-claim transaction from a single playout partition to
//! per-`(platform, account_id)` partitions.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::sqlite::configure_connection;

const QUEUE_SCHEMA: &str = include_str!("../../sql/queue.sql");

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to open queue database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on queue database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("queue path not configured")]
    MissingStore,
    #[error("publish log {0} not found")]
    NotFound(i64),
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    Scheduled,
    Pending,
    Retry,
    Processing,
    Success,
    Failed,
    Cancelled,
}

impl PublishStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishStatus::Scheduled => "scheduled",
            PublishStatus::Pending => "pending",
            PublishStatus::Retry => "retry",
            PublishStatus::Processing => "processing",
            PublishStatus::Success => "success",
            PublishStatus::Failed => "failed",
            PublishStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PublishStatus::Success | PublishStatus::Failed | PublishStatus::Cancelled
        )
    }
}

impl std::fmt::Display for PublishStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PublishStatus {
    type Err = String;
    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "scheduled" => Ok(PublishStatus::Scheduled),
            "pending" => Ok(PublishStatus::Pending),
            "retry" => Ok(PublishStatus::Retry),
            "processing" => Ok(PublishStatus::Processing),
            "success" => Ok(PublishStatus::Success),
            "failed" => Ok(PublishStatus::Failed),
            "cancelled" => Ok(PublishStatus::Cancelled),
            other => Err(format!("unknown publish status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledBy {
    Manual,
    AutoIntelligence,
    AbWinner,
    Optimizer,
}

impl ScheduledBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduledBy::Manual => "manual",
            ScheduledBy::AutoIntelligence => "auto_intelligence",
            ScheduledBy::AbWinner => "ab_winner",
            ScheduledBy::Optimizer => "optimizer",
        }
    }
}

impl FromStr for ScheduledBy {
    type Err = String;
    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "manual" => Ok(ScheduledBy::Manual),
            "auto_intelligence" => Ok(ScheduledBy::AutoIntelligence),
            "ab_winner" => Ok(ScheduledBy::AbWinner),
            "optimizer" => Ok(ScheduledBy::Optimizer),
            other => Err(format!("unknown scheduled_by: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishLog {
    pub id: i64,
    pub clip_id: String,
    pub platform: String,
    pub social_account_id: Option<String>,
    pub status: PublishStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub requested_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub external_post_id: Option<String>,
    pub external_url: Option<String>,
    pub error_message: Option<String>,
    pub scheduled_by: ScheduledBy,
    pub extra_metadata: Value,
    pub updated_at: DateTime<Utc>,
}

impl PublishLog {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get("status")?;
        let scheduled_by: String = row.get("scheduled_by")?;
        let extra_metadata_raw: String = row.get("extra_metadata")?;
        Ok(Self {
            id: row.get("id")?,
            clip_id: row.get("clip_id")?,
            platform: row.get("platform")?,
            social_account_id: row.get("social_account_id")?,
            status: status.parse().unwrap_or(PublishStatus::Failed),
            scheduled_for: row.get("scheduled_for")?,
            requested_at: row.get("requested_at")?,
            published_at: row.get("published_at")?,
            retry_count: row.get("retry_count")?,
            max_retries: row.get("max_retries")?,
            last_retry_at: row.get("last_retry_at")?,
            external_post_id: row.get("external_post_id")?,
            external_url: row.get("external_url")?,
            error_message: row.get("error_message")?,
            scheduled_by: scheduled_by.parse().unwrap_or(ScheduledBy::Manual),
            extra_metadata: serde_json::from_str(&extra_metadata_raw).unwrap_or(Value::Null),
            updated_at: row.get("updated_at")?,
        })
    }

    /// `extra_metadata.priority`, the C1 priority score. Absent means the
    /// record was never scored and is treated as 0 in conflict resolution.
    pub fn priority(&self) -> f64 {
        self.extra_metadata
            .get("priority")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    }

    pub fn webhook_received(&self) -> bool {
        self.extra_metadata
            .get("webhook_received")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

pub struct NewPublishLog {
    pub clip_id: String,
    pub platform: String,
    pub social_account_id: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_retries: i64,
    pub scheduled_by: ScheduledBy,
    pub extra_metadata: Value,
}

#[derive(Debug, Clone)]
pub struct PublishLogStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for PublishLogStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl PublishLogStoreBuilder {
    pub fn new() -> Self {
        Self::default()
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

    pub fn build(self) -> Result<PublishLogStore> {
        let path = self.path.ok_or(QueueError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(PublishLogStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct PublishLogStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl PublishLogStore {
    pub fn builder() -> PublishLogStoreBuilder {
        PublishLogStoreBuilder::new()
    }

    fn open(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            QueueError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| QueueError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> Result<()> {
        let conn = self.open()?;
        conn.execute_batch(QUEUE_SCHEMA)?;
        Ok(())
    }

    pub fn enqueue(&self, log: NewPublishLog) -> Result<PublishLog> {
        let conn = self.open()?;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO publish_logs
                (clip_id, platform, social_account_id, status, scheduled_for, requested_at,
                 retry_count, max_retries, scheduled_by, extra_metadata, updated_at)
             VALUES (?1, ?2, ?3, 'scheduled', ?4, ?5, 0, ?6, ?7, ?8, ?5)",
            params![
                log.clip_id,
                log.platform,
                log.social_account_id,
                log.scheduled_for,
                now,
                log.max_retries,
                log.scheduled_by.as_str(),
                serde_json::to_string(&log.extra_metadata)?,
            ],
        )?;
        let id = conn.last_insert_rowid();
        fetch_with(&conn, id)?.ok_or(QueueError::NotFound(id))
    }

    pub fn fetch(&self, id: i64) -> Result<Option<PublishLog>> {
        let conn = self.open()?;
        fetch_with(&conn, id)
    }

    /// Promote `scheduled -> pending` as slots come due.
    pub fn promote_due(&self, now: DateTime<Utc>, tick_slack: Duration) -> Result<usize> {
        let conn = self.open()?;
        let horizon = now + tick_slack;
        let affected = conn.execute(
            "UPDATE publish_logs SET status = 'pending', updated_at = ?1
             WHERE status = 'scheduled' AND scheduled_for IS NOT NULL AND scheduled_for <= ?2",
            params![now, horizon],
        )?;
        Ok(affected)
    }

    /// Atomically claim the earliest due `pending`/`retry` log, flipping it
    /// to `processing`. Mirrors the teacher's `begin_playback`/`reserve_next`
    /// claim-inside-a-transaction shape.
    pub fn fetch_next_due(&self, now: DateTime<Utc>) -> Result<Option<PublishLog>> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let candidate: Option<i64> = tx
            .query_row(
                "SELECT id FROM publish_logs
                 WHERE status IN ('pending', 'retry') AND scheduled_for IS NOT NULL
                   AND scheduled_for <= ?1
                 ORDER BY scheduled_for ASC LIMIT 1",
                params![now],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = candidate else {
            tx.commit()?;
            return Ok(None);
        };
        tx.execute(
            "UPDATE publish_logs SET status = 'processing', updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        let log = tx.query_row(
            "SELECT * FROM publish_logs WHERE id = ?1",
            params![id],
            PublishLog::from_row,
        )?;
        tx.commit()?;
        Ok(Some(log))
    }

    /// Stamp `external_post_id`/`external_url` as soon as the provider
    /// returns them, without forcing a status transition — a webhook can
    /// then resolve this log by `external_post_id` while it's still
    /// `processing`/`retry`, ahead of `mark_success`.
    pub fn record_external_post_id(
        &self,
        id: i64,
        external_post_id: &str,
        external_url: Option<&str>,
    ) -> Result<PublishLog> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE publish_logs SET external_post_id = ?1, external_url = ?2 WHERE id = ?3",
            params![external_post_id, external_url, id],
        )?;
        if affected == 0 {
            return Err(QueueError::NotFound(id));
        }
        fetch_with(&conn, id)?.ok_or(QueueError::NotFound(id))
    }

    pub fn mark_success(
        &self,
        id: i64,
        external_post_id: &str,
        external_url: Option<&str>,
    ) -> Result<PublishLog> {
        let conn = self.open()?;
        let now = Utc::now();
        let affected = conn.execute(
            "UPDATE publish_logs
             SET status = 'success', published_at = ?1, external_post_id = ?2,
                 external_url = ?3, updated_at = ?1
             WHERE id = ?4",
            params![now, external_post_id, external_url, id],
        )?;
        if affected == 0 {
            return Err(QueueError::NotFound(id));
        }
        fetch_with(&conn, id)?.ok_or(QueueError::NotFound(id))
    }

    /// Increment `retry_count`; transition to `retry` (awaiting backoff) or
    /// `failed` once `max_retries` is exhausted.
    pub fn mark_retry_or_failed(&self, id: i64, error_message: &str) -> Result<PublishLog> {
        let conn = self.open()?;
        let log = fetch_with(&conn, id)?.ok_or(QueueError::NotFound(id))?;
        let now = Utc::now();
        let next_retry_count = log.retry_count + 1;
        let status = if next_retry_count < log.max_retries {
            PublishStatus::Retry
        } else {
            PublishStatus::Failed
        };
        conn.execute(
            "UPDATE publish_logs
             SET status = ?1, retry_count = ?2, last_retry_at = ?3, error_message = ?4, updated_at = ?3
             WHERE id = ?5",
            params![status.as_str(), next_retry_count, now, error_message, id],
        )?;
        fetch_with(&conn, id)?.ok_or(QueueError::NotFound(id))
    }

    /// Force `failed` without consuming a retry slot, for fatal provider
    /// errors the worker's classifier marks non-retryable.
    pub fn mark_failed_fatal(&self, id: i64, error_message: &str) -> Result<PublishLog> {
        let conn = self.open()?;
        let now = Utc::now();
        let affected = conn.execute(
            "UPDATE publish_logs SET status = 'failed', error_message = ?1, updated_at = ?2 WHERE id = ?3",
            params![error_message, now, id],
        )?;
        if affected == 0 {
            return Err(QueueError::NotFound(id));
        }
        fetch_with(&conn, id)?.ok_or(QueueError::NotFound(id))
    }

    /// Release a backed-off `retry` log back to `pending` once its wait has
    /// elapsed.
    pub fn release_retry_to_pending(&self, id: i64) -> Result<PublishLog> {
        let conn = self.open()?;
        let log = fetch_with(&conn, id)?.ok_or(QueueError::NotFound(id))?;
        if log.status != PublishStatus::Retry {
            return Err(QueueError::InvalidTransition {
                from: log.status.as_str().to_string(),
                to: PublishStatus::Pending.as_str().to_string(),
            });
        }
        let now = Utc::now();
        conn.execute(
            "UPDATE publish_logs SET status = 'pending', updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        fetch_with(&conn, id)?.ok_or(QueueError::NotFound(id))
    }

    /// Reconciliator-only transition: confirms success via webhook evidence
    /// or an external-API lookup, bypassing the worker's own retry path.
    pub fn reconcile_to_success(&self, id: i64) -> Result<PublishLog> {
        let conn = self.open()?;
        let now = Utc::now();
        let affected = conn.execute(
            "UPDATE publish_logs SET status = 'success', published_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        if affected == 0 {
            return Err(QueueError::NotFound(id));
        }
        fetch_with(&conn, id)?.ok_or(QueueError::NotFound(id))
    }

    pub fn reconcile_to_failed(&self, id: i64, reason: &str) -> Result<PublishLog> {
        let conn = self.open()?;
        let now = Utc::now();
        let affected = conn.execute(
            "UPDATE publish_logs SET status = 'failed', error_message = ?1, updated_at = ?2 WHERE id = ?3",
            params![reason, now, id],
        )?;
        if affected == 0 {
            return Err(QueueError::NotFound(id));
        }
        fetch_with(&conn, id)?.ok_or(QueueError::NotFound(id))
    }

    pub fn cancel(&self, id: i64) -> Result<PublishLog> {
        let conn = self.open()?;
        let log = fetch_with(&conn, id)?.ok_or(QueueError::NotFound(id))?;
        if log.status.is_terminal() {
            return Err(QueueError::InvalidTransition {
                from: log.status.as_str().to_string(),
                to: PublishStatus::Cancelled.as_str().to_string(),
            });
        }
        let now = Utc::now();
        conn.execute(
            "UPDATE publish_logs SET status = 'cancelled', updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        fetch_with(&conn, id)?.ok_or(QueueError::NotFound(id))
    }

    /// Merges webhook-delivered fields into `extra_metadata` without
    /// touching the status machine (used by C5 before C6 reconciles).
    pub fn merge_webhook_metadata(&self, id: i64, patch: Map<String, Value>) -> Result<PublishLog> {
        let conn = self.open()?;
        let log = fetch_with(&conn, id)?.ok_or(QueueError::NotFound(id))?;
        let mut metadata = log.extra_metadata.as_object().cloned().unwrap_or_default();
        for (key, value) in patch {
            metadata.insert(key, value);
        }
        let now = Utc::now();
        conn.execute(
            "UPDATE publish_logs SET extra_metadata = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(&Value::Object(metadata))?, now, id],
        )?;
        fetch_with(&conn, id)?.ok_or(QueueError::NotFound(id))
    }

    /// Reschedule a conflicting log to a new slot (C1 conflict resolution).
    pub fn reschedule(&self, id: i64, new_slot: DateTime<Utc>) -> Result<PublishLog> {
        let conn = self.open()?;
        let now = Utc::now();
        let affected = conn.execute(
            "UPDATE publish_logs SET scheduled_for = ?1, updated_at = ?2 WHERE id = ?3",
            params![new_slot, now, id],
        )?;
        if affected == 0 {
            return Err(QueueError::NotFound(id));
        }
        fetch_with(&conn, id)?.ok_or(QueueError::NotFound(id))
    }

    /// Non-terminal logs on `(platform, account_id)` whose `scheduled_for`
    /// falls within `slot ± window` of the candidate slot (C1's conflict
    /// search).
    pub fn conflicts_near(
        &self,
        platform: &str,
        account_id: Option<&str>,
        slot: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<PublishLog>> {
        let conn = self.open()?;
        let lower = slot - window;
        let upper = slot + window;
        let mut stmt = conn.prepare(
            "SELECT * FROM publish_logs
             WHERE platform = ?1
               AND ((?2 IS NULL AND social_account_id IS NULL) OR social_account_id = ?2)
               AND status NOT IN ('success', 'failed', 'cancelled')
               AND scheduled_for IS NOT NULL
               AND scheduled_for BETWEEN ?3 AND ?4
             ORDER BY scheduled_for ASC",
        )?;
        let rows = stmt
            .query_map(params![platform, account_id, lower, upper], PublishLog::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Latest non-terminal `scheduled_for` on the partition, anchoring the
    /// forecast oracle's (C2) `next_available_slot`.
    pub fn latest_scheduled(
        &self,
        platform: &str,
        account_id: Option<&str>,
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.open()?;
        conn.query_row(
            "SELECT MAX(scheduled_for) FROM publish_logs
             WHERE platform = ?1
               AND ((?2 IS NULL AND social_account_id IS NULL) OR social_account_id = ?2)
               AND status NOT IN ('success', 'failed', 'cancelled')",
            params![platform, account_id],
            |row| row.get(0),
        )
        .map_err(QueueError::from)
    }

    pub fn count_scheduled_in_window(
        &self,
        platform: &str,
        account_id: Option<&str>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.open()?;
        conn.query_row(
            "SELECT COUNT(*) FROM publish_logs
             WHERE platform = ?1
               AND ((?2 IS NULL AND social_account_id IS NULL) OR social_account_id = ?2)
               AND status NOT IN ('failed', 'cancelled')
               AND scheduled_for BETWEEN ?3 AND ?4",
            params![platform, account_id, window_start, window_end],
            |row| row.get(0),
        )
        .map_err(QueueError::from)
    }

    /// Stuck candidates for the reconciliator's sweep (C6): `processing` or
    /// `retry`, idle longer than the configured reconcile window.
    pub fn stuck_logs(&self, now: DateTime<Utc>, reconcile_window: Duration) -> Result<Vec<PublishLog>> {
        let conn = self.open()?;
        let threshold = now - reconcile_window;
        let mut stmt = conn.prepare(
            "SELECT * FROM publish_logs
             WHERE status IN ('processing', 'retry') AND updated_at < ?1
             ORDER BY updated_at ASC",
        )?;
        let rows = stmt
            .query_map(params![threshold], PublishLog::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_by_status(&self, status: Option<PublishStatus>, limit: usize) -> Result<Vec<PublishLog>> {
        let conn = self.open()?;
        let status_str = status.map(|s| s.as_str().to_string());
        let mut stmt = conn.prepare(
            "SELECT * FROM publish_logs
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY updated_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![status_str, limit as i64], PublishLog::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn fetch_with(conn: &Connection, id: i64) -> Result<Option<PublishLog>> {
    conn.query_row(
        "SELECT * FROM publish_logs WHERE id = ?1",
        params![id],
        PublishLog::from_row,
    )
    .optional()
    .map_err(QueueError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, PublishLogStore) {
        let dir = tempdir().unwrap();
        let store = PublishLogStore::builder()
            .path(dir.path().join("queue.sqlite"))
            .build()
            .unwrap();
        store.initialize().unwrap();
        (dir, store)
    }

    fn enqueue(store: &PublishLogStore, slot: DateTime<Utc>) -> PublishLog {
        store
            .enqueue(NewPublishLog {
                clip_id: "clip-1".into(),
                platform: "tiktok".into(),
                social_account_id: Some("acct-1".into()),
                scheduled_for: Some(slot),
                max_retries: 3,
                scheduled_by: ScheduledBy::AutoIntelligence,
                extra_metadata: serde_json::json!({"priority": 50.0}),
            })
            .unwrap()
    }

    #[test]
    fn enqueue_then_promote_then_claim() {
        let (_dir, store) = store();
        let now = Utc::now();
        let log = enqueue(&store, now - Duration::minutes(1));
        assert_eq!(log.status, PublishStatus::Scheduled);

        let promoted = store.promote_due(now, Duration::seconds(0)).unwrap();
        assert_eq!(promoted, 1);

        let claimed = store.fetch_next_due(now).unwrap().unwrap();
        assert_eq!(claimed.status, PublishStatus::Processing);
        assert!(store.fetch_next_due(now).unwrap().is_none());
    }

    #[test]
    fn retry_then_failed_after_max_retries() {
        let (_dir, store) = store();
        let log = enqueue(&store, Utc::now());
        let after_1 = store.mark_retry_or_failed(log.id, "timeout").unwrap();
        assert_eq!(after_1.status, PublishStatus::Retry);
        let after_2 = store.mark_retry_or_failed(log.id, "timeout").unwrap();
        assert_eq!(after_2.status, PublishStatus::Retry);
        let after_3 = store.mark_retry_or_failed(log.id, "timeout").unwrap();
        assert_eq!(after_3.status, PublishStatus::Failed);
        assert_eq!(after_3.retry_count, 3);
    }

    #[test]
    fn success_requires_external_post_id() {
        let (_dir, store) = store();
        let log = enqueue(&store, Utc::now());
        let success = store.mark_success(log.id, "ext-123", Some("https://example")).unwrap();
        assert_eq!(success.status, PublishStatus::Success);
        assert_eq!(success.external_post_id.as_deref(), Some("ext-123"));
        assert!(success.published_at.is_some());
    }

    #[test]
    fn conflicts_near_respects_window() {
        let (_dir, store) = store();
        let base = Utc::now();
        enqueue(&store, base);
        let conflicts = store
            .conflicts_near("tiktok", Some("acct-1"), base + Duration::minutes(30), Duration::minutes(60))
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        let no_conflicts = store
            .conflicts_near("tiktok", Some("acct-1"), base + Duration::hours(5), Duration::minutes(60))
            .unwrap();
        assert!(no_conflicts.is_empty());
    }

    #[test]
    fn cancel_is_rejected_for_terminal_logs() {
        let (_dir, store) = store();
        let log = enqueue(&store, Utc::now());
        store.mark_success(log.id, "ext-1", None).unwrap();
        let result = store.cancel(log.id);
        assert!(matches!(result, Err(QueueError::InvalidTransition { .. })));
    }

    #[test]
    fn stuck_logs_surfaces_idle_processing_entries() {
        let (_dir, store) = store();
        let now = Utc::now();
        let log = enqueue(&store, now - Duration::minutes(10));
        store.promote_due(now, Duration::seconds(0)).unwrap();
        store.fetch_next_due(now).unwrap().unwrap();
        let stuck = store.stuck_logs(now + Duration::minutes(30), Duration::minutes(15)).unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, log.id);
    }
}
