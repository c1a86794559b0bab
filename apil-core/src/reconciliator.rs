//! Reconciliator (C6): periodic sweep over stuck PublishLogs, the only
//! component allowed to bypass retry semantics to terminalize a log. The
//! sweep-then-decide shape mirrors the teacher's watchdog health-check loop
//! in `broadcaster/watchdog.rs`, generalized from process-liveness checks to
//! per-log webhook-or-timeout decisions.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::ledger::{LedgerError, LedgerStore, NewLedgerEvent, Severity};
use crate::queue::{PublishLogStore, QueueError};

#[derive(Debug, Error)]
pub enum ReconciliatorError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

pub type Result<T> = std::result::Result<T, ReconciliatorError>;

#[derive(Debug, Clone, Copy)]
pub struct ReconcileConfig {
    pub reconcile_window: Duration,
    pub timeout_threshold: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            reconcile_window: Duration::minutes(10),
            timeout_threshold: Duration::hours(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    ConfirmedSuccess,
    TimedOutFailed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub log_id: i64,
    pub outcome: ReconcileOutcome,
}

/// One sweep: inspect every `processing`/`retry` log idle past the
/// reconcile window, and decide webhook-confirmed success, timeout failure,
/// or skip (still plausibly in flight).
pub fn sweep(
    queue: &PublishLogStore,
    ledger: &LedgerStore,
    config: ReconcileConfig,
    now: DateTime<Utc>,
) -> Result<Vec<ReconcileReport>> {
    let stuck = queue.stuck_logs(now, config.reconcile_window)?;
    let mut reports = Vec::with_capacity(stuck.len());

    for log in stuck {
        let age = now - log.updated_at;
        let outcome = if log.webhook_received() {
            queue.reconcile_to_success(log.id)?;
            ledger.record(NewLedgerEvent::new(
                "publish_reconciled",
                "publish_log",
                log.id.to_string(),
                Severity::Info,
                serde_json::json!({"reason": "webhook_confirmed"}),
            ))?;
            info!(target: "reconciliator", log_id = log.id, "reconciled via webhook evidence");
            ReconcileOutcome::ConfirmedSuccess
        } else if age > config.timeout_threshold {
            queue.reconcile_to_failed(log.id, "webhook_timeout")?;
            ledger.record(NewLedgerEvent::new(
                "publish_reconciled",
                "publish_log",
                log.id.to_string(),
                Severity::Warn,
                serde_json::json!({"reason": "webhook_timeout", "age_seconds": age.num_seconds()}),
            ))?;
            warn!(target: "reconciliator", log_id = log.id, "reconciled via timeout");
            ReconcileOutcome::TimedOutFailed
        } else {
            ReconcileOutcome::Skipped
        };

        reports.push(ReconcileReport { log_id: log.id, outcome });
    }

    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{NewPublishLog, ScheduledBy};
    use serde_json::Map;
    use tempfile::tempdir;

    fn stores() -> (tempfile::TempDir, PublishLogStore, LedgerStore) {
        let dir = tempdir().unwrap();
        let queue = PublishLogStore::builder().path(dir.path().join("queue.sqlite")).build().unwrap();
        queue.initialize().unwrap();
        let ledger = LedgerStore::builder().path(dir.path().join("ledger.sqlite")).build().unwrap();
        ledger.initialize().unwrap();
        (dir, queue, ledger)
    }

    fn stuck_processing_log(queue: &PublishLogStore, now: DateTime<Utc>) -> i64 {
        let log = queue
            .enqueue(NewPublishLog {
                clip_id: "clip-1".into(),
                platform: "tiktok".into(),
                social_account_id: Some("acct-1".into()),
                scheduled_for: Some(now - Duration::minutes(30)),
                max_retries: 3,
                scheduled_by: ScheduledBy::AutoIntelligence,
                extra_metadata: serde_json::json!({}),
            })
            .unwrap();
        queue.promote_due(now, Duration::seconds(0)).unwrap();
        queue.fetch_next_due(now).unwrap().unwrap();
        log.id
    }

    #[test]
    fn webhook_confirmed_logs_are_marked_success() {
        let (_dir, queue, ledger) = stores();
        let now = Utc::now();
        let log_id = stuck_processing_log(&queue, now);
        let mut patch = Map::new();
        patch.insert("webhook_received".into(), serde_json::Value::Bool(true));
        queue.merge_webhook_metadata(log_id, patch).unwrap();

        let config = ReconcileConfig { reconcile_window: Duration::minutes(10), timeout_threshold: Duration::hours(1) };
        let reports = sweep(&queue, &ledger, config, now + Duration::minutes(15)).unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, ReconcileOutcome::ConfirmedSuccess);
        assert_eq!(queue.fetch(log_id).unwrap().unwrap().status.as_str(), "success");
    }

    #[test]
    fn timed_out_logs_without_webhook_are_failed() {
        let (_dir, queue, ledger) = stores();
        let now = Utc::now();
        let log_id = stuck_processing_log(&queue, now);

        let config = ReconcileConfig { reconcile_window: Duration::minutes(10), timeout_threshold: Duration::hours(1) };
        let reports = sweep(&queue, &ledger, config, now + Duration::hours(2)).unwrap();

        assert_eq!(reports[0].outcome, ReconcileOutcome::TimedOutFailed);
        assert_eq!(queue.fetch(log_id).unwrap().unwrap().status.as_str(), "failed");
    }

    #[test]
    fn recently_stuck_without_webhook_is_skipped() {
        let (_dir, queue, ledger) = stores();
        let now = Utc::now();
        let log_id = stuck_processing_log(&queue, now);

        let config = ReconcileConfig { reconcile_window: Duration::minutes(10), timeout_threshold: Duration::hours(1) };
        let reports = sweep(&queue, &ledger, config, now + Duration::minutes(15)).unwrap();

        assert_eq!(reports[0].outcome, ReconcileOutcome::Skipped);
        assert_eq!(queue.fetch(log_id).unwrap().unwrap().status.as_str(), "processing");
    }
}
