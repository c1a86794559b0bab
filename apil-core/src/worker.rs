//! Publishing Worker (C4): drains the publication queue and drives the
//! provider abstraction. The tick shape (interval, pause flag, per-item
//! timeout) is the teacher's `DailyScheduler::run_scheduler_loop`
//! generalized from a single daily cycle to a continuously-polled queue.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::{interval, sleep, timeout};
use tracing::{error, info, warn};

use crate::identity::{IdentityError, IdentityRouter};
use crate::ledger::{LedgerError, LedgerStore, NewLedgerEvent, Severity};
use crate::provider::{PlatformProvider, ProviderError};
use crate::queue::{PublishLog, PublishLogStore, QueueError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub poll_interval: StdDuration,
    pub publish_timeout: StdDuration,
    pub max_backoff: StdDuration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: StdDuration::from_secs(5),
            publish_timeout: StdDuration::from_secs(30),
            max_backoff: StdDuration::from_secs(60),
        }
    }
}

/// `delay = 1.0 * 2^(retry_count-1)` seconds, capped at `max_backoff`.
pub fn backoff_delay(retry_count: i64, max_backoff: StdDuration) -> StdDuration {
    if retry_count <= 0 {
        return StdDuration::from_secs(0);
    }
    let secs = 2f64.powi((retry_count - 1) as i32);
    StdDuration::from_secs_f64(secs).min(max_backoff)
}

/// Drives one publish attempt for `log` to completion, mutating the queue
/// and ledger. Separated from the loop driver so tests can exercise a
/// single tick deterministically.
pub async fn process_one(
    queue: &PublishLogStore,
    ledger: &LedgerStore,
    identity: &mut IdentityRouter,
    provider: &dyn PlatformProvider,
    log: &PublishLog,
) -> Result<()> {
    let account_id = match &log.social_account_id {
        Some(id) => id.clone(),
        None => {
            queue.mark_failed_fatal(log.id, "no social_account_id on publish log")?;
            ledger.record(NewLedgerEvent::new(
                "publish_worker_log_failed",
                "publish_log",
                log.id.to_string(),
                Severity::Error,
                serde_json::json!({"reason": "missing_account"}),
            ))?;
            return Ok(());
        }
    };

    if identity.validate(&account_id).is_err() {
        ledger.record(NewLedgerEvent::new(
            "isolation_violation",
            "publish_log",
            log.id.to_string(),
            Severity::Error,
            serde_json::json!({"account_id": account_id}),
        ))?;
        warn!(target: "publishing_worker", account_id = %account_id, "identity missing, fail-fast");
        return Ok(());
    }

    let upload_result = provider
        .upload_creative(&account_id, &log.clip_id, &log.clip_id)
        .await;

    let publish_result = match upload_result {
        Ok(creative_ref) => provider.publish_post(&account_id, &creative_ref, "").await,
        Err(error) => Err(error),
    };

    match publish_result {
        Ok(outcome) => {
            queue.record_external_post_id(log.id, &outcome.external_post_id, outcome.external_url.as_deref())?;
            queue.mark_success(log.id, &outcome.external_post_id, outcome.external_url.as_deref())?;
            ledger.record(NewLedgerEvent::new(
                "publish_successful",
                "publish_log",
                log.id.to_string(),
                Severity::Info,
                serde_json::json!({"external_post_id": outcome.external_post_id}),
            ))?;
            info!(target: "publishing_worker", log_id = log.id, "publish successful");
        }
        Err(error) => handle_failure(queue, ledger, log, error)?,
    }

    Ok(())
}

fn handle_failure(
    queue: &PublishLogStore,
    ledger: &LedgerStore,
    log: &PublishLog,
    error: ProviderError,
) -> Result<()> {
    let message = error.to_string();
    if error.is_retryable() {
        let updated = queue.mark_retry_or_failed(log.id, &message)?;
        let event_type = if updated.status.as_str() == "failed" {
            "publish_worker_log_failed"
        } else {
            "publish_worker_log_retry"
        };
        ledger.record(NewLedgerEvent::new(
            event_type,
            "publish_log",
            log.id.to_string(),
            Severity::Warn,
            serde_json::json!({"error": message, "retry_count": updated.retry_count}),
        ))?;
    } else {
        queue.mark_failed_fatal(log.id, &message)?;
        ledger.record(NewLedgerEvent::new(
            "publish_worker_log_failed",
            "publish_log",
            log.id.to_string(),
            Severity::Error,
            serde_json::json!({"error": message, "fatal": true}),
        ))?;
    }
    Ok(())
}

/// Continuous loop: promote due slots, claim the next one, publish it,
/// sleep for `config.poll_interval` (doubled transiently after a retry to
/// smooth thundering herds), repeat.
pub async fn run_loop(
    queue: Arc<PublishLogStore>,
    ledger: Arc<LedgerStore>,
    identity: Arc<tokio::sync::Mutex<IdentityRouter>>,
    provider: Arc<dyn PlatformProvider>,
    config: WorkerConfig,
    paused: Arc<std::sync::atomic::AtomicBool>,
) -> Result<()> {
    let mut tick = interval(config.poll_interval);
    let mut current_interval = config.poll_interval;

    loop {
        tick.tick().await;

        if paused.load(std::sync::atomic::Ordering::Relaxed) {
            continue;
        }

        let now = Utc::now();
        if let Err(err) = queue.promote_due(now, chrono::Duration::seconds(5)) {
            error!(target: "publishing_worker", error = %err, "failed to promote due logs");
            continue;
        }

        let claimed = match queue.fetch_next_due(now) {
            Ok(claimed) => claimed,
            Err(err) => {
                error!(target: "publishing_worker", error = %err, "failed to claim next due log");
                continue;
            }
        };

        let Some(log) = claimed else {
            if current_interval != config.poll_interval {
                current_interval = config.poll_interval;
                tick = interval(current_interval);
            }
            continue;
        };

        let mut identity_guard = identity.lock().await;
        let outcome = timeout(
            config.publish_timeout,
            process_one(&queue, &ledger, &mut identity_guard, provider.as_ref(), &log),
        )
        .await;
        drop(identity_guard);

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(target: "publishing_worker", error = %err, log_id = log.id, "tick error"),
            Err(_) => {
                warn!(target: "publishing_worker", log_id = log.id, "publish attempt timed out");
                let _ = queue.mark_retry_or_failed(log.id, "publish timed out");
            }
        }

        if let Ok(Some(refreshed)) = queue.fetch(log.id) {
            if refreshed.status.as_str() == "retry" {
                let delay = backoff_delay(refreshed.retry_count, config.max_backoff);
                sleep(delay).await;
                current_interval = current_interval.saturating_mul(2).min(config.max_backoff);
                tick = interval(current_interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{DeviceClass, IdentityClass, IdentityRouter};
    use crate::provider::{ProviderError, SimulatedProvider};
    use crate::queue::{NewPublishLog, ScheduledBy};
    use tempfile::tempdir;

    fn stores() -> (tempfile::TempDir, PublishLogStore, LedgerStore, IdentityRouter) {
        let dir = tempdir().unwrap();
        let queue = PublishLogStore::builder().path(dir.path().join("queue.sqlite")).build().unwrap();
        queue.initialize().unwrap();
        let ledger = LedgerStore::builder().path(dir.path().join("ledger.sqlite")).build().unwrap();
        ledger.initialize().unwrap();
        let identity = IdentityRouter::builder().path(dir.path().join("identity.sqlite")).build().unwrap();
        identity.initialize().unwrap();
        (dir, queue, ledger, identity)
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff_delay(0, StdDuration::from_secs(60)), StdDuration::from_secs(0));
        assert_eq!(backoff_delay(1, StdDuration::from_secs(60)), StdDuration::from_secs(1));
        assert_eq!(backoff_delay(2, StdDuration::from_secs(60)), StdDuration::from_secs(2));
        assert_eq!(backoff_delay(10, StdDuration::from_secs(60)), StdDuration::from_secs(60));
    }

    #[tokio::test]
    async fn process_one_succeeds_with_valid_identity() {
        let (_dir, queue, ledger, mut identity) = stores();
        identity
            .assign("acct-1", DeviceClass::Android, IdentityClass::AccountPool, &["proxy-1".to_string()])
            .unwrap();
        let log = queue
            .enqueue(NewPublishLog {
                clip_id: "clip-1".into(),
                platform: "tiktok".into(),
                social_account_id: Some("acct-1".into()),
                scheduled_for: Some(Utc::now()),
                max_retries: 3,
                scheduled_by: ScheduledBy::AutoIntelligence,
                extra_metadata: serde_json::json!({}),
            })
            .unwrap();

        let provider = SimulatedProvider::new();
        process_one(&queue, &ledger, &mut identity, &provider, &log).await.unwrap();

        let refreshed = queue.fetch(log.id).unwrap().unwrap();
        assert_eq!(refreshed.status.as_str(), "success");
        assert!(refreshed.external_post_id.is_some());
    }

    #[tokio::test]
    async fn retryable_error_moves_log_to_retry() {
        let (_dir, queue, ledger, mut identity) = stores();
        identity
            .assign("acct-1", DeviceClass::Android, IdentityClass::AccountPool, &["proxy-1".to_string()])
            .unwrap();
        let log = queue
            .enqueue(NewPublishLog {
                clip_id: "clip-1".into(),
                platform: "tiktok".into(),
                social_account_id: Some("acct-1".into()),
                scheduled_for: Some(Utc::now()),
                max_retries: 3,
                scheduled_by: ScheduledBy::AutoIntelligence,
                extra_metadata: serde_json::json!({}),
            })
            .unwrap();

        let provider = SimulatedProvider::failing(ProviderError::Network("timeout".into()));
        process_one(&queue, &ledger, &mut identity, &provider, &log).await.unwrap();

        let refreshed = queue.fetch(log.id).unwrap().unwrap();
        assert_eq!(refreshed.status.as_str(), "retry");
        assert_eq!(refreshed.retry_count, 1);
    }

    #[tokio::test]
    async fn fatal_error_skips_retry() {
        let (_dir, queue, ledger, mut identity) = stores();
        identity
            .assign("acct-1", DeviceClass::Android, IdentityClass::AccountPool, &["proxy-1".to_string()])
            .unwrap();
        let log = queue
            .enqueue(NewPublishLog {
                clip_id: "clip-1".into(),
                platform: "tiktok".into(),
                social_account_id: Some("acct-1".into()),
                scheduled_for: Some(Utc::now()),
                max_retries: 3,
                scheduled_by: ScheduledBy::AutoIntelligence,
                extra_metadata: serde_json::json!({}),
            })
            .unwrap();

        let provider = SimulatedProvider::failing(ProviderError::Auth("bad token".into()));
        process_one(&queue, &ledger, &mut identity, &provider, &log).await.unwrap();

        let refreshed = queue.fetch(log.id).unwrap().unwrap();
        assert_eq!(refreshed.status.as_str(), "failed");
        assert_eq!(refreshed.retry_count, 0);
    }

    #[tokio::test]
    async fn missing_identity_leaves_log_pending_and_records_ledger_error() {
        let (_dir, queue, ledger, mut identity) = stores();
        let now = Utc::now();
        let log = queue
            .enqueue(NewPublishLog {
                clip_id: "clip-1".into(),
                platform: "tiktok".into(),
                social_account_id: Some("ghost".into()),
                scheduled_for: Some(now),
                max_retries: 3,
                scheduled_by: ScheduledBy::AutoIntelligence,
                extra_metadata: serde_json::json!({}),
            })
            .unwrap();
        queue.promote_due(now, chrono::Duration::seconds(0)).unwrap();

        let provider = SimulatedProvider::new();
        process_one(&queue, &ledger, &mut identity, &provider, &log).await.unwrap();

        let refreshed = queue.fetch(log.id).unwrap().unwrap();
        assert_eq!(refreshed.status.as_str(), "pending");

        let events = ledger.for_entity("publish_log", &log.id.to_string(), 10).unwrap();
        assert!(events.iter().any(|event| event.event_type == "isolation_violation"));
    }
}
