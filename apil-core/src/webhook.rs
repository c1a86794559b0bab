//! Webhook Ingestor (C5): accepts platform callbacks keyed by
//! `external_post_id` and merges evidence into a PublishLog's
//! `extra_metadata` without touching its status. Mirrors the teacher's
//! webhook-merge idiom in `monetization/economy.rs`'s ledger-write-without-
//! state-mutation pattern, generalized to the publish-log partition.

use chrono::Utc;
use serde_json::Map;
use thiserror::Error;

use crate::ledger::{LedgerError, LedgerStore, NewLedgerEvent, Severity};
use crate::queue::{PublishLog, PublishLogStore, QueueError};

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("missing external_post_id")]
    MissingExternalPostId,
    #[error("no publish log found for external_post_id {0}")]
    LogNotFound(String),
}

pub type Result<T> = std::result::Result<T, WebhookError>;

pub struct WebhookPayload {
    pub external_post_id: String,
    pub media_url: Option<String>,
    pub webhook_status: Option<String>,
}

/// Locates the log by `external_post_id` and merges webhook evidence.
/// Duplicate deliveries are idempotent: only the timestamp is refreshed.
pub fn ingest(queue: &PublishLogStore, ledger: &LedgerStore, payload: WebhookPayload) -> Result<PublishLog> {
    if payload.external_post_id.trim().is_empty() {
        return Err(WebhookError::MissingExternalPostId);
    }

    let log = find_by_external_post_id(queue, &payload.external_post_id)?
        .ok_or_else(|| WebhookError::LogNotFound(payload.external_post_id.clone()))?;

    let mut patch = Map::new();
    patch.insert("webhook_received".into(), serde_json::Value::Bool(true));
    patch.insert("webhook_timestamp".into(), serde_json::Value::String(Utc::now().to_rfc3339()));
    if let Some(media_url) = payload.media_url {
        patch.insert("media_url".into(), serde_json::Value::String(media_url));
    }
    if let Some(status) = payload.webhook_status {
        patch.insert("webhook_status".into(), serde_json::Value::String(status));
    }

    let updated = queue.merge_webhook_metadata(log.id, patch)?;

    ledger.record(NewLedgerEvent::new(
        "publish_webhook_received",
        "publish_log",
        updated.id.to_string(),
        Severity::Info,
        serde_json::json!({"external_post_id": payload.external_post_id}),
    ))?;

    Ok(updated)
}

fn find_by_external_post_id(queue: &PublishLogStore, external_post_id: &str) -> Result<Option<PublishLog>> {
    // Webhooks can arrive for logs still mid-flight, so no status filter.
    for log in queue.list_by_status(None, 10_000)? {
        if log.external_post_id.as_deref() == Some(external_post_id) {
            return Ok(Some(log));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{NewPublishLog, ScheduledBy};
    use tempfile::tempdir;

    fn stores() -> (tempfile::TempDir, PublishLogStore, LedgerStore) {
        let dir = tempdir().unwrap();
        let queue = PublishLogStore::builder().path(dir.path().join("queue.sqlite")).build().unwrap();
        queue.initialize().unwrap();
        let ledger = LedgerStore::builder().path(dir.path().join("ledger.sqlite")).build().unwrap();
        ledger.initialize().unwrap();
        (dir, queue, ledger)
    }

    #[test]
    fn ingest_merges_metadata_without_changing_status() {
        let (_dir, queue, ledger) = stores();
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
        queue.mark_success(log.id, "ext-123", None).unwrap();

        let updated = ingest(
            &queue,
            &ledger,
            WebhookPayload {
                external_post_id: "ext-123".into(),
                media_url: Some("https://cdn.example/clip.mp4".into()),
                webhook_status: Some("live".into()),
            },
        )
        .unwrap();

        assert!(updated.webhook_received());
        assert_eq!(updated.status.as_str(), "success");
    }

    #[test]
    fn ingest_resolves_a_log_still_processing() {
        let (_dir, queue, ledger) = stores();
        let now = Utc::now();
        let log = queue
            .enqueue(NewPublishLog {
                clip_id: "clip-1".into(),
                platform: "tiktok".into(),
                social_account_id: Some("acct-1".into()),
                scheduled_for: Some(now),
                max_retries: 3,
                scheduled_by: ScheduledBy::AutoIntelligence,
                extra_metadata: serde_json::json!({}),
            })
            .unwrap();
        queue.promote_due(now, chrono::Duration::seconds(0)).unwrap();
        queue.fetch_next_due(now).unwrap().unwrap();
        // Worker stamps the external id as soon as publish_post returns,
        // ahead of marking the log success.
        queue.record_external_post_id(log.id, "ext-456", None).unwrap();

        let updated = ingest(
            &queue,
            &ledger,
            WebhookPayload {
                external_post_id: "ext-456".into(),
                media_url: None,
                webhook_status: Some("live".into()),
            },
        )
        .unwrap();

        assert!(updated.webhook_received());
        assert_eq!(updated.status.as_str(), "processing");
    }

    #[test]
    fn missing_external_post_id_is_rejected() {
        let (_dir, queue, ledger) = stores();
        let result = ingest(
            &queue,
            &ledger,
            WebhookPayload {
                external_post_id: "".into(),
                media_url: None,
                webhook_status: None,
            },
        );
        assert!(matches!(result, Err(WebhookError::MissingExternalPostId)));
    }

    #[test]
    fn unknown_external_post_id_is_not_found() {
        let (_dir, queue, ledger) = stores();
        let result = ingest(
            &queue,
            &ledger,
            WebhookPayload {
                external_post_id: "no-such-post".into(),
                media_url: None,
                webhook_status: None,
            },
        );
        assert!(matches!(result, Err(WebhookError::LogNotFound(_))));
    }
}
