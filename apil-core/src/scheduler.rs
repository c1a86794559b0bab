//! Auto-Scheduler / APIL (C1): scores a clip candidate, asks the forecast
//! oracle for a slot, and resolves conflicts against the publication queue.
//! The weighted-scoring shape is the teacher's `Planner::score_candidates`
//! generalized from a single curation/trending/diversity blend to the
//! priority formula this platform scores clips with.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::PlatformsConfig;
use crate::ledger::{LedgerError, LedgerStore, NewLedgerEvent, Severity};
use crate::model::{Clip, Platform};
use crate::queue::{NewPublishLog, PublishLog, PublishLogStore, QueueError, ScheduledBy};

use crate::forecast::{self, ForecastWindow};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("platform not configured: {0}")]
    PlatformNotConfigured(String),
    #[error("no slot available within the scheduling horizon")]
    NoSlotWithinHorizon,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

pub struct ScheduleRequest<'a> {
    pub clip: &'a Clip,
    pub platform: Platform,
    pub account_id: Option<String>,
    pub campaign_budgets_cents: i64,
    pub force_slot: Option<DateTime<Utc>>,
    pub scheduled_by: ScheduledBy,
    pub extra_metadata: serde_json::Value,
}

/// Resolves `platform`'s configured window, failing fatally if the
/// platform has no `platforms.toml` section — the required precondition
/// §4.1 calls out before a slot can be chosen at all.
pub fn resolve_window(platforms: &PlatformsConfig, platform: Platform) -> Result<ForecastWindow> {
    let section = platforms
        .get(platform.as_str())
        .ok_or_else(|| SchedulerError::PlatformNotConfigured(platform.as_str().to_string()))?;
    Ok(ForecastWindow {
        window_start_hour: section.window_start_hour,
        window_end_hour: section.window_end_hour,
        min_gap_minutes: section.min_gap_minutes,
    })
}

/// `priority = 0.4*visual + 0.3*engagement + 0.2*virality + 0.1*campaign_weight + delay_penalty`,
/// every component pre-clamped to `[0, 100]` and the sum capped at 100.
pub fn compute_priority(clip: &Clip, platform: Platform, campaign_budgets_cents: i64, now: DateTime<Utc>) -> f64 {
    let visual_score = clip.visual_score.clamp(0.0, 100.0);
    let engagement_score = clip.engagement_score().clamp(0.0, 100.0);
    let predicted_virality = (visual_score * 0.6 * platform.virality_multiplier()).clamp(0.0, 100.0);
    let campaign_weight = (campaign_budgets_cents as f64 / 50_000.0 * 100.0).min(100.0);
    let age_hours = clip.age_hours(now);
    let delay_penalty = if age_hours <= 24.0 {
        0.0
    } else if age_hours <= 48.0 {
        5.0
    } else if age_hours <= 72.0 {
        10.0
    } else {
        20.0
    };

    let priority = 0.4 * visual_score
        + 0.3 * engagement_score
        + 0.2 * predicted_virality
        + 0.1 * campaign_weight
        + delay_penalty;
    priority.min(100.0)
}

/// Schedules one clip, resolving conflicts within `window.min_gap_minutes`
/// of the chosen slot on the same `(platform, account_id)` partition.
/// Atomic per-partition: callers must serialize calls for the same
/// partition (the queue's `BEGIN IMMEDIATE` claim does not by itself
/// guarantee cross-insert atomicity here, so the scheduler expects a single
/// in-process scheduling authority per partition, mirrored after the
/// teacher's planner which runs single-threaded per tick).
pub fn schedule(
    queue: &PublishLogStore,
    ledger: &LedgerStore,
    window: ForecastWindow,
    horizon: Duration,
    request: &ScheduleRequest<'_>,
    now: DateTime<Utc>,
) -> Result<PublishLog> {
    let platform_str = request.platform.as_str();

    let slot = match request.force_slot {
        Some(slot) => slot,
        None => {
            let projection = forecast::forecast(
                queue,
                platform_str,
                request.account_id.as_deref(),
                window,
                now,
            )?;
            projection.next_available_slot
        }
    };

    if slot > now + horizon {
        ledger.record(NewLedgerEvent::new(
            "schedule_deferred_horizon_exceeded",
            "clip",
            &request.clip.id,
            Severity::Warn,
            serde_json::json!({"platform": platform_str, "requested_slot": slot}),
        ))?;
        return schedule_at_horizon_end(queue, request, platform_str, now, horizon);
    }

    let priority = compute_priority(request.clip, request.platform, request.campaign_budgets_cents, now);
    let gap = Duration::minutes(window.min_gap_minutes.max(1));

    let conflicts = queue.conflicts_near(platform_str, request.account_id.as_deref(), slot, gap)?;

    let mut final_slot = slot;
    if let Some(conflict) = conflicts.into_iter().next() {
        ledger.record(NewLedgerEvent::new(
            "schedule_conflict_detected",
            "publish_log",
            conflict.id.to_string(),
            Severity::Info,
            serde_json::json!({"candidate_slot": slot, "conflict_id": conflict.id}),
        ))?;

        if priority > conflict.priority() {
            let bumped_slot = forecast::forecast(
                queue,
                platform_str,
                request.account_id.as_deref(),
                window,
                slot + gap,
            )?
            .next_available_slot;
            queue.reschedule(conflict.id, bumped_slot)?;
            ledger.record(NewLedgerEvent::new(
                "schedule_conflict_resolved",
                "publish_log",
                conflict.id.to_string(),
                Severity::Info,
                serde_json::json!({"bumped_to": bumped_slot}),
            ))?;
            info!(target: "scheduler", conflict_id = conflict.id, "bumped lower-priority conflict");
        } else {
            let shifted = forecast::forecast(
                queue,
                platform_str,
                request.account_id.as_deref(),
                window,
                slot + gap,
            )?
            .next_available_slot;
            final_slot = shifted;
            warn!(target: "scheduler", clip_id = %request.clip.id, "yielding slot to higher-priority conflict");
        }
    }

    let log = queue.enqueue(NewPublishLog {
        clip_id: request.clip.id.clone(),
        platform: platform_str.to_string(),
        social_account_id: request.account_id.clone(),
        scheduled_for: Some(final_slot),
        max_retries: 3,
        scheduled_by: request.scheduled_by,
        extra_metadata: merge_metadata(&request.extra_metadata, serde_json::json!({"priority": priority})),
    })?;

    ledger.record(NewLedgerEvent::new(
        "publication_scheduled",
        "publish_log",
        log.id.to_string(),
        Severity::Info,
        serde_json::json!({"clip_id": request.clip.id, "platform": platform_str, "priority": priority}),
    ))?;

    Ok(log)
}

fn schedule_at_horizon_end(
    queue: &PublishLogStore,
    request: &ScheduleRequest<'_>,
    platform_str: &str,
    now: DateTime<Utc>,
    horizon: Duration,
) -> Result<PublishLog> {
    let log = queue.enqueue(NewPublishLog {
        clip_id: request.clip.id.clone(),
        platform: platform_str.to_string(),
        social_account_id: request.account_id.clone(),
        scheduled_for: Some(now + horizon),
        max_retries: 3,
        scheduled_by: request.scheduled_by,
        extra_metadata: merge_metadata(&request.extra_metadata, serde_json::json!({"priority": 0.0, "deferred": true})),
    })?;
    Ok(log)
}

/// Merges the scheduler's computed fields into the caller-supplied metadata,
/// with the computed fields winning on key collision.
fn merge_metadata(extra: &serde_json::Value, computed: serde_json::Value) -> serde_json::Value {
    let mut merged = extra.as_object().cloned().unwrap_or_default();
    if let serde_json::Value::Object(computed) = computed {
        merged.extend(computed);
    }
    serde_json::Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Clip;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn stores() -> (tempfile::TempDir, PublishLogStore, LedgerStore) {
        let dir = tempdir().unwrap();
        let queue = PublishLogStore::builder().path(dir.path().join("queue.sqlite")).build().unwrap();
        queue.initialize().unwrap();
        let ledger = LedgerStore::builder().path(dir.path().join("ledger.sqlite")).build().unwrap();
        ledger.initialize().unwrap();
        (dir, queue, ledger)
    }

    fn clip(visual_score: f64) -> Clip {
        Clip {
            id: "clip-1".into(),
            source_video_id: "video-1".into(),
            duration_ms: 15_000,
            visual_score,
            params: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    fn window() -> ForecastWindow {
        ForecastWindow {
            window_start_hour: 0,
            window_end_hour: 23,
            min_gap_minutes: 30,
        }
    }

    fn platforms_config(configured: &[&str]) -> PlatformsConfig {
        let mut platforms = HashMap::new();
        for name in configured {
            platforms.insert(
                name.to_string(),
                crate::config::PlatformSection {
                    window_start_hour: 0,
                    window_end_hour: 23,
                    min_gap_minutes: 30,
                },
            );
        }
        PlatformsConfig { platforms }
    }

    #[test]
    fn resolve_window_fails_for_unconfigured_platform() {
        let platforms = platforms_config(&["instagram"]);
        let result = resolve_window(&platforms, Platform::TikTok);
        assert!(matches!(result, Err(SchedulerError::PlatformNotConfigured(_))));
    }

    #[test]
    fn resolve_window_succeeds_for_configured_platform() {
        let platforms = platforms_config(&["tiktok"]);
        let window = resolve_window(&platforms, Platform::TikTok).unwrap();
        assert_eq!(window.min_gap_minutes, 30);
    }

    #[test]
    fn priority_caps_at_one_hundred() {
        let clip = clip(100.0);
        let now = Utc::now();
        let priority = compute_priority(&clip, Platform::TikTok, 1_000_000, now);
        assert!(priority <= 100.0);
    }

    #[test]
    fn schedule_enqueues_a_scheduled_log() {
        let (_dir, queue, ledger) = stores();
        let clip = clip(80.0);
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 10, 0, 0).unwrap();
        let request = ScheduleRequest {
            clip: &clip,
            platform: Platform::TikTok,
            account_id: Some("acct-1".into()),
            campaign_budgets_cents: 10_000,
            force_slot: None,
            scheduled_by: ScheduledBy::AutoIntelligence,
            extra_metadata: serde_json::json!({}),
        };
        let log = schedule(&queue, &ledger, window(), Duration::days(3), &request, now).unwrap();
        assert!(log.scheduled_for.is_some());
        assert_eq!(log.scheduled_by, ScheduledBy::AutoIntelligence);
    }

    #[test]
    fn higher_priority_bumps_lower_priority_conflict() {
        let (_dir, queue, ledger) = stores();
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 10, 0, 0).unwrap();

        let low = clip(10.0);
        let low_request = ScheduleRequest {
            clip: &low,
            platform: Platform::TikTok,
            account_id: Some("acct-1".into()),
            campaign_budgets_cents: 0,
            force_slot: Some(now),
            scheduled_by: ScheduledBy::AutoIntelligence,
            extra_metadata: serde_json::json!({}),
        };
        let low_log = schedule(&queue, &ledger, window(), Duration::days(3), &low_request, now).unwrap();

        let high = clip(95.0);
        let high_request = ScheduleRequest {
            clip: &high,
            platform: Platform::TikTok,
            account_id: Some("acct-1".into()),
            campaign_budgets_cents: 0,
            force_slot: Some(now),
            scheduled_by: ScheduledBy::AutoIntelligence,
            extra_metadata: serde_json::json!({}),
        };
        let high_log = schedule(&queue, &ledger, window(), Duration::days(3), &high_request, now).unwrap();

        assert_eq!(high_log.scheduled_for, Some(now));
        let bumped = queue.fetch(low_log.id).unwrap().unwrap();
        assert_ne!(bumped.scheduled_for, Some(now));
    }
}
