//! Forecast/Slot Oracle (C2): a pure per-platform window+gap model. Takes no
//! storage of its own — it reads the publication queue and the platform's
//! configured window to derive saturation and the next free slot, the same
//! derived-metrics shape as the teacher's `QueueMetrics`/`QueueSummary`
//! generalized from a single global queue to a `(platform, account)` axis.

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use serde::Serialize;

use crate::queue::{PublishLogStore, QueueError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaturationRisk {
    Low,
    Medium,
    High,
}

impl SaturationRisk {
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization < 0.5 {
            SaturationRisk::Low
        } else if utilization < 0.8 {
            SaturationRisk::Medium
        } else {
            SaturationRisk::High
        }
    }
}

/// A platform's publishing window, in local-day hours, plus the minimum gap
/// enforced between any two non-terminal slots on the same account.
#[derive(Debug, Clone, Copy)]
pub struct ForecastWindow {
    pub window_start_hour: u32,
    pub window_end_hour: u32,
    pub min_gap_minutes: i64,
}

impl ForecastWindow {
    pub fn max_slots_per_day(&self) -> i64 {
        let span_minutes = (self.window_end_hour.saturating_sub(self.window_start_hour)) as i64 * 60;
        if self.min_gap_minutes <= 0 {
            return 0;
        }
        span_minutes / self.min_gap_minutes
    }

    fn window_start_on(&self, day: DateTime<Utc>) -> DateTime<Utc> {
        day.date_naive()
            .and_hms_opt(self.window_start_hour, 0, 0)
            .and_then(|naive| Utc.from_local_datetime(&naive).single())
            .unwrap_or(day)
    }

    fn window_end_on(&self, day: DateTime<Utc>) -> DateTime<Utc> {
        day.date_naive()
            .and_hms_opt(self.window_end_hour, 0, 0)
            .and_then(|naive| Utc.from_local_datetime(&naive).single())
            .unwrap_or(day)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Forecast {
    pub platform: String,
    pub max_slots_per_day: i64,
    pub scheduled_today: i64,
    pub slots_remaining: i64,
    pub utilization: f64,
    pub risk: SaturationRisk,
    pub next_available_slot: DateTime<Utc>,
}

/// Computes the forecast for `(platform, account_id)` as of `now`, reading
/// the publication queue for today's occupancy and the latest non-terminal
/// slot already claimed on the partition.
pub fn forecast(
    store: &PublishLogStore,
    platform: &str,
    account_id: Option<&str>,
    window: ForecastWindow,
    now: DateTime<Utc>,
) -> std::result::Result<Forecast, QueueError> {
    let day_start = window.window_start_on(now);
    let day_end = window.window_end_on(now);
    let scheduled_today = store.count_scheduled_in_window(platform, account_id, day_start, day_end)?;

    let max_slots_per_day = window.max_slots_per_day();
    let slots_remaining = (max_slots_per_day - scheduled_today).max(0);
    let utilization = if max_slots_per_day > 0 {
        scheduled_today as f64 / max_slots_per_day as f64
    } else {
        1.0
    };
    let risk = SaturationRisk::from_utilization(utilization);

    let latest = store.latest_scheduled(platform, account_id)?;
    let next_available_slot = next_free_slot(window, now, latest);

    Ok(Forecast {
        platform: platform.to_string(),
        max_slots_per_day,
        scheduled_today,
        slots_remaining,
        utilization,
        risk,
        next_available_slot,
    })
}

/// First instant `>= now`, inside today's remaining window (or the next
/// day's window if today is exhausted), and `>= min_gap` after the latest
/// non-terminal `scheduled_for` already on the partition.
fn next_free_slot(
    window: ForecastWindow,
    now: DateTime<Utc>,
    latest_scheduled: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    let gap = Duration::minutes(window.min_gap_minutes.max(1));
    let mut candidate = now;
    if let Some(latest) = latest_scheduled {
        candidate = candidate.max(latest + gap);
    }

    for day_offset in 0..=7 {
        let day = now + Duration::days(day_offset);
        let start = window.window_start_on(day);
        let end = window.window_end_on(day);
        if candidate < start {
            candidate = start;
        }
        if candidate <= end && candidate.hour() >= window.window_start_hour {
            return candidate;
        }
        candidate = window.window_start_on(day + Duration::days(1));
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{NewPublishLog, PublishLogStore, ScheduledBy};
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

    fn window() -> ForecastWindow {
        ForecastWindow {
            window_start_hour: 8,
            window_end_hour: 22,
            min_gap_minutes: 30,
        }
    }

    #[test]
    fn empty_queue_is_low_risk_with_slot_now() {
        let (_dir, store) = store();
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 12, 0, 0).unwrap();
        let result = forecast(&store, "tiktok", Some("acct-1"), window(), now).unwrap();
        assert_eq!(result.scheduled_today, 0);
        assert_eq!(result.risk, SaturationRisk::Low);
        assert_eq!(result.next_available_slot, now);
    }

    #[test]
    fn next_slot_respects_min_gap_after_latest() {
        let (_dir, store) = store();
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 12, 0, 0).unwrap();
        store
            .enqueue(NewPublishLog {
                clip_id: "clip-1".into(),
                platform: "tiktok".into(),
                social_account_id: Some("acct-1".into()),
                scheduled_for: Some(now + Duration::minutes(5)),
                max_retries: 3,
                scheduled_by: ScheduledBy::AutoIntelligence,
                extra_metadata: serde_json::json!({"priority": 10.0}),
            })
            .unwrap();

        let result = forecast(&store, "tiktok", Some("acct-1"), window(), now).unwrap();
        assert_eq!(result.scheduled_today, 1);
        assert!(result.next_available_slot >= now + Duration::minutes(5) + Duration::minutes(30));
    }

    #[test]
    fn saturation_climbs_to_high_risk() {
        let (_dir, store) = store();
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 9, 0, 0).unwrap();
        let max_slots = window().max_slots_per_day();
        for i in 0..((max_slots as f64 * 0.85) as i64) {
            store
                .enqueue(NewPublishLog {
                    clip_id: format!("clip-{i}"),
                    platform: "tiktok".into(),
                    social_account_id: Some("acct-1".into()),
                    scheduled_for: Some(now + Duration::minutes(i * 30)),
                    max_retries: 3,
                    scheduled_by: ScheduledBy::AutoIntelligence,
                    extra_metadata: serde_json::json!({"priority": 10.0}),
                })
                .unwrap();
        }
        let result = forecast(&store, "tiktok", Some("acct-1"), window(), now).unwrap();
        assert_eq!(result.risk, SaturationRisk::High);
    }
}
