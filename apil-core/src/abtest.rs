//! A/B Evaluator (C8): embargoes a test until enough data has accrued,
//! scores variants by a composite ROAS/CTR/CPC blend, runs a chi-square
//! sanity check, and publishes the winner back through the scheduler.
//! Grounded on the teacher's `Planner::score_candidates` weighted-blend
//! shape, generalized to a provider-metrics-driven variant comparison.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::{LedgerError, LedgerStore, NewLedgerEvent, Severity};
use crate::model::{Clip, Platform};
use crate::queue::{PublishLogStore, QueueError, ScheduledBy};
use crate::scheduler::{self, ScheduleRequest, SchedulerError};
use crate::sqlite::configure_connection;

const SCHEMA: &str = include_str!("../../sql/abtest.sql");

#[derive(Debug, Error)]
pub enum AbTestError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("store path not configured")]
    MissingStore,
    #[error("ab test {0} not found")]
    NotFound(i64),
    #[error("a test requires at least two variants")]
    TooFewVariants,
    #[error("only completed tests can publish a winner, test {0} is {1}")]
    NotCompleted(i64, String),
    #[error("only active or evaluating tests can be evaluated, test {0} is {1}")]
    NotEvaluable(i64, String),
}

pub type Result<T> = std::result::Result<T, AbTestError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbTestStatus {
    Active,
    Evaluating,
    Completed,
    Archived,
    NeedsMoreData,
}

impl AbTestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbTestStatus::Active => "active",
            AbTestStatus::Evaluating => "evaluating",
            AbTestStatus::Completed => "completed",
            AbTestStatus::Archived => "archived",
            AbTestStatus::NeedsMoreData => "needs_more_data",
        }
    }
}

impl std::str::FromStr for AbTestStatus {
    type Err = String;
    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "active" => Ok(AbTestStatus::Active),
            "evaluating" => Ok(AbTestStatus::Evaluating),
            "completed" => Ok(AbTestStatus::Completed),
            "archived" => Ok(AbTestStatus::Archived),
            "needs_more_data" => Ok(AbTestStatus::NeedsMoreData),
            other => Err(format!("unknown ab test status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Variant {
    pub clip_id: String,
    pub ad_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantMetrics {
    pub ad_id: String,
    pub impressions: i64,
    pub clicks: i64,
    pub conversions: i64,
    pub roas: f64,
    pub ctr: f64,
    pub cpc: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AbTest {
    pub id: i64,
    pub campaign_id: String,
    pub platform: Platform,
    pub account_id: Option<String>,
    pub variants: Vec<Variant>,
    pub status: AbTestStatus,
    pub winner_clip_id: Option<String>,
    pub published_winner_log_id: Option<i64>,
    pub min_impressions: i64,
    pub min_duration_hours: i64,
    pub start_time: DateTime<Utc>,
}

impl AbTest {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get("status")?;
        let platform: String = row.get("platform")?;
        let variants_raw: String = row.get("variants")?;
        Ok(Self {
            id: row.get("id")?,
            campaign_id: row.get("campaign_id")?,
            platform: platform.parse().unwrap_or(Platform::TikTok),
            account_id: row.get("account_id")?,
            variants: serde_json::from_str(&variants_raw).unwrap_or_default(),
            status: status.parse().unwrap_or(AbTestStatus::Active),
            winner_clip_id: row.get("winner_clip_id")?,
            published_winner_log_id: row.get("published_winner_log_id")?,
            min_impressions: row.get("min_impressions")?,
            min_duration_hours: row.get("min_duration_hours")?,
            start_time: row.get("start_time")?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatisticalResults {
    pub chi2: f64,
    pub p_value: f64,
    pub significant: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationOutcome {
    pub status: AbTestStatus,
    pub winner_ad_id: Option<String>,
    pub confidence: f64,
    pub statistical_results: Option<StatisticalResults>,
}

pub struct NewAbTest {
    pub campaign_id: String,
    pub platform: Platform,
    pub account_id: Option<String>,
    pub variants: Vec<Variant>,
    pub min_impressions: i64,
    pub min_duration_hours: i64,
    pub start_time: DateTime<Utc>,
}

#[derive(Default)]
pub struct AbTestStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl AbTestStoreBuilder {
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

    pub fn build(self) -> Result<AbTestStore> {
        let path = self.path.ok_or(AbTestError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        let conn = Connection::open_with_flags(&path, flags)?;
        configure_connection(&conn)?;
        Ok(AbTestStore { conn })
    }
}

pub struct AbTestStore {
    conn: Connection,
}

impl AbTestStore {
    pub fn builder() -> AbTestStoreBuilder {
        AbTestStoreBuilder::new()
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn create(&self, test: NewAbTest) -> Result<AbTest> {
        if test.variants.len() < 2 {
            return Err(AbTestError::TooFewVariants);
        }
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO ab_tests
                (campaign_id, platform, account_id, variants, metrics_keys, status, min_impressions,
                 min_duration_hours, created_at, start_time)
             VALUES (?1, ?2, ?3, ?4, '[\"roas\",\"ctr\",\"cpc\"]', 'active', ?5, ?6, ?7, ?8)",
            params![
                test.campaign_id,
                test.platform.as_str(),
                test.account_id,
                serde_json::to_string(&test.variants)?,
                test.min_impressions,
                test.min_duration_hours,
                now,
                test.start_time,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.fetch(id)?.ok_or(AbTestError::NotFound(id))
    }

    pub fn fetch(&self, id: i64) -> Result<Option<AbTest>> {
        self.conn
            .query_row("SELECT * FROM ab_tests WHERE id = ?1", params![id], AbTest::from_row)
            .optional()
            .map_err(AbTestError::from)
    }

    /// Applies the embargo, composite score and chi-square sanity check.
    /// Transitions `active/evaluating -> completed` once a winner clears
    /// embargo, or stays/returns to `needs_more_data` otherwise.
    pub fn evaluate(&self, id: i64, metrics: &[VariantMetrics], now: DateTime<Utc>) -> Result<EvaluationOutcome> {
        let test = self.fetch(id)?.ok_or(AbTestError::NotFound(id))?;
        if !matches!(test.status, AbTestStatus::Active | AbTestStatus::Evaluating) {
            return Err(AbTestError::NotEvaluable(id, test.status.as_str().to_string()));
        }

        let elapsed_hours = (now - test.start_time).num_hours();
        let embargo_cleared = elapsed_hours >= test.min_duration_hours;
        let enough_impressions = metrics.iter().all(|m| m.impressions >= test.min_impressions);

        if !embargo_cleared || !enough_impressions {
            self.set_status(id, AbTestStatus::NeedsMoreData)?;
            return Ok(EvaluationOutcome {
                status: AbTestStatus::NeedsMoreData,
                winner_ad_id: None,
                confidence: 0.0,
                statistical_results: None,
            });
        }

        let stats = chi_square_sanity(metrics);
        let winner = composite_score_winner(metrics);

        let confidence = if stats.significant { 0.9 } else { 0.55 };

        if let Some(winner) = &winner {
            self.conn.execute(
                "UPDATE ab_tests SET status = 'completed', winner_clip_id = ?1, winner_decided_at = ?2,
                 statistical_results = ?3 WHERE id = ?4",
                params![
                    winner_clip_id_for(&test, &winner.ad_id),
                    Utc::now(),
                    serde_json::to_string(&stats)?,
                    id,
                ],
            )?;
        }

        Ok(EvaluationOutcome {
            status: AbTestStatus::Completed,
            winner_ad_id: winner.map(|w| w.ad_id),
            confidence,
            statistical_results: Some(stats),
        })
    }

    fn set_status(&self, id: i64, status: AbTestStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE ab_tests SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    /// Routes the winner through the scheduler as a priority candidate, so
    /// platform windows and conflict resolution apply the same as any other
    /// scheduled publication. Idempotent: once `published_winner_log_id` is
    /// set, returns that id without scheduling again.
    pub fn publish_winner(
        &self,
        queue: &PublishLogStore,
        ledger: &LedgerStore,
        window: crate::forecast::ForecastWindow,
        horizon: Duration,
        id: i64,
    ) -> Result<i64> {
        let test = self.fetch(id)?.ok_or(AbTestError::NotFound(id))?;
        if test.status != AbTestStatus::Completed {
            return Err(AbTestError::NotCompleted(id, test.status.as_str().to_string()));
        }
        if let Some(existing) = test.published_winner_log_id {
            return Ok(existing);
        }

        let winner_clip_id = test
            .winner_clip_id
            .clone()
            .ok_or(AbTestError::NotCompleted(id, "no winner recorded".into()))?;

        let now = Utc::now();
        let winner_clip = Clip {
            id: winner_clip_id.clone(),
            source_video_id: winner_clip_id.clone(),
            duration_ms: 0,
            visual_score: 100.0,
            params: Default::default(),
            created_at: now,
        };

        let request = ScheduleRequest {
            clip: &winner_clip,
            platform: test.platform,
            account_id: test.account_id.clone(),
            campaign_budgets_cents: 0,
            force_slot: None,
            scheduled_by: ScheduledBy::AbWinner,
            extra_metadata: serde_json::json!({"ab_test_id": id}),
        };
        let log = scheduler::schedule(queue, ledger, window, horizon, &request, now)?;

        self.conn.execute(
            "UPDATE ab_tests SET published_winner_log_id = ?1 WHERE id = ?2",
            params![log.id, id],
        )?;

        ledger.record(NewLedgerEvent::new(
            "ab_winner_published",
            "ab_test",
            id.to_string(),
            Severity::Info,
            serde_json::json!({"winner_clip_id": winner_clip_id, "publish_log_id": log.id}),
        ))?;

        Ok(log.id)
    }
}

fn winner_clip_id_for(test: &AbTest, ad_id: &str) -> Option<String> {
    test.variants.iter().find(|v| v.ad_id == ad_id).map(|v| v.clip_id.clone())
}

/// `score = 0.5*ROAS + 0.3*CTR + 0.2*inv_CPC_normalized`, ties broken by
/// higher absolute conversions then earlier `ad_id` (first in input order).
fn composite_score_winner(metrics: &[VariantMetrics]) -> Option<VariantMetrics> {
    let max_cpc = metrics.iter().map(|m| m.cpc).fold(0.0_f64, f64::max);
    let mut best: Option<(f64, &VariantMetrics, usize)> = None;

    for (index, metric) in metrics.iter().enumerate() {
        let inv_cpc_normalized = if max_cpc > 0.0 {
            (1.0 - metric.cpc / max_cpc).max(0.0)
        } else {
            0.0
        };
        let score = 0.5 * metric.roas + 0.3 * metric.ctr + 0.2 * inv_cpc_normalized;

        let is_better = match &best {
            None => true,
            Some((best_score, best_metric, _)) => {
                score > *best_score
                    || (score == *best_score && metric.conversions > best_metric.conversions)
            }
        };
        if is_better {
            best = Some((score, metric, index));
        }
    }

    best.map(|(_, metric, _)| metric.clone())
}

/// Chi-square test on clicks vs. non-click impressions across all variants
/// at alpha=0.05 (critical value for df = variants-1, approximated by a
/// lookup for the common small-k cases this system sees).
fn chi_square_sanity(metrics: &[VariantMetrics]) -> StatisticalResults {
    let total_clicks: f64 = metrics.iter().map(|m| m.clicks as f64).sum();
    let total_impressions: f64 = metrics.iter().map(|m| m.impressions as f64).sum();
    if total_impressions == 0.0 {
        return StatisticalResults { chi2: 0.0, p_value: 1.0, significant: false };
    }
    let overall_rate = total_clicks / total_impressions;

    let mut chi2 = 0.0;
    for metric in metrics {
        let expected_clicks = overall_rate * metric.impressions as f64;
        let expected_non_clicks = (1.0 - overall_rate) * metric.impressions as f64;
        let observed_clicks = metric.clicks as f64;
        let observed_non_clicks = (metric.impressions - metric.clicks) as f64;

        if expected_clicks > 0.0 {
            chi2 += (observed_clicks - expected_clicks).powi(2) / expected_clicks;
        }
        if expected_non_clicks > 0.0 {
            chi2 += (observed_non_clicks - expected_non_clicks).powi(2) / expected_non_clicks;
        }
    }

    let df = (metrics.len().saturating_sub(1)).max(1) as f64;
    let critical_value = critical_value_for_df(df as usize);
    let significant = chi2 > critical_value;
    let p_value = if significant { 0.03 } else { 0.3 };

    StatisticalResults { chi2, p_value, significant }
}

fn critical_value_for_df(df: usize) -> f64 {
    match df {
        1 => 3.841,
        2 => 5.991,
        3 => 7.815,
        4 => 9.488,
        _ => 11.07,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn stores() -> (tempfile::TempDir, AbTestStore, PublishLogStore, LedgerStore) {
        let dir = tempdir().unwrap();
        let abtest = AbTestStore::builder().path(dir.path().join("abtest.sqlite")).build().unwrap();
        abtest.initialize().unwrap();
        let queue = PublishLogStore::builder().path(dir.path().join("queue.sqlite")).build().unwrap();
        queue.initialize().unwrap();
        let ledger = LedgerStore::builder().path(dir.path().join("ledger.sqlite")).build().unwrap();
        ledger.initialize().unwrap();
        (dir, abtest, queue, ledger)
    }

    fn variants() -> Vec<Variant> {
        vec![
            Variant { clip_id: "clip-a".into(), ad_id: "ad-a".into() },
            Variant { clip_id: "clip-b".into(), ad_id: "ad-b".into() },
        ]
    }

    fn window() -> crate::forecast::ForecastWindow {
        crate::forecast::ForecastWindow {
            window_start_hour: 0,
            window_end_hour: 23,
            min_gap_minutes: 30,
        }
    }

    #[test]
    fn embargo_blocks_early_evaluation() {
        let (_dir, abtest, _queue, _ledger) = stores();
        let start = Utc::now();
        let test = abtest
            .create(NewAbTest {
                campaign_id: "camp-1".into(),
                platform: Platform::TikTok,
                account_id: Some("acct-1".into()),
                variants: variants(),
                min_impressions: 1000,
                min_duration_hours: 48,
                start_time: start,
            })
            .unwrap();

        let metrics = vec![
            VariantMetrics { ad_id: "ad-a".into(), impressions: 2000, clicks: 100, conversions: 10, roas: 2.5, ctr: 0.05, cpc: 0.5 },
            VariantMetrics { ad_id: "ad-b".into(), impressions: 2000, clicks: 80, conversions: 8, roas: 2.0, ctr: 0.04, cpc: 0.6 },
        ];
        let outcome = abtest.evaluate(test.id, &metrics, start + Duration::hours(5)).unwrap();
        assert_eq!(outcome.status, AbTestStatus::NeedsMoreData);
    }

    #[test]
    fn higher_composite_score_wins() {
        let (_dir, abtest, queue, ledger) = stores();
        let start = Utc::now() - Duration::hours(72);
        let test = abtest
            .create(NewAbTest {
                campaign_id: "camp-1".into(),
                platform: Platform::TikTok,
                account_id: Some("acct-1".into()),
                variants: variants(),
                min_impressions: 1000,
                min_duration_hours: 48,
                start_time: start,
            })
            .unwrap();

        let metrics = vec![
            VariantMetrics { ad_id: "ad-a".into(), impressions: 5000, clicks: 500, conversions: 50, roas: 3.0, ctr: 0.1, cpc: 0.4 },
            VariantMetrics { ad_id: "ad-b".into(), impressions: 5000, clicks: 100, conversions: 10, roas: 1.2, ctr: 0.02, cpc: 0.9 },
        ];
        let outcome = abtest.evaluate(test.id, &metrics, Utc::now()).unwrap();
        assert_eq!(outcome.status, AbTestStatus::Completed);
        assert_eq!(outcome.winner_ad_id.as_deref(), Some("ad-a"));

        let log_id = abtest.publish_winner(&queue, &ledger, window(), Duration::days(3), test.id).unwrap();
        let log = queue.fetch(log_id).unwrap().unwrap();
        assert_eq!(log.clip_id, "clip-a");
        assert_eq!(log.platform, "tiktok");
        assert_eq!(log.scheduled_by, ScheduledBy::AbWinner);

        let second_call = abtest.publish_winner(&queue, &ledger, window(), Duration::days(3), test.id).unwrap();
        assert_eq!(second_call, log_id);
    }

    #[test]
    fn too_few_variants_is_rejected() {
        let (_dir, abtest, _queue, _ledger) = stores();
        let result = abtest.create(NewAbTest {
            campaign_id: "camp-1".into(),
            platform: Platform::TikTok,
            account_id: None,
            variants: vec![Variant { clip_id: "clip-a".into(), ad_id: "ad-a".into() }],
            min_impressions: 1000,
            min_duration_hours: 48,
            start_time: Utc::now(),
        });
        assert!(matches!(result, Err(AbTestError::TooFewVariants)));
    }
}
