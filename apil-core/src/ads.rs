//! Ads Orchestrator (C7): atomically creates Campaign -> AdSet -> Creative ->
//! Ad against the ads provider and persists each step. On partial failure,
//! prior steps are marked `orphan_pending_cleanup` rather than deleted —
//! the saga shape mirrors the teacher's ads-entity creation grounded on
//! `plan/store.rs`'s persist-then-advance pattern, generalized from a
//! single-entity insert to a four-step chain with compensating status
//! writes instead of rollback.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags};
use serde_json::Value;
use thiserror::Error;

use crate::ledger::{LedgerError, LedgerStore, NewLedgerEvent, Severity};
use crate::provider::{AdsProvider, ProviderError};
use crate::sqlite::configure_connection;

const SCHEMA: &str = include_str!("../../sql/ads.sql");

#[derive(Debug, Error)]
pub enum AdsError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("store path not configured")]
    MissingStore,
    #[error("invalid campaign: {0}")]
    InvalidCampaign(String),
    #[error("orchestration failed at step {step}: {source}")]
    StepFailed { step: &'static str, source: ProviderError },
}

pub type Result<T> = std::result::Result<T, AdsError>;

pub struct CampaignRequest {
    pub request_id: String,
    pub name: String,
    pub daily_budget_cents: i64,
    pub targeting: Value,
    pub adset_budget_cents: i64,
    pub clip_id: String,
}

#[derive(Debug, Clone)]
pub struct OrchestrationReport {
    pub campaign_db_id: i64,
    pub adset_db_id: i64,
    pub creative_db_id: i64,
    pub ad_db_id: i64,
    pub campaign_external_id: String,
    pub adset_external_id: String,
    pub creative_external_id: String,
    pub ad_external_id: String,
}

#[derive(Default)]
pub struct AdsStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl AdsStoreBuilder {
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

    pub fn build(self) -> Result<AdsStore> {
        let path = self.path.ok_or(AdsError::MissingStore)?;
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
        Ok(AdsStore { conn })
    }
}

pub struct AdsStore {
    conn: Connection,
}

impl AdsStore {
    pub fn builder() -> AdsStoreBuilder {
        AdsStoreBuilder::new()
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Validates inputs independent of the provider, then runs the
    /// four-step saga. Each step is persisted immediately so a crash never
    /// loses record of what the provider already created.
    pub async fn orchestrate_campaign(
        &self,
        provider: &dyn AdsProvider,
        ledger: &LedgerStore,
        request: CampaignRequest,
    ) -> Result<OrchestrationReport> {
        if request.daily_budget_cents < 0 {
            return Err(AdsError::InvalidCampaign("negative daily_budget".into()));
        }
        if request.name.trim().is_empty() {
            return Err(AdsError::InvalidCampaign("empty name".into()));
        }

        if let Some(existing) = self.existing_report(&request.request_id)? {
            return Ok(existing);
        }

        let now = Utc::now();
        let campaign_db_id = self.insert_campaign(&request, now)?;

        let campaign_external_id = match provider.create_campaign(&request.name, request.daily_budget_cents).await {
            Ok(id) => {
                self.update_status("campaigns", campaign_db_id, "created", Some(&id))?;
                id
            }
            Err(source) => {
                self.mark_orphan("campaigns", campaign_db_id)?;
                return Err(self.fail(ledger, "create_campaign", source).await);
            }
        };

        let adset_db_id = self.insert_adset(campaign_db_id, &request)?;
        let adset_external_id = match provider
            .create_adset(&campaign_external_id, &request.targeting, request.adset_budget_cents)
            .await
        {
            Ok(id) => {
                self.update_status("adsets", adset_db_id, "created", Some(&id))?;
                id
            }
            Err(source) => {
                self.mark_orphan("adsets", adset_db_id)?;
                return Err(self.fail(ledger, "create_adset", source).await);
            }
        };

        let creative_db_id = self.insert_creative(&request.clip_id)?;
        let creative_external_id = match provider.upload_ad_creative(&request.clip_id).await {
            Ok(id) => {
                self.update_status("creatives", creative_db_id, "created", Some(&id))?;
                id
            }
            Err(source) => {
                self.mark_orphan("creatives", creative_db_id)?;
                return Err(self.fail(ledger, "upload_ad_creative", source).await);
            }
        };

        let ad_db_id = self.insert_ad(adset_db_id, creative_db_id)?;
        let ad_external_id = match provider.create_ad(&adset_external_id, &creative_external_id).await {
            Ok(id) => {
                self.update_status("ads", ad_db_id, "created", Some(&id))?;
                id
            }
            Err(source) => {
                self.mark_orphan("ads", ad_db_id)?;
                return Err(self.fail(ledger, "create_ad", source).await);
            }
        };

        // Sync initial insights; a failure here doesn't unwind the saga,
        // the ad already exists.
        let _ = provider.get_insights(&ad_external_id).await;

        ledger.record(NewLedgerEvent::new(
            "ads_orchestration_completed",
            "campaign",
            request.request_id.clone(),
            Severity::Info,
            serde_json::json!({"campaign_external_id": campaign_external_id, "ad_external_id": ad_external_id}),
        ))?;

        Ok(OrchestrationReport {
            campaign_db_id,
            adset_db_id,
            creative_db_id,
            ad_db_id,
            campaign_external_id,
            adset_external_id,
            creative_external_id,
            ad_external_id,
        })
    }

    async fn fail(&self, ledger: &LedgerStore, step: &'static str, source: ProviderError) -> AdsError {
        let _ = ledger.record(NewLedgerEvent::new(
            "ads_orchestration_failed",
            "campaign",
            step.to_string(),
            Severity::Error,
            serde_json::json!({"step": step, "error": source.to_string()}),
        ));
        AdsError::StepFailed { step, source }
    }

    fn existing_report(&self, request_id: &str) -> Result<Option<OrchestrationReport>> {
        let campaign_row: Option<(i64, Option<String>)> = self
            .conn
            .query_row(
                "SELECT id, external_id FROM campaigns WHERE request_id = ?1",
                params![request_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional_or_none()?;

        let Some((campaign_db_id, Some(campaign_external_id))) = campaign_row else {
            return Ok(None);
        };

        let adset_row: Option<(i64, Option<String>)> = self
            .conn
            .query_row(
                "SELECT id, external_id FROM adsets WHERE campaign_id = ?1",
                params![campaign_db_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional_or_none()?;
        let Some((adset_db_id, Some(adset_external_id))) = adset_row else {
            return Ok(None);
        };

        let ad_row: Option<(i64, i64, Option<String>)> = self
            .conn
            .query_row(
                "SELECT id, creative_id, external_id FROM ads WHERE adset_id = ?1",
                params![adset_db_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional_or_none()?;
        let Some((ad_db_id, creative_db_id, Some(ad_external_id))) = ad_row else {
            return Ok(None);
        };

        let creative_external_id: Option<String> = self.conn.query_row(
            "SELECT external_id FROM creatives WHERE id = ?1",
            params![creative_db_id],
            |row| row.get(0),
        )?;
        let Some(creative_external_id) = creative_external_id else {
            return Ok(None);
        };

        Ok(Some(OrchestrationReport {
            campaign_db_id,
            adset_db_id,
            creative_db_id,
            ad_db_id,
            campaign_external_id,
            adset_external_id,
            creative_external_id,
            ad_external_id,
        }))
    }

    fn insert_campaign(&self, request: &CampaignRequest, now: chrono::DateTime<Utc>) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO campaigns (request_id, name, daily_budget_cents, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?4)",
            params![request.request_id, request.name, request.daily_budget_cents, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn insert_adset(&self, campaign_id: i64, request: &CampaignRequest) -> Result<i64> {
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO adsets (campaign_id, targeting, budget_cents, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?4)",
            params![campaign_id, serde_json::to_string(&request.targeting).unwrap_or_default(), request.adset_budget_cents, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn insert_creative(&self, clip_id: &str) -> Result<i64> {
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO creatives (clip_id, status, created_at, updated_at) VALUES (?1, 'pending', ?2, ?2)",
            params![clip_id, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn insert_ad(&self, adset_id: i64, creative_id: i64) -> Result<i64> {
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO ads (adset_id, creative_id, status, created_at, updated_at) VALUES (?1, ?2, 'pending', ?3, ?3)",
            params![adset_id, creative_id, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update_status(&self, table: &str, id: i64, status: &str, external_id: Option<&str>) -> Result<()> {
        let now = Utc::now();
        self.conn.execute(
            &format!("UPDATE {table} SET status = ?1, external_id = ?2, updated_at = ?3 WHERE id = ?4"),
            params![status, external_id, now, id],
        )?;
        Ok(())
    }

    fn mark_orphan(&self, table: &str, id: i64) -> Result<()> {
        let now = Utc::now();
        self.conn.execute(
            &format!("UPDATE {table} SET status = 'orphan_pending_cleanup', updated_at = ?1 WHERE id = ?2"),
            params![now, id],
        )?;
        Ok(())
    }

    /// Pauses every campaign still `created` against the provider; used by
    /// C12's emergency stop. Best-effort per campaign: one provider failure
    /// doesn't block pausing the rest.
    pub async fn pause_all_active_campaigns(&self, provider: &dyn AdsProvider, ledger: &LedgerStore) -> Result<usize> {
        let mut stmt = self.conn.prepare(
            "SELECT id, external_id FROM campaigns WHERE status = 'created' AND external_id IS NOT NULL",
        )?;
        let rows: Vec<(i64, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        let mut paused = 0;
        for (db_id, external_id) in rows {
            match provider.pause_entity(&external_id).await {
                Ok(()) => {
                    self.update_status("campaigns", db_id, "paused", Some(&external_id))?;
                    paused += 1;
                }
                Err(source) => {
                    ledger.record(NewLedgerEvent::new(
                        "ads_emergency_pause_failed",
                        "campaign",
                        external_id,
                        Severity::Error,
                        serde_json::json!({"error": source.to_string()}),
                    ))?;
                }
            }
        }
        Ok(paused)
    }
}

trait OptionalOrNone<T> {
    fn optional_or_none(self) -> rusqlite::Result<Option<T>>;
}

impl<T> OptionalOrNone<T> for rusqlite::Result<T> {
    fn optional_or_none(self) -> rusqlite::Result<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderError, SimulatedProvider};
    use tempfile::tempdir;

    fn stores() -> (tempfile::TempDir, AdsStore, LedgerStore) {
        let dir = tempdir().unwrap();
        let ads = AdsStore::builder().path(dir.path().join("ads.sqlite")).build().unwrap();
        ads.initialize().unwrap();
        let ledger = LedgerStore::builder().path(dir.path().join("ledger.sqlite")).build().unwrap();
        ledger.initialize().unwrap();
        (dir, ads, ledger)
    }

    fn request(id: &str) -> CampaignRequest {
        CampaignRequest {
            request_id: id.into(),
            name: "summer-push".into(),
            daily_budget_cents: 10_000,
            targeting: serde_json::json!({"age_min": 18}),
            adset_budget_cents: 5_000,
            clip_id: "clip-1".into(),
        }
    }

    #[tokio::test]
    async fn full_saga_completes_and_persists_every_step() {
        let (_dir, ads, ledger) = stores();
        let provider = SimulatedProvider::new();
        let report = ads.orchestrate_campaign(&provider, &ledger, request("req-1")).await.unwrap();
        assert!(report.campaign_external_id.starts_with("sim-campaign"));
        assert!(report.ad_external_id.starts_with("sim-ad"));
    }

    #[tokio::test]
    async fn negative_budget_is_fatal_before_any_provider_call() {
        let (_dir, ads, ledger) = stores();
        let provider = SimulatedProvider::new();
        let mut bad = request("req-2");
        bad.daily_budget_cents = -1;
        let result = ads.orchestrate_campaign(&provider, &ledger, bad).await;
        assert!(matches!(result, Err(AdsError::InvalidCampaign(_))));
    }

    #[tokio::test]
    async fn provider_failure_marks_campaign_orphaned_not_deleted() {
        let (_dir, ads, ledger) = stores();
        let provider = SimulatedProvider::failing(ProviderError::Server { status: 500, message: "boom".into() });
        let result = ads.orchestrate_campaign(&provider, &ledger, request("req-3")).await;
        assert!(matches!(result, Err(AdsError::StepFailed { step: "create_campaign", .. })));

        let status: String = ads
            .conn
            .query_row("SELECT status FROM campaigns WHERE request_id = 'req-3'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(status, "orphan_pending_cleanup");
    }

    #[tokio::test]
    async fn orchestration_is_idempotent_per_request_id() {
        let (_dir, ads, ledger) = stores();
        let provider = SimulatedProvider::new();
        let first = ads.orchestrate_campaign(&provider, &ledger, request("req-4")).await.unwrap();
        let second = ads.orchestrate_campaign(&provider, &ledger, request("req-4")).await.unwrap();
        assert_eq!(first.ad_external_id, second.ad_external_id);
    }
}
