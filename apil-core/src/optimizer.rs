//! Optimization Loop (C9): hourly tick over per-ad ROAS/CTR/spend metrics,
//! classifying scale_up/scale_down/pause/reallocate actions and walking them
//! through a seven-guardrail stack before they leave `suggested`.
//! Grounded on `autopilot/optimizer.rs`'s `ParameterOptimizer`/`ChangeValidation`
//! shape: propose first, validate with a named-reason stack, execute last.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::{LedgerError, LedgerStore, NewLedgerEvent, Severity};
use crate::provider::{AdsProvider, ProviderError};
use crate::sqlite::configure_connection;

const SCHEMA: &str = include_str!("../../sql/optimizer.sql");

#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("store path not configured")]
    MissingStore,
    #[error("optimization action {0} not found")]
    NotFound(i64),
    #[error("action {0} is not in a pending-approval state")]
    NotSuggested(i64),
    #[error("provider call failed for action {0}: {1}")]
    Provider(i64, ProviderError),
}

pub type Result<T> = std::result::Result<T, OptimizerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetLevel {
    Campaign,
    Adset,
    Ad,
}

impl TargetLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetLevel::Campaign => "campaign",
            TargetLevel::Adset => "adset",
            TargetLevel::Ad => "ad",
        }
    }
}

impl std::str::FromStr for TargetLevel {
    type Err = String;
    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "campaign" => Ok(TargetLevel::Campaign),
            "adset" => Ok(TargetLevel::Adset),
            "ad" => Ok(TargetLevel::Ad),
            other => Err(format!("unknown target level: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ScaleUp,
    ScaleDown,
    Pause,
    Resume,
    Reallocate,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::ScaleUp => "scale_up",
            ActionType::ScaleDown => "scale_down",
            ActionType::Pause => "pause",
            ActionType::Resume => "resume",
            ActionType::Reallocate => "reallocate",
        }
    }

    /// Pause bypasses the change-cap guardrail as a safety lever.
    pub fn bypasses_change_cap(&self) -> bool {
        matches!(self, ActionType::Pause)
    }
}

impl std::str::FromStr for ActionType {
    type Err = String;
    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "scale_up" => Ok(ActionType::ScaleUp),
            "scale_down" => Ok(ActionType::ScaleDown),
            "pause" => Ok(ActionType::Pause),
            "resume" => Ok(ActionType::Resume),
            "reallocate" => Ok(ActionType::Reallocate),
            other => Err(format!("unknown action type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Suggested,
    Pending,
    Executing,
    Executed,
    Failed,
    Cancelled,
    Expired,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Suggested => "suggested",
            ActionStatus::Pending => "pending",
            ActionStatus::Executing => "executing",
            ActionStatus::Executed => "executed",
            ActionStatus::Failed => "failed",
            ActionStatus::Cancelled => "cancelled",
            ActionStatus::Expired => "expired",
        }
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = String;
    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "suggested" => Ok(ActionStatus::Suggested),
            "pending" => Ok(ActionStatus::Pending),
            "executing" => Ok(ActionStatus::Executing),
            "executed" => Ok(ActionStatus::Executed),
            "failed" => Ok(ActionStatus::Failed),
            "cancelled" => Ok(ActionStatus::Cancelled),
            "expired" => Ok(ActionStatus::Expired),
            other => Err(format!("unknown action status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdMetrics {
    pub target_level: TargetLevel,
    pub target_id: String,
    pub campaign_id: String,
    pub roas: f64,
    pub ctr: f64,
    pub spend_usd: f64,
    pub impressions: i64,
    pub confidence: f64,
    pub campaign_age_hours: i64,
    pub current_budget_cents: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationAction {
    pub id: i64,
    pub target_level: TargetLevel,
    pub target_id: String,
    pub action_type: ActionType,
    pub amount_pct: f64,
    pub amount_absolute: Option<f64>,
    pub reason_code: String,
    pub roas_value: f64,
    pub confidence: f64,
    pub status: ActionStatus,
    pub reallocation_plan: Option<String>,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub ledger_event_id: Option<i64>,
}

impl OptimizationAction {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let target_level: String = row.get("target_level")?;
        let action_type: String = row.get("action_type")?;
        let status: String = row.get("status")?;
        Ok(Self {
            id: row.get("id")?,
            target_level: target_level.parse().unwrap_or(TargetLevel::Ad),
            target_id: row.get("target_id")?,
            action_type: action_type.parse().unwrap_or(ActionType::Pause),
            amount_pct: row.get("amount_pct")?,
            amount_absolute: row.get("amount_absolute")?,
            reason_code: row.get("reason_code")?,
            roas_value: row.get("roas_value")?,
            confidence: row.get("confidence")?,
            status: status.parse().unwrap_or(ActionStatus::Suggested),
            reallocation_plan: row.get("reallocation_plan")?,
            created_at: row.get("created_at")?,
            approved_at: row.get("approved_at")?,
            executed_at: row.get("executed_at")?,
            expires_at: row.get("expires_at")?,
            ledger_event_id: row.get("ledger_event_id")?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub enum OptimizerMode {
    Suggest,
    Auto,
}

#[derive(Debug, Clone)]
pub struct OptimizerThresholds {
    pub scale_up_min_roas: f64,
    pub scale_down_max_roas: f64,
    pub pause_roas: f64,
    pub reallocate_diff: f64,
    pub min_confidence: f64,
    pub auto_confidence: f64,
    pub min_spend_usd: f64,
    pub min_impressions: i64,
    pub embargo_hours: i64,
    pub max_daily_change_pct: f64,
    pub auto_max_daily_change_pct: f64,
    pub cooldown_hours: i64,
    pub max_per_campaign: usize,
    pub max_per_run: usize,
    pub action_ttl_hours: i64,
}

impl Default for OptimizerThresholds {
    fn default() -> Self {
        Self {
            scale_up_min_roas: 2.0,
            scale_down_max_roas: 1.5,
            pause_roas: 0.8,
            reallocate_diff: 1.5,
            min_confidence: 0.65,
            auto_confidence: 0.75,
            min_spend_usd: 100.0,
            min_impressions: 1000,
            embargo_hours: 48,
            max_daily_change_pct: 0.20,
            auto_max_daily_change_pct: 0.10,
            cooldown_hours: 24,
            max_per_campaign: 5,
            max_per_run: 50,
            action_ttl_hours: 48,
        }
    }
}

/// Whether `system_health` is clear enough for actions to leave `suggested`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemHealth {
    Nominal,
    Degraded,
    Critical,
    EmergencyStop,
}

impl SystemHealth {
    fn blocks_guardrails(&self) -> bool {
        matches!(self, SystemHealth::Critical | SystemHealth::EmergencyStop)
    }
}

/// Scale-up step by ROAS band: [2,3)->10%, [3,3.5)->25%, [3.5,4)->50%, [4,5)->75%, >=5->100%.
fn scale_up_step(roas: f64) -> f64 {
    if roas >= 5.0 {
        1.00
    } else if roas >= 4.0 {
        0.75
    } else if roas >= 3.5 {
        0.50
    } else if roas >= 3.0 {
        0.25
    } else {
        0.10
    }
}

/// Classifies a single ad's metrics into a candidate action, or `None` if it
/// sits in the neutral band between thresholds.
pub fn classify(metrics: &AdMetrics, thresholds: &OptimizerThresholds) -> Option<(ActionType, f64, String)> {
    if metrics.roas < thresholds.pause_roas {
        return Some((ActionType::Pause, -1.0, "roas_below_pause_threshold".to_string()));
    }
    if metrics.roas >= thresholds.scale_up_min_roas && metrics.confidence >= thresholds.min_confidence {
        return Some((ActionType::ScaleUp, scale_up_step(metrics.roas), "roas_scale_up_band".to_string()));
    }
    if metrics.roas <= thresholds.scale_down_max_roas {
        return Some((ActionType::ScaleDown, -0.30, "roas_scale_down_band".to_string()));
    }
    None
}

#[derive(Debug, Clone, Serialize)]
pub struct ReallocationPlan {
    pub campaign_id: String,
    pub allocations: Vec<(String, i64)>,
}

/// Proposes a reallocation when a campaign has >=3 ads and max/min ROAS ratio
/// exceeds `reallocate_diff`. New budgets are proportional to `ROAS*confidence`,
/// preserving the campaign's total budget.
pub fn propose_reallocation(ads: &[AdMetrics], thresholds: &OptimizerThresholds) -> Option<ReallocationPlan> {
    if ads.len() < 3 {
        return None;
    }
    let max_roas = ads.iter().map(|a| a.roas).fold(f64::MIN, f64::max);
    let min_roas = ads.iter().map(|a| a.roas).fold(f64::MAX, f64::min);
    if min_roas <= 0.0 || max_roas / min_roas <= thresholds.reallocate_diff {
        return None;
    }

    let total_budget: i64 = ads.iter().map(|a| a.current_budget_cents).sum();
    let weights: Vec<f64> = ads.iter().map(|a| (a.roas * a.confidence).max(0.0)).collect();
    let weight_sum: f64 = weights.iter().sum();
    if weight_sum <= 0.0 {
        return None;
    }

    let allocations = ads
        .iter()
        .zip(weights.iter())
        .map(|(ad, weight)| {
            let share = (*weight / weight_sum * total_budget as f64).round() as i64;
            (ad.target_id.clone(), share)
        })
        .collect();

    Some(ReallocationPlan {
        campaign_id: ads[0].campaign_id.clone(),
        allocations,
    })
}

/// Rolls a campaign's per-ad metrics into one campaign-level row so the
/// guardrail stack can be run once per reallocation instead of per ad.
fn aggregate_campaign_metrics(group: &[AdMetrics]) -> AdMetrics {
    let campaign_id = group[0].campaign_id.clone();
    let spend_usd: f64 = group.iter().map(|a| a.spend_usd).sum();
    let impressions: i64 = group.iter().map(|a| a.impressions).sum();
    let current_budget_cents: i64 = group.iter().map(|a| a.current_budget_cents).sum();
    let campaign_age_hours = group.iter().map(|a| a.campaign_age_hours).min().unwrap_or(0);
    let confidence = group.iter().map(|a| a.confidence).fold(f64::MAX, f64::min);
    let roas = if spend_usd > 0.0 {
        group.iter().map(|a| a.roas * a.spend_usd).sum::<f64>() / spend_usd
    } else {
        0.0
    };
    let ctr = if impressions > 0 {
        group.iter().map(|a| a.ctr * a.impressions as f64).sum::<f64>() / impressions as f64
    } else {
        0.0
    };

    AdMetrics {
        target_level: TargetLevel::Campaign,
        target_id: campaign_id.clone(),
        campaign_id,
        roas,
        ctr,
        spend_usd,
        impressions,
        confidence,
        campaign_age_hours,
        current_budget_cents,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardrailOutcome {
    pub passed: bool,
    pub failure_reason: Option<&'static str>,
}

/// The seven-guardrail stack, evaluated in order; first failure aborts.
pub fn run_guardrails(
    metrics: &AdMetrics,
    action_type: ActionType,
    confidence: f64,
    amount_pct: f64,
    last_executed_on_target: Option<DateTime<Utc>>,
    actions_this_campaign: usize,
    actions_this_run: usize,
    mode: OptimizerMode,
    health: SystemHealth,
    thresholds: &OptimizerThresholds,
    now: DateTime<Utc>,
) -> GuardrailOutcome {
    let fail = |reason: &'static str| GuardrailOutcome { passed: false, failure_reason: Some(reason) };

    if metrics.campaign_age_hours < thresholds.embargo_hours {
        return fail("embargo_not_cleared");
    }
    if metrics.spend_usd < thresholds.min_spend_usd || metrics.impressions < thresholds.min_impressions {
        return fail("insufficient_data");
    }
    let required_confidence = if matches!(mode, OptimizerMode::Auto) {
        thresholds.auto_confidence
    } else {
        thresholds.min_confidence
    };
    if confidence < required_confidence {
        return fail("confidence_below_threshold");
    }
    if !action_type.bypasses_change_cap() {
        let cap = if matches!(mode, OptimizerMode::Auto) {
            thresholds.auto_max_daily_change_pct
        } else {
            thresholds.max_daily_change_pct
        };
        if amount_pct.abs() > cap {
            return fail("change_exceeds_cap");
        }
    }
    if let Some(last) = last_executed_on_target {
        if now - last < Duration::hours(thresholds.cooldown_hours) {
            return fail("cooldown_active");
        }
    }
    if actions_this_campaign >= thresholds.max_per_campaign || actions_this_run >= thresholds.max_per_run {
        return fail("per_run_cap_exceeded");
    }
    if health.blocks_guardrails() {
        return fail("system_health_blocking");
    }

    GuardrailOutcome { passed: true, failure_reason: None }
}

#[derive(Default)]
pub struct OptimizerStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl OptimizerStoreBuilder {
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

    pub fn build(self) -> Result<OptimizerStore> {
        let path = self.path.ok_or(OptimizerError::MissingStore)?;
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
        Ok(OptimizerStore { conn })
    }
}

pub struct OptimizerStore {
    conn: Connection,
}

impl OptimizerStore {
    pub fn builder() -> OptimizerStoreBuilder {
        OptimizerStoreBuilder::new()
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn fetch(&self, id: i64) -> Result<Option<OptimizationAction>> {
        self.conn
            .query_row("SELECT * FROM optimization_actions WHERE id = ?1", params![id], OptimizationAction::from_row)
            .optional()
            .map_err(OptimizerError::from)
    }

    pub fn list_by_status(&self, status: Option<ActionStatus>, limit: usize) -> Result<Vec<OptimizationAction>> {
        let mut stmt = match status {
            Some(_) => self.conn.prepare(
                "SELECT * FROM optimization_actions WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2",
            )?,
            None => self.conn.prepare("SELECT * FROM optimization_actions ORDER BY created_at DESC LIMIT ?1")?,
        };
        let rows = match status {
            Some(status) => stmt
                .query_map(params![status.as_str(), limit as i64], OptimizationAction::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map(params![limit as i64], OptimizationAction::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
    }

    /// Operator approval: `suggested -> pending`, clearing it for execution.
    pub fn approve(&self, id: i64) -> Result<OptimizationAction> {
        let action = self.fetch(id)?.ok_or(OptimizerError::NotFound(id))?;
        if !matches!(action.status, ActionStatus::Suggested) {
            return Err(OptimizerError::NotSuggested(id));
        }
        self.conn.execute(
            "UPDATE optimization_actions SET status = 'pending', approved_at = ?1 WHERE id = ?2",
            params![Utc::now(), id],
        )?;
        self.fetch(id)?.ok_or(OptimizerError::NotFound(id))
    }

    /// Operator rejection: any non-terminal action moves to `cancelled`.
    pub fn cancel(&self, id: i64) -> Result<OptimizationAction> {
        let action = self.fetch(id)?.ok_or(OptimizerError::NotFound(id))?;
        if matches!(action.status, ActionStatus::Executed | ActionStatus::Cancelled | ActionStatus::Failed) {
            return Err(OptimizerError::NotSuggested(id));
        }
        self.conn.execute(
            "UPDATE optimization_actions SET status = 'cancelled' WHERE id = ?1",
            params![id],
        )?;
        self.fetch(id)?.ok_or(OptimizerError::NotFound(id))
    }

    fn last_executed_on(&self, target_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.conn
            .query_row(
                "SELECT executed_at FROM optimization_actions
                 WHERE target_id = ?1 AND status = 'executed' AND executed_at IS NOT NULL
                 ORDER BY executed_at DESC LIMIT 1",
                params![target_id],
                |row| row.get::<_, Option<DateTime<Utc>>>(0),
            )
            .optional()?
            .flatten()
            .map(Ok)
            .transpose()
    }

    /// Runs one tick: classify every ad, run guardrails, persist the action
    /// at whatever status it reaches (`suggested` or `pending` for auto-executable).
    pub fn run_tick(
        &self,
        ledger: &LedgerStore,
        all_metrics: &[AdMetrics],
        mode: OptimizerMode,
        health: SystemHealth,
        thresholds: &OptimizerThresholds,
        now: DateTime<Utc>,
    ) -> Result<Vec<OptimizationAction>> {
        let mut created = Vec::new();
        let mut per_campaign_counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

        for metrics in all_metrics {
            let Some((action_type, amount_pct, reason_code)) = classify(metrics, thresholds) else {
                continue;
            };

            let actions_this_campaign = *per_campaign_counts.get(&metrics.campaign_id).unwrap_or(&0);
            let last_executed = self.last_executed_on(&metrics.target_id)?;

            let guardrail = run_guardrails(
                metrics,
                action_type,
                metrics.confidence,
                amount_pct,
                last_executed,
                actions_this_campaign,
                created.len(),
                mode,
                health,
                thresholds,
                now,
            );

            let status = if !guardrail.passed {
                ActionStatus::Suggested
            } else if matches!(mode, OptimizerMode::Auto) {
                ActionStatus::Pending
            } else {
                ActionStatus::Suggested
            };

            let reason = guardrail.failure_reason.map(str::to_string).unwrap_or(reason_code);
            let action = self.insert_action(metrics, action_type, amount_pct, &reason, status, None, thresholds, now)?;

            ledger.record(NewLedgerEvent::new(
                "optimization_action_suggested",
                metrics.target_level.as_str(),
                metrics.target_id.clone(),
                Severity::Info,
                serde_json::json!({
                    "action_id": action.id,
                    "action_type": action_type.as_str(),
                    "amount_pct": amount_pct,
                    "reason_code": reason,
                    "roas": metrics.roas,
                }),
            ))?;

            *per_campaign_counts.entry(metrics.campaign_id.clone()).or_insert(0) += 1;
            created.push(action);
        }

        let mut by_campaign: std::collections::HashMap<String, Vec<AdMetrics>> = std::collections::HashMap::new();
        for metrics in all_metrics {
            by_campaign.entry(metrics.campaign_id.clone()).or_default().push(metrics.clone());
        }

        for (campaign_id, group) in by_campaign {
            let Some(plan) = propose_reallocation(&group, thresholds) else {
                continue;
            };

            let representative = aggregate_campaign_metrics(&group);
            let actions_this_campaign = *per_campaign_counts.get(&campaign_id).unwrap_or(&0);
            let last_executed = self.last_executed_on(&campaign_id)?;

            let guardrail = run_guardrails(
                &representative,
                ActionType::Reallocate,
                representative.confidence,
                0.0,
                last_executed,
                actions_this_campaign,
                created.len(),
                mode,
                health,
                thresholds,
                now,
            );

            let status = if !guardrail.passed {
                ActionStatus::Suggested
            } else if matches!(mode, OptimizerMode::Auto) {
                ActionStatus::Pending
            } else {
                ActionStatus::Suggested
            };

            let reason = guardrail.failure_reason.map(str::to_string).unwrap_or_else(|| "roas_spread_exceeds_threshold".to_string());
            let action = self.insert_action(&representative, ActionType::Reallocate, 0.0, &reason, status, Some(&plan), thresholds, now)?;

            ledger.record(NewLedgerEvent::new(
                "optimization_action_suggested",
                TargetLevel::Campaign.as_str(),
                campaign_id.clone(),
                Severity::Info,
                serde_json::json!({
                    "action_id": action.id,
                    "action_type": ActionType::Reallocate.as_str(),
                    "reason_code": reason,
                    "allocations": plan.allocations,
                }),
            ))?;

            *per_campaign_counts.entry(campaign_id).or_insert(0) += 1;
            created.push(action);
        }

        Ok(created)
    }

    fn insert_action(
        &self,
        metrics: &AdMetrics,
        action_type: ActionType,
        amount_pct: f64,
        reason_code: &str,
        status: ActionStatus,
        reallocation_plan: Option<&ReallocationPlan>,
        thresholds: &OptimizerThresholds,
        now: DateTime<Utc>,
    ) -> Result<OptimizationAction> {
        let amount_absolute = if action_type.bypasses_change_cap() {
            None
        } else {
            Some((metrics.current_budget_cents as f64 * (1.0 + amount_pct)).max(0.0))
        };
        let reallocation_plan_json = reallocation_plan.map(serde_json::to_string).transpose()?;
        self.conn.execute(
            "INSERT INTO optimization_actions
                (target_level, target_id, action_type, amount_pct, amount_absolute, reason_code,
                 roas_value, confidence, status, reallocation_plan, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                metrics.target_level.as_str(),
                metrics.target_id,
                action_type.as_str(),
                amount_pct,
                amount_absolute,
                reason_code,
                metrics.roas,
                metrics.confidence,
                status.as_str(),
                reallocation_plan_json,
                now,
                now + Duration::hours(thresholds.action_ttl_hours),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.fetch(id)?.ok_or(OptimizerError::NotFound(id))
    }

    /// Executes a `pending`/approved action against the provider. Only the
    /// optimizer's executor or an operator approval path calls this.
    pub async fn execute(
        &self,
        ledger: &LedgerStore,
        provider: &dyn AdsProvider,
        id: i64,
    ) -> Result<OptimizationAction> {
        let action = self.fetch(id)?.ok_or(OptimizerError::NotFound(id))?;
        if !matches!(action.status, ActionStatus::Suggested | ActionStatus::Pending) {
            return Err(OptimizerError::NotSuggested(id));
        }

        self.conn.execute(
            "UPDATE optimization_actions SET status = 'executing' WHERE id = ?1",
            params![id],
        )?;

        let result = match action.action_type {
            ActionType::Pause => provider.pause_entity(&action.target_id).await,
            ActionType::Resume => provider.resume_entity(&action.target_id).await,
            _ => {
                let new_budget_cents = action.amount_absolute.unwrap_or(0.0) as i64;
                provider.update_budget(&action.target_id, new_budget_cents).await
            }
        };

        match result {
            Ok(_) => {
                let now = Utc::now();
                self.conn.execute(
                    "UPDATE optimization_actions SET status = 'executed', executed_at = ?1 WHERE id = ?2",
                    params![now, id],
                )?;
                ledger.record(NewLedgerEvent::new(
                    "optimization_executed",
                    action.target_level.as_str(),
                    action.target_id.clone(),
                    Severity::Info,
                    serde_json::json!({"action_id": id, "action_type": action.action_type.as_str()}),
                ))?;
            }
            Err(err) => {
                self.conn.execute(
                    "UPDATE optimization_actions SET status = 'failed' WHERE id = ?1",
                    params![id],
                )?;
                ledger.record(NewLedgerEvent::new(
                    "optimization_failed",
                    action.target_level.as_str(),
                    action.target_id.clone(),
                    Severity::Error,
                    serde_json::json!({"action_id": id, "error": err.to_string()}),
                ))?;
                return Err(OptimizerError::Provider(id, err));
            }
        }

        self.fetch(id)?.ok_or(OptimizerError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::SimulatedProvider;
    use tempfile::tempdir;

    fn metrics(roas: f64, confidence: f64) -> AdMetrics {
        AdMetrics {
            target_level: TargetLevel::Ad,
            target_id: "ad-1".into(),
            campaign_id: "camp-1".into(),
            roas,
            ctr: 0.03,
            spend_usd: 500.0,
            impressions: 5000,
            confidence,
            campaign_age_hours: 72,
            current_budget_cents: 100_000,
        }
    }

    #[test]
    fn classifies_scale_up_by_band() {
        let thresholds = OptimizerThresholds::default();
        let (action, amount, _) = classify(&metrics(3.2, 0.9), &thresholds).unwrap();
        assert_eq!(action, ActionType::ScaleUp);
        assert_eq!(amount, 0.25);
    }

    #[test]
    fn classifies_pause_below_threshold() {
        let thresholds = OptimizerThresholds::default();
        let (action, _, reason) = classify(&metrics(0.5, 0.9), &thresholds).unwrap();
        assert_eq!(action, ActionType::Pause);
        assert_eq!(reason, "roas_below_pause_threshold");
    }

    #[test]
    fn embargo_blocks_young_campaign() {
        let thresholds = OptimizerThresholds::default();
        let mut m = metrics(3.0, 0.9);
        m.campaign_age_hours = 10;
        let outcome = run_guardrails(
            &m,
            ActionType::ScaleUp,
            m.confidence,
            0.25,
            None,
            0,
            0,
            OptimizerMode::Suggest,
            SystemHealth::Nominal,
            &thresholds,
            Utc::now(),
        );
        assert!(!outcome.passed);
        assert_eq!(outcome.failure_reason, Some("embargo_not_cleared"));
    }

    #[test]
    fn pause_bypasses_change_cap() {
        assert!(ActionType::Pause.bypasses_change_cap());
        assert!(!ActionType::ScaleUp.bypasses_change_cap());
    }

    #[test]
    fn reallocation_requires_three_ads_and_spread() {
        let thresholds = OptimizerThresholds::default();
        let ads = vec![
            AdMetrics { target_id: "a".into(), roas: 4.0, confidence: 0.8, ..metrics(4.0, 0.8) },
            AdMetrics { target_id: "b".into(), roas: 1.0, confidence: 0.8, ..metrics(1.0, 0.8) },
            AdMetrics { target_id: "c".into(), roas: 2.0, confidence: 0.8, ..metrics(2.0, 0.8) },
        ];
        let plan = propose_reallocation(&ads, &thresholds).unwrap();
        let total: i64 = plan.allocations.iter().map(|(_, amount)| amount).sum();
        assert_eq!(total, 300_000);
    }

    #[test]
    fn run_tick_creates_a_reallocation_action_for_the_campaign() {
        let dir = tempdir().unwrap();
        let store = OptimizerStore::builder().path(dir.path().join("opt.sqlite")).build().unwrap();
        store.initialize().unwrap();
        let ledger = LedgerStore::builder().path(dir.path().join("ledger.sqlite")).build().unwrap();
        ledger.initialize().unwrap();
        let thresholds = OptimizerThresholds::default();

        let ads = vec![
            AdMetrics { target_id: "a".into(), roas: 4.0, confidence: 0.8, ..metrics(4.0, 0.8) },
            AdMetrics { target_id: "b".into(), roas: 1.0, confidence: 0.8, ..metrics(1.0, 0.8) },
            AdMetrics { target_id: "c".into(), roas: 2.0, confidence: 0.8, ..metrics(2.0, 0.8) },
        ];

        let created = store
            .run_tick(&ledger, &ads, OptimizerMode::Suggest, SystemHealth::Nominal, &thresholds, Utc::now())
            .unwrap();

        let reallocation = created.iter().find(|a| a.action_type == ActionType::Reallocate);
        let reallocation = reallocation.expect("a reallocation action should have been proposed");
        assert_eq!(reallocation.target_level, TargetLevel::Campaign);
        assert!(reallocation.reallocation_plan.is_some());
    }

    #[tokio::test]
    async fn execute_pause_transitions_to_executed() {
        let dir = tempdir().unwrap();
        let store = OptimizerStore::builder().path(dir.path().join("opt.sqlite")).build().unwrap();
        store.initialize().unwrap();
        let ledger = LedgerStore::builder().path(dir.path().join("ledger.sqlite")).build().unwrap();
        ledger.initialize().unwrap();
        let thresholds = OptimizerThresholds::default();

        let action = store
            .insert_action(&metrics(0.5, 0.9), ActionType::Pause, -1.0, "roas_below_pause_threshold", ActionStatus::Pending, None, &thresholds, Utc::now())
            .unwrap();

        let provider = SimulatedProvider::default();
        let executed = store.execute(&ledger, &provider, action.id).await.unwrap();
        assert_eq!(executed.status, ActionStatus::Executed);
        assert!(executed.executed_at.is_some());
    }
}
