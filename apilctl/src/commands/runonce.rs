use std::path::PathBuf;

use apil_core::{AdMetrics, OptimizerMode, SimulatedProvider, SystemHealth, VariantMetrics};
use chrono::{Duration, Utc};
use clap::{Args, Subcommand};

use crate::{AppContext, Result};

#[derive(Subcommand, Debug)]
pub enum RunOnceCommands {
    /// Promotes queue rows whose scheduled_for has elapsed into pending, then drains one due log
    Worker,
    /// Runs one reconciliation sweep over stuck publish logs
    Reconciliator,
    /// Classifies every ad in the metrics file and inserts optimization actions
    Optimizer(OptimizerTickArgs),
    /// Evaluates an A/B test against a metrics file
    AbEvaluate(AbEvaluateArgs),
}

#[derive(Args, Debug)]
pub struct OptimizerTickArgs {
    /// Path to a JSON file containing an array of AdMetrics
    #[arg(long)]
    pub metrics: PathBuf,
    /// "suggest" (default) or "auto"
    #[arg(long, default_value = "suggest")]
    pub mode: String,
    /// Current system health: nominal, degraded, critical, emergency_stop
    #[arg(long, default_value = "nominal")]
    pub health: String,
}

#[derive(Args, Debug)]
pub struct AbEvaluateArgs {
    /// The ab_test row id to evaluate
    #[arg(long)]
    pub test_id: i64,
    /// Path to a JSON file containing an array of VariantMetrics
    #[arg(long)]
    pub metrics: PathBuf,
}

pub async fn run_worker(ctx: &AppContext) -> Result<serde_json::Value> {
    let queue = ctx.open_queue()?;
    let ledger = ctx.open_ledger()?;
    let mut identity = ctx.open_identity()?;
    let provider = SimulatedProvider::new();
    let now = Utc::now();

    let promoted = queue.promote_due(now, Duration::seconds(ctx.config.apil.scheduler.tick_slack_seconds as i64))?;
    let next = queue.fetch_next_due(now)?;
    let processed = match next {
        Some(log) => {
            apil_core::worker::process_one(&queue, &ledger, &mut identity, &provider, &log).await?;
            Some(log.id)
        }
        None => None,
    };

    Ok(serde_json::json!({"promoted": promoted, "processed_log_id": processed}))
}

pub fn run_reconciliator(ctx: &AppContext) -> Result<serde_json::Value> {
    let queue = ctx.open_queue()?;
    let ledger = ctx.open_ledger()?;
    let config = apil_core::ReconcileConfig {
        reconcile_window: Duration::minutes(ctx.config.apil.reconciliator.reconcile_window_minutes),
        timeout_threshold: Duration::minutes(ctx.config.apil.reconciliator.timeout_threshold_minutes),
    };
    let reports = apil_core::reconciliator::sweep(&queue, &ledger, config, Utc::now())?;
    Ok(serde_json::to_value(reports)?)
}

pub fn run_optimizer(ctx: &AppContext, args: &OptimizerTickArgs) -> Result<serde_json::Value> {
    let raw = std::fs::read_to_string(&args.metrics)?;
    let metrics: Vec<AdMetrics> = serde_json::from_str(&raw)?;

    let optimizer = ctx.open_optimizer()?;
    let ledger = ctx.open_ledger()?;
    let mode = match args.mode.as_str() {
        "auto" => OptimizerMode::Auto,
        _ => OptimizerMode::Suggest,
    };
    let health = match args.health.as_str() {
        "degraded" => SystemHealth::Degraded,
        "critical" => SystemHealth::Critical,
        "emergency_stop" => SystemHealth::EmergencyStop,
        _ => SystemHealth::Nominal,
    };
    let thresholds = ctx.optimizer_thresholds();

    let actions = optimizer.run_tick(&ledger, &metrics, mode, health, &thresholds, Utc::now())?;
    Ok(serde_json::to_value(actions)?)
}

pub fn run_ab_evaluate(ctx: &AppContext, args: &AbEvaluateArgs) -> Result<serde_json::Value> {
    let raw = std::fs::read_to_string(&args.metrics)?;
    let metrics: Vec<VariantMetrics> = serde_json::from_str(&raw)?;

    let abtest = ctx.open_abtest()?;
    let outcome = abtest.evaluate(args.test_id, &metrics, Utc::now())?;
    Ok(serde_json::to_value(outcome)?)
}
