use apil_core::SimulatedProvider;
use clap::{Args, Subcommand};

use crate::{AppContext, Result};

#[derive(Subcommand, Debug)]
pub enum ActionCommands {
    /// Moves a suggested optimization action to pending
    Approve(ActionIdArgs),
    /// Cancels a non-terminal optimization action
    Cancel(ActionIdArgs),
    /// Executes a suggested/pending optimization action against the ads provider
    Execute(ActionIdArgs),
    /// Lists optimization actions, optionally filtered by status
    List(ActionListArgs),
}

#[derive(Args, Debug)]
pub struct ActionIdArgs {
    pub id: i64,
}

#[derive(Args, Debug)]
pub struct ActionListArgs {
    /// Filter by status: suggested, pending, executing, executed, failed, cancelled, expired
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long, default_value = "50")]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct AbWinnerArgs {
    /// The ab_test row id whose winner should be enqueued for publication
    pub id: i64,
}

pub fn approve(ctx: &AppContext, args: &ActionIdArgs) -> Result<serde_json::Value> {
    let optimizer = ctx.open_optimizer()?;
    Ok(serde_json::to_value(optimizer.approve(args.id)?)?)
}

pub fn cancel(ctx: &AppContext, args: &ActionIdArgs) -> Result<serde_json::Value> {
    let optimizer = ctx.open_optimizer()?;
    Ok(serde_json::to_value(optimizer.cancel(args.id)?)?)
}

pub async fn execute(ctx: &AppContext, args: &ActionIdArgs) -> Result<serde_json::Value> {
    let optimizer = ctx.open_optimizer()?;
    let ledger = ctx.open_ledger()?;
    let provider = SimulatedProvider::new();
    let action = optimizer.execute(&ledger, &provider, args.id).await?;
    Ok(serde_json::to_value(action)?)
}

pub fn list(ctx: &AppContext, args: &ActionListArgs) -> Result<serde_json::Value> {
    let optimizer = ctx.open_optimizer()?;
    let status = args.status.as_deref().map(str::parse).transpose().map_err(crate::AppError::InvalidArgument)?;
    let actions = optimizer.list_by_status(status, args.limit)?;
    Ok(serde_json::to_value(actions)?)
}

pub fn publish_ab_winner(ctx: &AppContext, args: &AbWinnerArgs) -> Result<serde_json::Value> {
    let abtest = ctx.open_abtest()?;
    let queue = ctx.open_queue()?;
    let ledger = ctx.open_ledger()?;
    let test = abtest.fetch(args.id)?.ok_or(apil_core::AbTestError::NotFound(args.id))?;
    let window = apil_core::resolve_window(&ctx.config.platforms, test.platform)?;
    let horizon = chrono::Duration::days(ctx.config.apil.scheduler.horizon_days as i64);
    let log_id = abtest.publish_winner(&queue, &ledger, window, horizon, args.id)?;
    Ok(serde_json::json!({"published_log_id": log_id}))
}
