#![allow(clippy::result_large_err)]

mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use apil_core::{
    AbTestError, AbTestStore, AdsError, AdsStore, ConfigBundle, ConfigError, ControlConfig,
    ControlError, IdentityError, IdentityRouter, LedgerError, LedgerStore, MasterControl,
    OptimizerError, OptimizerStore, OptimizerThresholds, QueueError, ReconciliatorError,
    SchedulerError, WebhookError, WorkerError,
};
use chrono::Duration;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use commands::actions::{AbWinnerArgs, ActionCommands};
use commands::runonce::RunOnceCommands;
use commands::status::{print_status, StatusReport};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
    #[error("webhook error: {0}")]
    Webhook(#[from] WebhookError),
    #[error("reconciliator error: {0}")]
    Reconciliator(#[from] ReconciliatorError),
    #[error("ads error: {0}")]
    Ads(#[from] AdsError),
    #[error("ab test error: {0}")]
    AbTest(#[from] AbTestError),
    #[error("optimizer error: {0}")]
    Optimizer(#[from] OptimizerError),
    #[error("control error: {0}")]
    Control(#[from] ControlError),
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "apil operator control interface", long_about = None)]
pub struct Cli {
    /// Directory containing apil.toml and platforms.toml
    #[arg(long, default_value = "configs")]
    pub config_dir: PathBuf,
    /// Override path to ledger.sqlite
    #[arg(long)]
    pub ledger_db: Option<PathBuf>,
    /// Override path to queue.sqlite
    #[arg(long)]
    pub queue_db: Option<PathBuf>,
    /// Override path to identity.sqlite
    #[arg(long)]
    pub identity_db: Option<PathBuf>,
    /// Override path to ads.sqlite
    #[arg(long)]
    pub ads_db: Option<PathBuf>,
    /// Override path to abtest.sqlite
    #[arg(long)]
    pub abtest_db: Option<PathBuf>,
    /// Override path to optimizer.sqlite
    #[arg(long)]
    pub optimizer_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Shows per-component health and overall system status
    Status,
    /// Runs one tick of a single component, outside its normal loop
    #[command(subcommand)]
    RunOnce(RunOnceCommands),
    /// Pauses every component loop (sets the process-wide paused flag)
    PauseAll,
    /// Clears paused/emergency-stop flags
    ResumeAll,
    /// Halts the worker, ads orchestrator and optimizer, and pauses active campaigns
    EmergencyStop {
        /// Human-readable reason, recorded in the ledger
        reason: String,
    },
    /// Operator actions over optimizer-suggested budget changes
    #[command(subcommand)]
    Action(ActionCommands),
    /// Publishes the winning variant of a completed A/B test
    AbWinner(AbWinnerArgs),
    /// Generates shell completion scripts
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Resolved database paths and loaded configuration shared across one invocation.
pub struct AppContext {
    pub config: ConfigBundle,
    pub ledger_db: PathBuf,
    pub queue_db: PathBuf,
    pub identity_db: PathBuf,
    pub ads_db: PathBuf,
    pub abtest_db: PathBuf,
    pub optimizer_db: PathBuf,
}

impl AppContext {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let config = ConfigBundle::from_directory(&cli.config_dir)?;
        let data_dir = config.apil.resolve_path(&config.apil.paths.data_dir);

        let resolve = |override_path: &Option<PathBuf>, name: &str| {
            override_path.clone().unwrap_or_else(|| data_dir.join(name))
        };

        Ok(Self {
            ledger_db: resolve(&cli.ledger_db, "ledger.sqlite"),
            queue_db: resolve(&cli.queue_db, "queue.sqlite"),
            identity_db: resolve(&cli.identity_db, "identity.sqlite"),
            ads_db: resolve(&cli.ads_db, "ads.sqlite"),
            abtest_db: resolve(&cli.abtest_db, "abtest.sqlite"),
            optimizer_db: resolve(&cli.optimizer_db, "optimizer.sqlite"),
            config,
        })
    }

    pub fn open_ledger(&self) -> Result<LedgerStore> {
        let store = LedgerStore::builder().path(&self.ledger_db).build()?;
        store.initialize()?;
        Ok(store)
    }

    pub fn open_queue(&self) -> Result<apil_core::PublishLogStore> {
        let store = apil_core::PublishLogStore::builder().path(&self.queue_db).build()?;
        store.initialize()?;
        Ok(store)
    }

    pub fn open_identity(&self) -> Result<IdentityRouter> {
        let router = IdentityRouter::builder().path(&self.identity_db).build()?;
        router.initialize()?;
        Ok(router)
    }

    pub fn open_ads(&self) -> Result<AdsStore> {
        let store = AdsStore::builder().path(&self.ads_db).build()?;
        store.initialize()?;
        Ok(store)
    }

    pub fn open_abtest(&self) -> Result<AbTestStore> {
        let store = AbTestStore::builder().path(&self.abtest_db).build()?;
        store.initialize()?;
        Ok(store)
    }

    pub fn open_optimizer(&self) -> Result<OptimizerStore> {
        let store = OptimizerStore::builder().path(&self.optimizer_db).build()?;
        store.initialize()?;
        Ok(store)
    }

    pub fn control_config(&self) -> ControlConfig {
        ControlConfig {
            restart_cooldown: Duration::seconds(self.config.apil.control.restart_cooldown_seconds as i64),
            restart_max_attempts: self.config.apil.control.restart_max_attempts,
            error_rate_window: Duration::hours(self.config.apil.control.error_rate_window_hours as i64),
        }
    }

    pub fn optimizer_thresholds(&self) -> OptimizerThresholds {
        let section = &self.config.apil.optimizer;
        OptimizerThresholds {
            scale_up_min_roas: section.scale_up_min_roas,
            scale_down_max_roas: section.scale_down_max_roas,
            pause_roas: section.pause_roas,
            reallocate_diff: section.reallocate_diff,
            min_confidence: section.min_confidence,
            auto_confidence: section.auto_confidence,
            min_spend_usd: section.min_spend_usd,
            min_impressions: section.min_impressions,
            embargo_hours: section.embargo_hours,
            max_daily_change_pct: section.max_daily_change_pct,
            auto_max_daily_change_pct: section.auto_max_daily_change_pct,
            cooldown_hours: section.cooldown_hours,
            max_per_campaign: section.max_per_campaign as usize,
            max_per_run: section.max_per_run as usize,
            action_ttl_hours: section.action_ttl_hours,
        }
    }
}

pub fn run(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Commands::Completions { shell } = cli.command {
        let mut command = Cli::command();
        generate(shell, &mut command, "apilctl", &mut std::io::stdout());
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(dispatch(cli))
}

async fn dispatch(cli: Cli) -> Result<()> {
    let ctx = AppContext::from_cli(&cli)?;
    let format = cli.format;

    match cli.command {
        Commands::Status => {
            let ledger = Arc::new(ctx.open_ledger()?);
            let control = MasterControl::new(ledger, ctx.control_config());
            let now = chrono::Utc::now();
            let report = StatusReport {
                system_status: control.system_status(now)?,
                components: control.run_health_check(now)?,
            };
            print_status(&report, format);
        }
        Commands::RunOnce(RunOnceCommands::Worker) => {
            let result = commands::runonce::run_worker(&ctx).await?;
            emit(&result, format);
        }
        Commands::RunOnce(RunOnceCommands::Reconciliator) => {
            let result = commands::runonce::run_reconciliator(&ctx)?;
            emit(&result, format);
        }
        Commands::RunOnce(RunOnceCommands::Optimizer(args)) => {
            let result = commands::runonce::run_optimizer(&ctx, &args)?;
            emit(&result, format);
        }
        Commands::RunOnce(RunOnceCommands::AbEvaluate(args)) => {
            let result = commands::runonce::run_ab_evaluate(&ctx, &args)?;
            emit(&result, format);
        }
        Commands::PauseAll => {
            let ledger = Arc::new(ctx.open_ledger()?);
            MasterControl::new(ledger, ctx.control_config()).stop_all()?;
            println!("all components paused");
        }
        Commands::ResumeAll => {
            let ledger = Arc::new(ctx.open_ledger()?);
            MasterControl::new(ledger, ctx.control_config()).resume()?;
            println!("all components resumed");
        }
        Commands::EmergencyStop { reason } => {
            let ledger = Arc::new(ctx.open_ledger()?);
            let ads = ctx.open_ads()?;
            let provider = apil_core::SimulatedProvider::new();
            let control = MasterControl::new(ledger, ctx.control_config());
            let paused = control.emergency_stop(&ads, &provider, &reason).await?;
            println!("emergency stop engaged, {paused} campaign(s) paused");
        }
        Commands::Action(ActionCommands::Approve(args)) => {
            emit(&commands::actions::approve(&ctx, &args)?, format);
        }
        Commands::Action(ActionCommands::Cancel(args)) => {
            emit(&commands::actions::cancel(&ctx, &args)?, format);
        }
        Commands::Action(ActionCommands::Execute(args)) => {
            emit(&commands::actions::execute(&ctx, &args).await?, format);
        }
        Commands::Action(ActionCommands::List(args)) => {
            emit(&commands::actions::list(&ctx, &args)?, format);
        }
        Commands::AbWinner(args) => {
            emit(&commands::actions::publish_ab_winner(&ctx, &args)?, format);
        }
        Commands::Completions { .. } => unreachable!("handled before the runtime was built"),
    }

    Ok(())
}

fn emit(value: &serde_json::Value, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value).unwrap_or_default()),
        OutputFormat::Text => println!("{value}"),
    }
}
