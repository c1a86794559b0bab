#![allow(
    clippy::default_constructed_unit_structs,
    clippy::redundant_closure,
    clippy::let_and_return,
    clippy::needless_question_mark,
    clippy::manual_strip,
    clippy::field_reassign_with_default,
    clippy::unnecessary_cast,
    clippy::result_large_err
)]

pub mod abtest;
pub mod ads;
pub mod config;
pub mod control;
pub mod error;
pub mod forecast;
pub mod identity;
pub mod ledger;
pub mod model;
pub mod optimizer;
pub mod provider;
pub mod queue;
pub mod reconciliator;
pub mod scheduler;
mod sqlite;
pub mod webhook;
pub mod worker;

pub use abtest::{
    AbTest, AbTestError, AbTestStatus, AbTestStore, AbTestStoreBuilder, EvaluationOutcome,
    NewAbTest, StatisticalResults, Variant, VariantMetrics,
};
pub use ads::{AdsError, AdsStore, AdsStoreBuilder, CampaignRequest, OrchestrationReport};
pub use config::{
    load_apil_config, load_platforms_config, AbTestSection, ApilConfig, ConfigBundle,
    ControlSection, IdentitySection, MonitoringSection, OptimizerSection, PathsSection,
    PlatformSection, PlatformsConfig, ReconciliatorSection, SchedulerSection, SystemSection,
    WorkerSection,
};
pub use control::{
    Component, ComponentHealth, ControlConfig, ControlError, ControlFlags, HealthStatus,
    MasterControl, SystemStatus,
};
pub use error::{ConfigError, Result};
pub use forecast::{forecast, Forecast, ForecastWindow, SaturationRisk};
pub use identity::{
    DeviceClass, Identity, IdentityClass, IdentityError, IdentityRouter, IdentityRouterBuilder,
};
pub use ledger::{
    compute_proof, LedgerError, LedgerEvent, LedgerExport, LedgerStore, LedgerStoreBuilder,
    NewLedgerEvent, Severity,
};
pub use model::{CampaignBudget, Clip, Platform, SocialAccount};
pub use optimizer::{
    classify, propose_reallocation, run_guardrails, ActionStatus, ActionType, AdMetrics,
    GuardrailOutcome, OptimizationAction, OptimizerError, OptimizerMode, OptimizerStore,
    OptimizerStoreBuilder, OptimizerThresholds, ReallocationPlan, SystemHealth, TargetLevel,
};
pub use provider::{
    AdsProvider, InsightsSnapshot, PlatformProvider, ProviderError, ProviderResult,
    PublishOutcome, SimulatedProvider,
};
pub use queue::{
    NewPublishLog, PublishLog, PublishLogStore, PublishLogStoreBuilder, PublishStatus, QueueError,
    ScheduledBy,
};
pub use reconciliator::{ReconcileConfig, ReconcileOutcome, ReconcileReport, ReconciliatorError};
pub use scheduler::{compute_priority, resolve_window, ScheduleRequest, SchedulerError};
pub use webhook::{WebhookError, WebhookPayload};
pub use worker::{backoff_delay, WorkerConfig, WorkerError};
