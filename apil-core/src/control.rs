//! Master Control (C12): health monitor plus start/stop/emergency-stop
//! supervisor over the rest of the core. Grounded on `autopilot/scheduler.rs`'s
//! pause/resume flag idiom for the process-wide switches, and on
//! `broadcaster/watchdog.rs`'s restart-cooldown-then-escalate pattern for
//! the per-component auto-recovery history.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::ads::AdsStore;
use crate::ledger::{LedgerError, LedgerStore, NewLedgerEvent, Severity};
use crate::provider::AdsProvider;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("unknown component: {0}")]
    UnknownComponent(String),
    #[error("restart cooldown active for {component}, next attempt eligible at {eligible_at}")]
    CooldownActive {
        component: String,
        eligible_at: DateTime<Utc>,
    },
}

pub type Result<T> = std::result::Result<T, ControlError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Scheduler,
    Worker,
    WebhookIngestor,
    Reconciliator,
    AdsOrchestrator,
    AbEvaluator,
    Optimizer,
    IdentityRouter,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Scheduler => "scheduler",
            Component::Worker => "worker",
            Component::WebhookIngestor => "webhook_ingestor",
            Component::Reconciliator => "reconciliator",
            Component::AdsOrchestrator => "ads_orchestrator",
            Component::AbEvaluator => "ab_evaluator",
            Component::Optimizer => "optimizer",
            Component::IdentityRouter => "identity_router",
        }
    }

    pub fn all() -> [Component; 8] {
        [
            Component::Scheduler,
            Component::Worker,
            Component::WebhookIngestor,
            Component::Reconciliator,
            Component::AdsOrchestrator,
            Component::AbEvaluator,
            Component::Optimizer,
            Component::IdentityRouter,
        ]
    }

    /// Components halted by an emergency stop, per the control-flow spec.
    fn halted_on_emergency_stop(&self) -> bool {
        matches!(self, Component::Worker | Component::AdsOrchestrator | Component::Optimizer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Online,
    Degraded,
    Offline,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub component: Component,
    pub status: HealthStatus,
    pub error_rate_24h: f64,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// System-wide severity consulted by C9's guardrail stack and C1's writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemStatus {
    Nominal,
    Degraded,
    Critical,
    EmergencyStop,
}

/// Process-wide flags consulted by every component loop. Cheap to clone and
/// share across the tokio tasks each loop runs on.
#[derive(Debug, Clone)]
pub struct ControlFlags {
    pub paused: Arc<AtomicBool>,
    pub emergency_stop: Arc<AtomicBool>,
}

impl ControlFlags {
    pub fn new() -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(false)),
            emergency_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn should_halt(&self) -> bool {
        self.paused.load(Ordering::SeqCst) || self.emergency_stop.load(Ordering::SeqCst)
    }
}

impl Default for ControlFlags {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub restart_cooldown: Duration,
    pub restart_max_attempts: u32,
    pub error_rate_window: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            restart_cooldown: Duration::seconds(300),
            restart_max_attempts: 1,
            error_rate_window: Duration::hours(24),
        }
    }
}

pub struct MasterControl {
    ledger: Arc<LedgerStore>,
    flags: ControlFlags,
    config: ControlConfig,
    restart_history: Mutex<HashMap<Component, VecDeque<DateTime<Utc>>>>,
}

impl MasterControl {
    pub fn new(ledger: Arc<LedgerStore>, config: ControlConfig) -> Self {
        Self {
            ledger,
            flags: ControlFlags::new(),
            config,
            restart_history: Mutex::new(HashMap::new()),
        }
    }

    pub fn flags(&self) -> ControlFlags {
        self.flags.clone()
    }

    /// Reads the latest `component_heartbeat` and error events per component
    /// from the ledger; a component with no heartbeat in the window is
    /// `offline`, one with errors but recent heartbeats is `degraded`.
    pub fn health_check(&self, component: Component, now: DateTime<Utc>) -> Result<ComponentHealth> {
        let events = self.ledger.for_entity("component", component.as_str(), 200)?;

        let last_run_at = events
            .iter()
            .find(|event| event.event_type == "component_heartbeat")
            .map(|event| event.created_at);

        let window_start = now - self.config.error_rate_window;
        let (errors, total) = events
            .iter()
            .filter(|event| event.created_at >= window_start)
            .fold((0usize, 0usize), |(errors, total), event| {
                let is_error = matches!(event.severity, Severity::Error);
                (errors + is_error as usize, total + 1)
            });
        let error_rate_24h = if total == 0 { 0.0 } else { errors as f64 / total as f64 };

        let stale = last_run_at.map(|ts| now - ts > self.config.error_rate_window).unwrap_or(true);
        let status = if stale {
            HealthStatus::Offline
        } else if error_rate_24h > 0.5 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Online
        };

        Ok(ComponentHealth {
            component,
            status,
            error_rate_24h,
            last_run_at,
        })
    }

    pub fn run_health_check(&self, now: DateTime<Utc>) -> Result<Vec<ComponentHealth>> {
        Component::all().into_iter().map(|component| self.health_check(component, now)).collect()
    }

    /// Worst component status, used by C9's guardrail 7 and reported to operators.
    pub fn system_status(&self, now: DateTime<Utc>) -> Result<SystemStatus> {
        if self.flags.emergency_stop.load(Ordering::SeqCst) {
            return Ok(SystemStatus::EmergencyStop);
        }
        let reports = self.run_health_check(now)?;
        let offline_count = reports.iter().filter(|r| r.status == HealthStatus::Offline).count();
        let degraded_count = reports.iter().filter(|r| r.status == HealthStatus::Degraded).count();

        Ok(if offline_count >= 2 {
            SystemStatus::Critical
        } else if offline_count == 1 || degraded_count >= 2 {
            SystemStatus::Degraded
        } else {
            SystemStatus::Nominal
        })
    }

    pub fn start_all(&self) -> Result<()> {
        self.flags.paused.store(false, Ordering::SeqCst);
        self.flags.emergency_stop.store(false, Ordering::SeqCst);
        self.ledger.record(NewLedgerEvent::new(
            "control_start_all",
            "control",
            "master",
            Severity::Info,
            serde_json::json!({}),
        ))?;
        Ok(())
    }

    pub fn stop_all(&self) -> Result<()> {
        self.flags.paused.store(true, Ordering::SeqCst);
        self.ledger.record(NewLedgerEvent::new(
            "control_stop_all",
            "control",
            "master",
            Severity::Warn,
            serde_json::json!({}),
        ))?;
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.flags.paused.store(false, Ordering::SeqCst);
        self.flags.emergency_stop.store(false, Ordering::SeqCst);
        self.ledger.record(NewLedgerEvent::new(
            "control_resume",
            "control",
            "master",
            Severity::Info,
            serde_json::json!({}),
        ))?;
        Ok(())
    }

    /// Halts C4/C7/C9, pauses active ad campaigns via C7, and sets the
    /// process-wide flag C1/C8 consult before writing new scheduled records.
    pub async fn emergency_stop(&self, ads: &AdsStore, provider: &dyn AdsProvider, reason: &str) -> Result<usize> {
        self.flags.emergency_stop.store(true, Ordering::SeqCst);
        self.ledger.record(NewLedgerEvent::new(
            "control_emergency_stop",
            "control",
            "master",
            Severity::Error,
            serde_json::json!({"reason": reason}),
        ))?;

        let paused = ads.pause_all_active_campaigns(provider, &self.ledger).await.unwrap_or(0);
        Ok(paused)
    }

    /// Auto-recovery: attempts a restart at most once per cooldown, else
    /// escalates (returns a `CooldownActive` error the caller should page on).
    pub fn attempt_restart(&self, component: Component, now: DateTime<Utc>) -> Result<()> {
        let mut history = self.restart_history.lock().unwrap();
        let entries = history.entry(component).or_default();

        while entries.front().map(|ts| now - *ts > self.config.restart_cooldown).unwrap_or(false) {
            entries.pop_front();
        }

        if entries.len() as u32 >= self.config.restart_max_attempts {
            let eligible_at = *entries.front().unwrap() + self.config.restart_cooldown;
            self.ledger.record(NewLedgerEvent::new(
                "control_restart_escalated",
                "component",
                component.as_str(),
                Severity::Error,
                serde_json::json!({"eligible_at": eligible_at}),
            ))?;
            return Err(ControlError::CooldownActive {
                component: component.as_str().to_string(),
                eligible_at,
            });
        }

        entries.push_back(now);
        self.ledger.record(NewLedgerEvent::new(
            "control_restart_attempted",
            "component",
            component.as_str(),
            Severity::Warn,
            serde_json::json!({}),
        ))?;
        Ok(())
    }

    pub fn record_heartbeat(&self, component: Component) -> Result<()> {
        self.ledger.record(NewLedgerEvent::new(
            "component_heartbeat",
            "component",
            component.as_str(),
            Severity::Info,
            serde_json::json!({}),
        ))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::SimulatedProvider;
    use tempfile::tempdir;

    fn ledger() -> (tempfile::TempDir, Arc<LedgerStore>) {
        let dir = tempdir().unwrap();
        let store = LedgerStore::builder().path(dir.path().join("ledger.sqlite")).build().unwrap();
        store.initialize().unwrap();
        (dir, Arc::new(store))
    }

    #[test]
    fn no_heartbeat_is_offline() {
        let (_dir, ledger) = ledger();
        let control = MasterControl::new(ledger, ControlConfig::default());
        let health = control.health_check(Component::Worker, Utc::now()).unwrap();
        assert_eq!(health.status, HealthStatus::Offline);
    }

    #[test]
    fn recent_heartbeat_with_no_errors_is_online() {
        let (_dir, ledger) = ledger();
        let control = MasterControl::new(ledger, ControlConfig::default());
        control.record_heartbeat(Component::Worker).unwrap();
        let health = control.health_check(Component::Worker, Utc::now()).unwrap();
        assert_eq!(health.status, HealthStatus::Online);
    }

    #[tokio::test]
    async fn emergency_stop_sets_flag_and_pauses_campaigns() {
        let (dir, ledger) = ledger();
        let ads = AdsStore::builder().path(dir.path().join("ads.sqlite")).build().unwrap();
        ads.initialize().unwrap();
        let control = MasterControl::new(ledger.clone(), ControlConfig::default());
        let provider = SimulatedProvider::new();

        control.emergency_stop(&ads, &provider, "manual test trigger").await.unwrap();
        assert!(control.flags().emergency_stop.load(Ordering::SeqCst));
        assert!(control.flags().should_halt());
    }

    #[test]
    fn restart_cooldown_blocks_second_attempt() {
        let (_dir, ledger) = ledger();
        let mut config = ControlConfig::default();
        config.restart_max_attempts = 1;
        let control = MasterControl::new(ledger, config);
        let now = Utc::now();
        control.attempt_restart(Component::Worker, now).unwrap();
        let result = control.attempt_restart(Component::Worker, now + Duration::seconds(10));
        assert!(matches!(result, Err(ControlError::CooldownActive { .. })));
    }

    #[test]
    fn halted_components_on_emergency_stop() {
        assert!(Component::Worker.halted_on_emergency_stop());
        assert!(Component::AdsOrchestrator.halted_on_emergency_stop());
        assert!(Component::Optimizer.halted_on_emergency_stop());
        assert!(!Component::Scheduler.halted_on_emergency_stop());
    }
}
