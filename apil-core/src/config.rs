use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ApilConfig {
    pub system: SystemSection,
    pub paths: PathsSection,
    pub scheduler: SchedulerSection,
    pub worker: WorkerSection,
    pub reconciliator: ReconciliatorSection,
    pub optimizer: OptimizerSection,
    pub abtest: AbTestSection,
    pub identity: IdentitySection,
    pub control: ControlSection,
    pub monitoring: MonitoringSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    pub node_name: String,
    pub node_role: String,
    pub node_id: String,
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub data_dir: String,
    pub logs_dir: String,
}

impl ApilConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    pub tick_interval_seconds: u64,
    pub tick_slack_seconds: u64,
    pub horizon_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    pub poll_interval_seconds: u64,
    pub publish_timeout_seconds: u64,
    pub max_backoff_seconds: u64,
    pub default_max_retries: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliatorSection {
    pub sweep_interval_seconds: u64,
    pub reconcile_window_minutes: i64,
    pub timeout_threshold_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptimizerSection {
    pub tick_interval_seconds: u64,
    pub mode: String,
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
    pub max_per_campaign: u32,
    pub max_per_run: u32,
    pub action_ttl_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AbTestSection {
    pub default_min_impressions: i64,
    pub default_min_duration_hours: i64,
    pub significance_alpha: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentitySection {
    pub pool_size_android: u32,
    pub pool_size_ios: u32,
    pub pool_size_generic_pc: u32,
    pub exclusive_vpn_accounts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlSection {
    pub health_check_interval_seconds: u64,
    pub restart_cooldown_seconds: u64,
    pub restart_max_attempts: u32,
    pub error_rate_window_hours: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringSection {
    pub metrics_collection_interval_seconds: u64,
    pub alert_telegram_enabled: bool,
    pub alert_email_enabled: bool,
}

/// `platform -> {window_start_hour, window_end_hour, min_gap_minutes}`; one
/// TOML table per supported platform, admin-overridable per §4.2.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformsConfig {
    #[serde(flatten)]
    pub platforms: HashMap<String, PlatformSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformSection {
    pub window_start_hour: u32,
    pub window_end_hour: u32,
    pub min_gap_minutes: i64,
}

impl PlatformsConfig {
    pub fn get(&self, platform: &str) -> Option<&PlatformSection> {
        self.platforms.get(platform)
    }
}

#[derive(Debug, Clone)]
pub struct ConfigBundle {
    pub apil: ApilConfig,
    pub platforms: PlatformsConfig,
}

impl ConfigBundle {
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let apil = load_apil_config(dir.join("apil.toml"))?;
        let platforms = load_platforms_config(dir.join("platforms.toml"))?;
        Ok(Self { apil, platforms })
    }
}

pub fn load_apil_config<P: AsRef<Path>>(path: P) -> Result<ApilConfig> {
    load_toml(path)
}

pub fn load_platforms_config<P: AsRef<Path>>(path: P) -> Result<PlatformsConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_configs() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs");
        let bundle = ConfigBundle::from_directory(dir).expect("configs should parse");
        assert_eq!(bundle.apil.system.node_name, "apil-primary");
        assert_eq!(bundle.apil.optimizer.mode, "suggest");
        let tiktok = bundle.platforms.get("tiktok").expect("tiktok platform configured");
        assert_eq!(tiktok.min_gap_minutes, 20);
    }
}
