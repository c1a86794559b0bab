//! Platform/Ads provider abstraction shared by C4, C7 and C9. Generalizes
//! the teacher's `CommandExecutor`/`SystemCommandExecutor` split in
//! `browser/ip_rotator.rs`: a real, stub-able implementation behind a trait
//! object so the worker, ads orchestrator and optimizer can all be driven
//! by an in-memory recorder in tests.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Error taxonomy a provider call can fail with. The worker's retry
/// classifier switches on this, not on string matching.
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limited, retry after {retry_after_secs}s: {message}")]
    RateLimit { retry_after_secs: u64, message: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("provider server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("unknown provider error: {0}")]
    Unknown(String),
}

impl ProviderError {
    /// Network/timeout, rate limit, and 5xx responses are retryable; auth
    /// and validation errors are fatal; unknown errors default retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Auth(_) | ProviderError::Validation(_) => false,
            ProviderError::RateLimit { .. }
            | ProviderError::Network(_)
            | ProviderError::Server { .. }
            | ProviderError::Unknown(_) => true,
        }
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub external_post_id: String,
    pub external_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InsightsSnapshot {
    pub impressions: i64,
    pub clicks: i64,
    pub spend_usd: f64,
    pub roas: f64,
}

/// The publishing side a worker (C4) drives per platform.
#[async_trait]
pub trait PlatformProvider: Send + Sync {
    fn supports_real_api(&self) -> bool;
    async fn upload_creative(&self, account_id: &str, clip_id: &str, asset_ref: &str) -> ProviderResult<String>;
    async fn publish_post(&self, account_id: &str, creative_ref: &str, caption: &str) -> ProviderResult<PublishOutcome>;
}

/// The ads-mutation side C7 and C9 drive.
#[async_trait]
pub trait AdsProvider: Send + Sync {
    async fn create_campaign(&self, name: &str, daily_budget_cents: i64) -> ProviderResult<String>;
    async fn create_adset(&self, campaign_external_id: &str, targeting: &Value, budget_cents: i64) -> ProviderResult<String>;
    async fn upload_ad_creative(&self, clip_id: &str) -> ProviderResult<String>;
    async fn create_ad(&self, adset_external_id: &str, creative_external_id: &str) -> ProviderResult<String>;
    async fn get_insights(&self, ad_external_id: &str) -> ProviderResult<InsightsSnapshot>;
    async fn update_budget(&self, target_external_id: &str, new_budget_cents: i64) -> ProviderResult<()>;
    async fn pause_entity(&self, target_external_id: &str) -> ProviderResult<()>;
    async fn resume_entity(&self, target_external_id: &str) -> ProviderResult<()>;
}

/// Deterministic in-memory provider used whenever a social account has no
/// stored credentials, or in tests. Never fails unless asked to via
/// `force_error`.
pub struct SimulatedProvider {
    pub force_error: Option<ProviderError>,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self { force_error: None }
    }
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: ProviderError) -> Self {
        Self { force_error: Some(error) }
    }
}

#[async_trait]
impl PlatformProvider for SimulatedProvider {
    fn supports_real_api(&self) -> bool {
        false
    }

    async fn upload_creative(&self, _account_id: &str, clip_id: &str, _asset_ref: &str) -> ProviderResult<String> {
        if let Some(error) = &self.force_error {
            return Err(error.clone());
        }
        Ok(format!("sim-creative-{clip_id}"))
    }

    async fn publish_post(&self, account_id: &str, creative_ref: &str, _caption: &str) -> ProviderResult<PublishOutcome> {
        if let Some(error) = &self.force_error {
            return Err(error.clone());
        }
        Ok(PublishOutcome {
            external_post_id: format!("sim-post-{account_id}-{creative_ref}"),
            external_url: Some(format!("https://simulated.invalid/{account_id}/{creative_ref}")),
        })
    }
}

#[async_trait]
impl AdsProvider for SimulatedProvider {
    async fn create_campaign(&self, name: &str, _daily_budget_cents: i64) -> ProviderResult<String> {
        if let Some(error) = &self.force_error {
            return Err(error.clone());
        }
        Ok(format!("sim-campaign-{name}"))
    }

    async fn create_adset(&self, campaign_external_id: &str, _targeting: &Value, _budget_cents: i64) -> ProviderResult<String> {
        if let Some(error) = &self.force_error {
            return Err(error.clone());
        }
        Ok(format!("sim-adset-{campaign_external_id}"))
    }

    async fn upload_ad_creative(&self, clip_id: &str) -> ProviderResult<String> {
        if let Some(error) = &self.force_error {
            return Err(error.clone());
        }
        Ok(format!("sim-creative-{clip_id}"))
    }

    async fn create_ad(&self, adset_external_id: &str, creative_external_id: &str) -> ProviderResult<String> {
        if let Some(error) = &self.force_error {
            return Err(error.clone());
        }
        Ok(format!("sim-ad-{adset_external_id}-{creative_external_id}"))
    }

    async fn get_insights(&self, _ad_external_id: &str) -> ProviderResult<InsightsSnapshot> {
        if let Some(error) = &self.force_error {
            return Err(error.clone());
        }
        Ok(InsightsSnapshot {
            impressions: 0,
            clicks: 0,
            spend_usd: 0.0,
            roas: 0.0,
        })
    }

    async fn update_budget(&self, _target_external_id: &str, _new_budget_cents: i64) -> ProviderResult<()> {
        if let Some(error) = &self.force_error {
            return Err(error.clone());
        }
        Ok(())
    }

    async fn pause_entity(&self, _target_external_id: &str) -> ProviderResult<()> {
        if let Some(error) = &self.force_error {
            return Err(error.clone());
        }
        Ok(())
    }

    async fn resume_entity(&self, _target_external_id: &str) -> ProviderResult<()> {
        if let Some(error) = &self.force_error {
            return Err(error.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_provider_publishes_deterministically() {
        let provider = SimulatedProvider::new();
        let creative = provider.upload_creative("acct-1", "clip-1", "asset.mp4").await.unwrap();
        let outcome = provider.publish_post("acct-1", &creative, "caption").await.unwrap();
        assert!(outcome.external_post_id.starts_with("sim-post-acct-1"));
    }

    #[tokio::test]
    async fn forced_error_propagates() {
        let provider = SimulatedProvider::failing(ProviderError::Auth("bad token".into()));
        let result = provider.upload_creative("acct-1", "clip-1", "asset.mp4").await;
        assert!(matches!(result, Err(ProviderError::Auth(_))));
    }

    #[test]
    fn retryability_matches_classification() {
        assert!(!ProviderError::Auth("x".into()).is_retryable());
        assert!(!ProviderError::Validation("x".into()).is_retryable());
        assert!(ProviderError::Network("x".into()).is_retryable());
        assert!(ProviderError::RateLimit { retry_after_secs: 5, message: "x".into() }.is_retryable());
        assert!(ProviderError::Server { status: 500, message: "x".into() }.is_retryable());
    }
}
