use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Target platforms the core publishes to. Deliberately closed: adding a
/// platform means adding a variant and a config section, not a new string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Instagram,
    TikTok,
    YouTube,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Instagram => "instagram",
            Platform::TikTok => "tiktok",
            Platform::YouTube => "youtube",
        }
    }

    /// Multiplier applied to `predicted_virality` in the C1 priority formula.
    pub fn virality_multiplier(&self) -> f64 {
        match self {
            Platform::TikTok => 1.3,
            Platform::Instagram => 1.1,
            Platform::YouTube => 1.0,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "instagram" => Ok(Platform::Instagram),
            "tiktok" => Ok(Platform::TikTok),
            "youtube" => Ok(Platform::YouTube),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}

/// A candidate clip handed to the core from the (out-of-scope) curation
/// pipeline. Immutable once created here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clip {
    pub id: String,
    pub source_video_id: String,
    pub duration_ms: i64,
    pub visual_score: f64,
    #[serde(default)]
    pub params: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Clip {
    pub fn engagement_score(&self) -> f64 {
        self.params
            .get("engagement_score")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 100.0)
    }

    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_seconds() as f64 / 3600.0
    }
}

/// Read-only campaign-budget association input to C1's `campaign_weight`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignBudget {
    pub clip_id: String,
    pub campaign_id: String,
    pub budget_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocialAccount {
    pub id: String,
    pub platform: Platform,
    pub has_credentials: bool,
    pub identity_handle: String,
}
