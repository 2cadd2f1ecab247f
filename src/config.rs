use anyhow::Result;
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::fs;

use crate::error::AdsError;
use crate::models::{ProviderConfig, Signalling};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub reset: ResetConfig,
    #[serde(default)]
    pub referral: ReferralConfig,
    /// Compiled provider defaults; store-side overrides merge on top.
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Nats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    #[serde(default = "default_nats_url")]
    pub nats_url: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_bucket() -> String {
    "ad-rewards".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetConfig {
    /// Local hour after which the daily reset becomes eligible.
    #[serde(default = "default_cutoff_hour")]
    pub cutoff_hour: u32,
    /// Reference timezone as a fixed UTC offset.
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
}

fn default_cutoff_hour() -> u32 {
    6
}

fn default_utc_offset_hours() -> i32 {
    6
}

fn default_check_interval() -> u64 {
    60
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            cutoff_hour: default_cutoff_hour(),
            utc_offset_hours: default_utc_offset_hours(),
            check_interval_seconds: default_check_interval(),
        }
    }
}

impl ResetConfig {
    pub fn timezone(&self) -> Result<FixedOffset, AdsError> {
        if self.cutoff_hour >= 24 {
            return Err(AdsError::Config(format!(
                "cutoff_hour out of range: {}",
                self.cutoff_hour
            )));
        }
        FixedOffset::east_opt(self.utc_offset_hours * 3600).ok_or_else(|| {
            AdsError::Config(format!(
                "utc_offset_hours out of range: {}",
                self.utc_offset_hours
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralConfig {
    #[serde(default = "default_commission_rate")]
    pub commission_rate: f64,
}

fn default_commission_rate() -> f64 {
    crate::referral::DEFAULT_COMMISSION_RATE
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self {
            commission_rate: default_commission_rate(),
        }
    }
}

fn provider(id: &str, app_id: &str, signalling: Signalling) -> ProviderConfig {
    ProviderConfig {
        provider: id.to_string(),
        reward: 0.5,
        daily_limit: 5,
        hourly_limit: 2,
        cooldown_seconds: 60,
        minimum_watch_seconds: 5,
        enabled: true,
        app_id: app_id.to_string(),
        signalling,
    }
}

/// The provider fleet of the original deployment with its activation ids.
pub fn default_providers() -> Vec<ProviderConfig> {
    vec![
        provider("adexora", "387", Signalling::Awaited),
        provider("gigapub", "1872", Signalling::Awaited),
        provider("onclicka", "6090192", Signalling::Awaited),
        provider("auruads", "7479", Signalling::Awaited),
        provider("libtl", "9878570", Signalling::Awaited),
        provider(
            "adextra",
            "c573986974ab6f6b9e52bb47e7a296e25a2db758",
            Signalling::Callback,
        ),
    ]
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_falls_back_to_compiled_defaults() {
        let yaml = r#"
server:
  host: 127.0.0.1
  port: 8080
store:
  backend: memory
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.reset.cutoff_hour, 6);
        assert_eq!(config.reset.utc_offset_hours, 6);
        assert_eq!(config.referral.commission_rate, 0.10);
        assert_eq!(config.providers.len(), 6);

        let adextra = config
            .providers
            .iter()
            .find(|p| p.provider == "adextra")
            .unwrap();
        assert_eq!(adextra.signalling, Signalling::Callback);
        assert_eq!(adextra.daily_limit, 5);
    }

    #[test]
    fn timezone_rejects_bad_offsets() {
        let reset = ResetConfig {
            cutoff_hour: 6,
            utc_offset_hours: 99,
            check_interval_seconds: 60,
        };
        assert!(reset.timezone().is_err());

        let reset = ResetConfig {
            cutoff_hour: 25,
            utc_offset_hours: 6,
            check_interval_seconds: 60,
        };
        assert!(reset.timezone().is_err());
    }
}
