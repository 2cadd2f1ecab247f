use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A user account as persisted under `accounts/{accountId}`. Balances are
/// mutated only by the reward ledger and the commission propagator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub balance: f64,
    pub total_earned: f64,
    pub total_withdrawn: f64,
    #[serde(default)]
    pub ads_watched_today: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ad_watch: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referred_by: Option<String>,
}

/// Per-(account, provider) counter state persisted under
/// `watchRecords/{accountId}/{providerId}`. Created on first watch, never
/// deleted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchRecord {
    #[serde(default)]
    pub watched_today: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_watched: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reset: Option<DateTime<Utc>>,
}

impl WatchRecord {
    /// Daily count with the lazy fallback applied: a record whose last
    /// authoritative reset happened on a previous local day reads as zero
    /// even before the scheduler has caught up.
    pub fn watched_today_as_of(&self, now: DateTime<Utc>, tz: FixedOffset) -> u32 {
        match self.last_reset {
            Some(reset) if local_day(reset, tz) != local_day(now, tz) => 0,
            _ => self.watched_today,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Earn,
    ReferralCommission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Completed,
    Pending,
    Failed,
}

/// Immutable, append-only crediting record persisted under
/// `transactions/{transactionId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub account_id: String,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub amount: f64,
    pub description: String,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferredUser {
    pub joined_at: DateTime<Utc>,
    pub total_earned: f64,
    pub commission_earned: f64,
}

/// Referral bookkeeping persisted under `referrals/{referrerAccountId}`.
/// `referral_earnings` and `referred_count` are recomputed from the full map
/// on every mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralRecord {
    #[serde(default)]
    pub referred_users: BTreeMap<String, ReferredUser>,
    #[serde(default)]
    pub referral_earnings: f64,
    #[serde(default)]
    pub referred_count: u32,
}

/// How a provider integration signals completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signalling {
    #[default]
    Awaited,
    Callback,
}

/// Effective provider configuration: compiled defaults merged with any
/// `providerConfig/{providerId}` override document from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub provider: String,
    pub reward: f64,
    /// 0 means unlimited.
    pub daily_limit: u32,
    /// Declared but not consulted by admission; see DESIGN.md.
    pub hourly_limit: u32,
    pub cooldown_seconds: u64,
    pub minimum_watch_seconds: u64,
    pub enabled: bool,
    pub app_id: String,
    #[serde(default)]
    pub signalling: Signalling,
}

/// Partial override document. Every present field replaces the compiled
/// default for that provider; absent fields fall through.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderOverrides {
    pub reward: Option<f64>,
    pub daily_limit: Option<u32>,
    pub hourly_limit: Option<u32>,
    pub cooldown_seconds: Option<u64>,
    pub minimum_watch_seconds: Option<u64>,
    pub enabled: Option<bool>,
    pub app_id: Option<String>,
}

impl ProviderConfig {
    pub fn merged(&self, overrides: &ProviderOverrides) -> ProviderConfig {
        ProviderConfig {
            provider: self.provider.clone(),
            reward: overrides.reward.unwrap_or(self.reward),
            daily_limit: overrides.daily_limit.unwrap_or(self.daily_limit),
            hourly_limit: overrides.hourly_limit.unwrap_or(self.hourly_limit),
            cooldown_seconds: overrides.cooldown_seconds.unwrap_or(self.cooldown_seconds),
            minimum_watch_seconds: overrides
                .minimum_watch_seconds
                .unwrap_or(self.minimum_watch_seconds),
            enabled: overrides.enabled.unwrap_or(self.enabled),
            app_id: overrides.app_id.clone().unwrap_or_else(|| self.app_id.clone()),
            signalling: self.signalling,
        }
    }
}

/// Logical store paths. The store adapter owns any mapping to its native key
/// syntax.
pub mod paths {
    pub const LAST_RESET_DATE: &str = "system/lastResetDate";
    pub const WATCH_RECORDS: &str = "watchRecords";
    pub const PROVIDER_CONFIG: &str = "providerConfig";
    pub const TRANSACTIONS: &str = "transactions";

    pub fn account(account_id: &str) -> String {
        format!("accounts/{}", account_id)
    }

    pub fn watch_record(account_id: &str, provider_id: &str) -> String {
        format!("watchRecords/{}/{}", account_id, provider_id)
    }

    pub fn transaction(transaction_id: &str) -> String {
        format!("transactions/{}", transaction_id)
    }

    pub fn referral(referrer_id: &str) -> String {
        format!("referrals/{}", referrer_id)
    }

    pub fn provider_config(provider_id: &str) -> String {
        format!("providerConfig/{}", provider_id)
    }
}

/// Calendar day of `at` in the reference timezone.
pub fn local_day(at: DateTime<Utc>, tz: FixedOffset) -> NaiveDate {
    at.with_timezone(&tz).date_naive()
}

/// ISO `YYYY-MM-DD` rendering of the local day, the format of the
/// `system/lastResetDate` marker.
pub fn local_day_string(at: DateTime<Utc>, tz: FixedOffset) -> String {
    local_day(at, tz).format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bd() -> FixedOffset {
        FixedOffset::east_opt(6 * 3600).unwrap()
    }

    #[test]
    fn local_day_crosses_midnight_in_reference_timezone() {
        // 22:30 UTC is 04:30 next day at UTC+6.
        let at = Utc.with_ymd_and_hms(2025, 3, 10, 22, 30, 0).unwrap();
        assert_eq!(local_day_string(at, bd()), "2025-03-11");

        let at = Utc.with_ymd_and_hms(2025, 3, 10, 17, 59, 59).unwrap();
        assert_eq!(local_day_string(at, bd()), "2025-03-10");
    }

    #[test]
    fn watch_record_lazy_reset_reads_zero_after_day_change() {
        let yesterday = Utc.with_ymd_and_hms(2025, 3, 9, 12, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let record = WatchRecord {
            watched_today: 4,
            last_watched: Some(yesterday),
            last_reset: Some(yesterday),
        };
        assert_eq!(record.watched_today_as_of(now, bd()), 0);
        assert_eq!(record.watched_today_as_of(yesterday, bd()), 4);
    }

    #[test]
    fn watch_record_without_reset_marker_keeps_count() {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let record = WatchRecord {
            watched_today: 3,
            last_watched: Some(now),
            last_reset: None,
        };
        assert_eq!(record.watched_today_as_of(now, bd()), 3);
    }

    #[test]
    fn provider_override_merge_is_field_by_field() {
        let base = ProviderConfig {
            provider: "adexora".to_string(),
            reward: 0.5,
            daily_limit: 5,
            hourly_limit: 2,
            cooldown_seconds: 60,
            minimum_watch_seconds: 5,
            enabled: true,
            app_id: "387".to_string(),
            signalling: Signalling::Awaited,
        };
        let overrides = ProviderOverrides {
            reward: Some(0.75),
            enabled: Some(false),
            ..Default::default()
        };
        let merged = base.merged(&overrides);
        assert_eq!(merged.reward, 0.75);
        assert!(!merged.enabled);
        assert_eq!(merged.daily_limit, 5);
        assert_eq!(merged.cooldown_seconds, 60);
        assert_eq!(merged.app_id, "387");
    }
}
