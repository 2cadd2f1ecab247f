use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::AdsError;
use crate::models::{
    paths, Account, ReferralRecord, ReferredUser, Transaction, TransactionStatus, TransactionType,
};
use crate::store::{get_typed, to_value, KvStore};

pub const DEFAULT_COMMISSION_RATE: f64 = 0.10;

/// Pays the referring account a fixed percentage of every reward the
/// referred account earns. Lookups are read-then-write with no cross-account
/// locking; a failure here never blocks or reverses the primary credit.
pub struct ReferralCommissionPropagator {
    store: Arc<dyn KvStore>,
    rate: f64,
}

impl ReferralCommissionPropagator {
    pub fn new(store: Arc<dyn KvStore>, rate: f64) -> Self {
        Self { store, rate }
    }

    /// Returns `Ok(true)` when a commission was paid, `Ok(false)` when the
    /// account has no referrer. Missing accounts surface as
    /// `ReferrerLookupFailed`, which callers treat as non-fatal.
    pub async fn propagate(
        &self,
        referred_id: &str,
        earned: f64,
        now: DateTime<Utc>,
    ) -> Result<bool, AdsError> {
        let referred: Account = get_typed(self.store.as_ref(), &paths::account(referred_id))
            .await?
            .ok_or_else(|| {
                AdsError::ReferrerLookupFailed(format!("referred account {} not found", referred_id))
            })?;

        let Some(referrer_id) = referred.referred_by.clone() else {
            return Ok(false);
        };

        let referrer_path = paths::account(&referrer_id);
        let referrer: Account = get_typed(self.store.as_ref(), &referrer_path)
            .await?
            .ok_or_else(|| {
                AdsError::ReferrerLookupFailed(format!("referrer account {} not found", referrer_id))
            })?;

        let commission = earned * self.rate;
        let updated_referrer = Account {
            balance: referrer.balance + commission,
            total_earned: referrer.total_earned + commission,
            ..referrer
        };

        let record_path = paths::referral(&referrer_id);
        let mut record: ReferralRecord = get_typed(self.store.as_ref(), &record_path)
            .await?
            .unwrap_or_default();
        let entry = record
            .referred_users
            .entry(referred_id.to_string())
            .or_insert(ReferredUser {
                joined_at: now,
                total_earned: 0.0,
                commission_earned: 0.0,
            });
        entry.total_earned += earned;
        entry.commission_earned += commission;
        record.referral_earnings = record
            .referred_users
            .values()
            .map(|user| user.commission_earned)
            .sum();
        record.referred_count = record.referred_users.len() as u32;

        let transaction = Transaction {
            id: Uuid::new_v4().to_string(),
            account_id: referrer_id.clone(),
            kind: TransactionType::ReferralCommission,
            amount: commission,
            description: format!("Referral commission from {}", referred_id),
            status: TransactionStatus::Completed,
            created_at: now,
        };

        let mut changes = BTreeMap::new();
        changes.insert(referrer_path, to_value(&updated_referrer)?);
        changes.insert(record_path, to_value(&record)?);
        changes.insert(paths::transaction(&transaction.id), to_value(&transaction)?);
        self.store.update(changes).await?;

        info!(
            "Paid {:.2} referral commission to {} for {}",
            commission, referrer_id, referred_id
        );

        Ok(true)
    }
}
