use chrono::{DateTime, FixedOffset, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::AdsError;
use crate::models::{
    local_day, paths, Account, Transaction, TransactionStatus, TransactionType, WatchRecord,
};
use crate::store::{get_typed, to_value, KvStore};

/// What a successful credit changed. Failure is always a distinct error,
/// never a zero-valued receipt.
#[derive(Debug, Clone)]
pub struct CreditReceipt {
    pub amount: f64,
    pub balance: f64,
    pub ads_watched_today: u32,
    pub watched_today: u32,
    pub transaction_id: String,
}

/// Applies a single reward credit: account balances, the per-provider watch
/// record, and an immutable `earn` transaction, written as one batched
/// update.
pub struct RewardLedger {
    store: Arc<dyn KvStore>,
    tz: FixedOffset,
}

impl RewardLedger {
    pub fn new(store: Arc<dyn KvStore>, tz: FixedOffset) -> Self {
        Self { store, tz }
    }

    pub async fn credit(
        &self,
        account_id: &str,
        provider_id: &str,
        reward: f64,
        now: DateTime<Utc>,
    ) -> Result<CreditReceipt, AdsError> {
        let account_path = paths::account(account_id);
        let account: Account = get_typed(self.store.as_ref(), &account_path)
            .await?
            .ok_or_else(|| AdsError::NotFound(format!("account {}", account_id)))?;

        let ads_watched_today = match account.last_ad_watch {
            Some(previous) if local_day(previous, self.tz) == local_day(now, self.tz) => {
                account.ads_watched_today + 1
            }
            _ => 1,
        };
        let updated_account = Account {
            balance: account.balance + reward,
            total_earned: account.total_earned + reward,
            ads_watched_today,
            last_ad_watch: Some(now),
            ..account
        };

        let record_path = paths::watch_record(account_id, provider_id);
        let record: WatchRecord = get_typed(self.store.as_ref(), &record_path)
            .await?
            .unwrap_or_default();
        let updated_record = WatchRecord {
            watched_today: record.watched_today_as_of(now, self.tz) + 1,
            last_watched: Some(now),
            last_reset: record.last_reset,
        };

        let transaction = Transaction {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            kind: TransactionType::Earn,
            amount: reward,
            description: format!("Ad reward from {}", provider_id),
            status: TransactionStatus::Completed,
            created_at: now,
        };

        let mut changes = BTreeMap::new();
        changes.insert(account_path, to_value(&updated_account)?);
        changes.insert(record_path, to_value(&updated_record)?);
        changes.insert(paths::transaction(&transaction.id), to_value(&transaction)?);
        self.store.update(changes).await?;

        info!(
            "Credited {:.2} to {} for {} ({} watched today)",
            reward, account_id, provider_id, updated_record.watched_today
        );

        Ok(CreditReceipt {
            amount: reward,
            balance: updated_account.balance,
            ads_watched_today,
            watched_today: updated_record.watched_today,
            transaction_id: transaction.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn bd() -> FixedOffset {
        FixedOffset::east_opt(6 * 3600).unwrap()
    }

    async fn seed_account(store: &MemoryStore, account_id: &str, account: &Account) {
        store
            .set(&paths::account(account_id), to_value(account).unwrap())
            .await
            .unwrap();
    }

    fn account() -> Account {
        Account {
            balance: 2.0,
            total_earned: 10.0,
            total_withdrawn: 1.0,
            ads_watched_today: 3,
            last_ad_watch: None,
            referred_by: None,
        }
    }

    #[tokio::test]
    async fn credit_updates_account_record_and_transaction() {
        let store = Arc::new(MemoryStore::new());
        let ledger = RewardLedger::new(store.clone(), bd());
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();

        let mut acct = account();
        acct.last_ad_watch = Some(now - chrono::Duration::hours(1));
        seed_account(&store, "1001", &acct).await;

        let receipt = ledger.credit("1001", "adexora", 0.5, now).await.unwrap();
        assert_eq!(receipt.amount, 0.5);
        assert_eq!(receipt.balance, 2.5);
        assert_eq!(receipt.ads_watched_today, 4);
        assert_eq!(receipt.watched_today, 1);

        let stored: Account = get_typed(store.as_ref(), &paths::account("1001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.balance, 2.5);
        assert_eq!(stored.total_earned, 10.5);
        assert_eq!(stored.total_withdrawn, 1.0);
        assert_eq!(stored.last_ad_watch, Some(now));

        let record: WatchRecord =
            get_typed(store.as_ref(), &paths::watch_record("1001", "adexora"))
                .await
                .unwrap()
                .unwrap();
        assert_eq!(record.watched_today, 1);
        assert_eq!(record.last_watched, Some(now));

        let transactions = store.list(paths::TRANSACTIONS).await.unwrap();
        assert_eq!(transactions.len(), 1);
        let tx: Transaction = serde_json::from_value(transactions[0].1.clone()).unwrap();
        assert_eq!(tx.kind, TransactionType::Earn);
        assert_eq!(tx.amount, 0.5);
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(tx.account_id, "1001");
    }

    #[tokio::test]
    async fn day_boundary_resets_account_counter_to_one() {
        let store = Arc::new(MemoryStore::new());
        let ledger = RewardLedger::new(store.clone(), bd());

        // Last watch on March 9th local time; crediting on March 10th.
        let yesterday = Utc.with_ymd_and_hms(2025, 3, 9, 12, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let mut acct = account();
        acct.ads_watched_today = 7;
        acct.last_ad_watch = Some(yesterday);
        seed_account(&store, "1001", &acct).await;

        let receipt = ledger.credit("1001", "adexora", 0.5, now).await.unwrap();
        assert_eq!(receipt.ads_watched_today, 1);
    }

    #[tokio::test]
    async fn stale_watch_record_restarts_count_at_one() {
        let store = Arc::new(MemoryStore::new());
        let ledger = RewardLedger::new(store.clone(), bd());
        let yesterday = Utc.with_ymd_and_hms(2025, 3, 9, 12, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();

        seed_account(&store, "1001", &account()).await;
        let stale = WatchRecord {
            watched_today: 5,
            last_watched: Some(yesterday),
            last_reset: Some(yesterday),
        };
        store
            .set(
                &paths::watch_record("1001", "adexora"),
                to_value(&stale).unwrap(),
            )
            .await
            .unwrap();

        let receipt = ledger.credit("1001", "adexora", 0.5, now).await.unwrap();
        assert_eq!(receipt.watched_today, 1);
    }

    #[tokio::test]
    async fn missing_account_is_a_distinct_error() {
        let store = Arc::new(MemoryStore::new());
        let ledger = RewardLedger::new(store.clone(), bd());
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();

        let err = ledger.credit("missing", "adexora", 0.5, now).await.unwrap_err();
        assert!(matches!(err, AdsError::NotFound(_)));
    }
}
