use chrono::{DateTime, FixedOffset, Timelike, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::AdsError;
use crate::models::{local_day_string, paths, WatchRecord};
use crate::store::{to_value, KvStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Resetting,
}

/// When the next authoritative reset becomes eligible: the cutoff hour of
/// today in the reference timezone, or tomorrow's if that has passed.
pub fn next_reset_at(now: DateTime<Utc>, tz: FixedOffset, cutoff_hour: u32) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    let Some(today_cutoff) = local
        .date_naive()
        .and_hms_opt(cutoff_hour, 0, 0)
        .and_then(|naive| naive.and_local_timezone(tz).single())
    else {
        return now;
    };
    let next = if local >= today_cutoff {
        today_cutoff + chrono::Duration::days(1)
    } else {
        today_cutoff
    };
    next.with_timezone(&Utc)
}

/// Clears every per-(account, provider) daily counter once per local day,
/// any time after the cutoff hour. The `system/lastResetDate` marker is
/// written before the batch so a racing second instance sees it and skips;
/// a partially applied batch self-heals through the per-record `lastReset`
/// day comparison.
pub struct ResetScheduler {
    store: Arc<dyn KvStore>,
    tz: FixedOffset,
    cutoff_hour: u32,
    check_interval: Duration,
    state: SchedulerState,
}

impl ResetScheduler {
    pub fn new(
        store: Arc<dyn KvStore>,
        tz: FixedOffset,
        cutoff_hour: u32,
        check_interval: Duration,
    ) -> Self {
        Self {
            store,
            tz,
            cutoff_hour,
            check_interval,
            state: SchedulerState::Idle,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn next_reset_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        next_reset_at(now, self.tz, self.cutoff_hour)
    }

    /// One staleness evaluation. Returns whether a batch reset ran.
    pub async fn check_and_reset(&mut self, now: DateTime<Utc>) -> Result<bool, AdsError> {
        let today = local_day_string(now, self.tz);
        let hour = now.with_timezone(&self.tz).hour();

        let marker = self
            .store
            .get(paths::LAST_RESET_DATE)
            .await?
            .and_then(|value| value.as_str().map(|s| s.to_string()));

        let due = hour >= self.cutoff_hour && marker.as_deref() != Some(today.as_str());
        if !due {
            return Ok(false);
        }

        self.state = SchedulerState::Resetting;
        info!("Performing daily reset for all watch records ({})", today);
        let result = self.run_batch_reset(&today, now).await;
        // Back to idle unconditionally; a failed batch is retried naturally
        // on a later tick and partial clears are tolerated.
        self.state = SchedulerState::Idle;
        result.map(|_| true)
    }

    async fn run_batch_reset(&self, today: &str, now: DateTime<Utc>) -> Result<(), AdsError> {
        // Marker first: this is what makes the reset re-entrant.
        self.store
            .set(paths::LAST_RESET_DATE, Value::String(today.to_string()))
            .await?;

        let records = self.store.list(paths::WATCH_RECORDS).await?;
        let mut changes = BTreeMap::new();
        for (path, value) in records {
            let mut record: WatchRecord = match serde_json::from_value(value) {
                Ok(record) => record,
                Err(err) => {
                    warn!("Skipping malformed watch record at {}: {}", path, err);
                    continue;
                }
            };
            record.watched_today = 0;
            record.last_reset = Some(now);
            changes.insert(path, to_value(&record)?);
        }

        if !changes.is_empty() {
            let count = changes.len();
            self.store.update(changes).await?;
            info!("Daily reset cleared {} watch records", count);
        }
        Ok(())
    }

    /// Periodic staleness loop: one check right away, then every interval.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.check_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = self.check_and_reset(Utc::now()).await {
                error!("Daily reset check failed: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{get_typed, MemoryStore};
    use chrono::TimeZone;

    fn bd() -> FixedOffset {
        FixedOffset::east_opt(6 * 3600).unwrap()
    }

    fn scheduler(store: Arc<MemoryStore>) -> ResetScheduler {
        ResetScheduler::new(store, bd(), 6, Duration::from_secs(60))
    }

    async fn seed_record(store: &MemoryStore, account: &str, provider: &str, watched: u32) {
        let record = WatchRecord {
            watched_today: watched,
            last_watched: Some(Utc.with_ymd_and_hms(2025, 3, 9, 12, 0, 0).unwrap()),
            last_reset: None,
        };
        store
            .set(
                &paths::watch_record(account, provider),
                to_value(&record).unwrap(),
            )
            .await
            .unwrap();
    }

    // 01:00 UTC is 07:00 at UTC+6, past the 06:00 cutoff.
    fn after_cutoff() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 1, 0, 0).unwrap()
    }

    // 23:30 UTC on the 9th is 05:30 on the 10th at UTC+6.
    fn before_cutoff() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 9, 23, 30, 0).unwrap()
    }

    #[tokio::test]
    async fn stays_idle_before_the_cutoff_hour() {
        let store = Arc::new(MemoryStore::new());
        seed_record(&store, "1001", "adexora", 5).await;
        // Marker points at an older day, so a reset is pending but not yet
        // eligible.
        store
            .set(paths::LAST_RESET_DATE, Value::String("2025-03-08".into()))
            .await
            .unwrap();

        let mut scheduler = scheduler(store.clone());
        let ran = scheduler.check_and_reset(before_cutoff()).await.unwrap();
        assert!(!ran);
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        let record: WatchRecord =
            get_typed(store.as_ref(), &paths::watch_record("1001", "adexora"))
                .await
                .unwrap()
                .unwrap();
        assert_eq!(record.watched_today, 5);
    }

    #[tokio::test]
    async fn clears_all_records_and_writes_the_marker() {
        let store = Arc::new(MemoryStore::new());
        seed_record(&store, "1001", "adexora", 5).await;
        seed_record(&store, "1001", "gigapub", 2).await;
        seed_record(&store, "2001", "adextra", 1).await;

        let now = after_cutoff();
        let mut scheduler = scheduler(store.clone());
        let ran = scheduler.check_and_reset(now).await.unwrap();
        assert!(ran);
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        let marker = store.get(paths::LAST_RESET_DATE).await.unwrap().unwrap();
        assert_eq!(marker, Value::String("2025-03-10".into()));

        for (account, provider) in [("1001", "adexora"), ("1001", "gigapub"), ("2001", "adextra")] {
            let record: WatchRecord =
                get_typed(store.as_ref(), &paths::watch_record(account, provider))
                    .await
                    .unwrap()
                    .unwrap();
            assert_eq!(record.watched_today, 0);
            assert_eq!(record.last_reset, Some(now));
        }
    }

    #[tokio::test]
    async fn second_trigger_on_the_same_day_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        seed_record(&store, "1001", "adexora", 5).await;

        let mut first = scheduler(store.clone());
        assert!(first.check_and_reset(after_cutoff()).await.unwrap());

        // Simulate activity after the reset, then a racing second instance.
        let record = WatchRecord {
            watched_today: 3,
            last_watched: Some(after_cutoff()),
            last_reset: Some(after_cutoff()),
        };
        store
            .set(
                &paths::watch_record("1001", "adexora"),
                to_value(&record).unwrap(),
            )
            .await
            .unwrap();

        let mut second = scheduler(store.clone());
        let ran = second
            .check_and_reset(after_cutoff() + chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert!(!ran);

        let kept: WatchRecord =
            get_typed(store.as_ref(), &paths::watch_record("1001", "adexora"))
                .await
                .unwrap()
                .unwrap();
        assert_eq!(kept.watched_today, 3);
    }

    #[test]
    fn next_reset_rolls_to_tomorrow_after_cutoff() {
        let tz = bd();
        // 07:00 local: next reset is tomorrow 06:00 local.
        let next = next_reset_at(after_cutoff(), tz, 6);
        assert_eq!(
            next,
            Utc.with_ymd_and_hms(2025, 3, 11, 0, 0, 0).unwrap()
        );

        // 05:30 local: next reset is today 06:00 local (00:00 UTC).
        let next = next_reset_at(before_cutoff(), tz, 6);
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap());
    }
}
