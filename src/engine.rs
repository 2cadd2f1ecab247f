use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::AdsError;
use crate::gate::{cooldown_remaining, RateLimitGate, SessionState};
use crate::ledger::RewardLedger;
use crate::models::{paths, ProviderConfig, ProviderOverrides, WatchRecord};
use crate::provider::{ProviderRegistry, WatchOutcome};
use crate::referral::ReferralCommissionPropagator;
use crate::scheduler::next_reset_at;
use crate::store::{get_typed, ChangeEvent, KvStore};

/// Read-mostly provider configuration: compiled defaults merged with
/// `providerConfig/{id}` override documents, refreshed through the store's
/// change feed.
pub struct ProviderCatalog {
    store: Arc<dyn KvStore>,
    defaults: HashMap<String, ProviderConfig>,
    order: Vec<String>,
    cached: RwLock<HashMap<String, ProviderConfig>>,
}

impl ProviderCatalog {
    pub fn new(store: Arc<dyn KvStore>, defaults: Vec<ProviderConfig>) -> Arc<Self> {
        let order: Vec<String> = defaults.iter().map(|cfg| cfg.provider.clone()).collect();
        let by_id: HashMap<String, ProviderConfig> = defaults
            .into_iter()
            .map(|cfg| (cfg.provider.clone(), cfg))
            .collect();
        Arc::new(Self {
            store,
            cached: RwLock::new(by_id.clone()),
            defaults: by_id,
            order,
        })
    }

    pub async fn get(&self, provider_id: &str) -> Option<ProviderConfig> {
        self.cached.read().await.get(provider_id).cloned()
    }

    pub async fn all(&self) -> Vec<ProviderConfig> {
        let cached = self.cached.read().await;
        self.order
            .iter()
            .filter_map(|id| cached.get(id).cloned())
            .collect()
    }

    /// Pull every override document currently in the store.
    pub async fn load_overrides(&self) -> Result<(), AdsError> {
        for (path, value) in self.store.list(paths::PROVIDER_CONFIG).await? {
            self.apply_override(&path, value).await;
        }
        Ok(())
    }

    async fn apply_override(&self, path: &str, value: Value) {
        let Some(provider_id) = path.rsplit('/').next() else {
            return;
        };
        let Some(base) = self.defaults.get(provider_id) else {
            warn!("Ignoring override for unknown ad provider: {}", provider_id);
            return;
        };
        match serde_json::from_value::<ProviderOverrides>(value) {
            Ok(overrides) => {
                let merged = base.merged(&overrides);
                info!("Applied config override for ad provider: {}", provider_id);
                self.cached
                    .write()
                    .await
                    .insert(provider_id.to_string(), merged);
            }
            Err(err) => {
                warn!("Malformed override for {}: {}", provider_id, err);
            }
        }
    }

    /// Follow the store's change feed and fold overrides into the cache as
    /// they arrive. The subscription is taken before this spawns so no
    /// change can slip between the initial load and the feed.
    pub fn watch_changes(self: Arc<Self>, mut feed: broadcast::Receiver<ChangeEvent>) {
        tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(event) => {
                        if let Some(value) = event.value {
                            self.apply_override(&event.path, value).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Missed some events; re-pull the full override set.
                        if let Err(err) = self.load_overrides().await {
                            warn!("Override reload failed: {}", err);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

/// Everything the UI layer needs to render one provider row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub provider: String,
    pub enabled: bool,
    pub ready: bool,
    pub watched_today: u32,
    pub daily_limit: u32,
    pub reward: f64,
    pub cooldown_remaining_seconds: u64,
    pub in_flight: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdsStatus {
    pub providers: Vec<ProviderStatus>,
    pub next_reset_at: DateTime<Utc>,
}

/// What a completed watch attempt earned.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchReceipt {
    pub provider: String,
    pub reward: f64,
    pub balance: f64,
    pub watched_today: u32,
    pub daily_limit: u32,
    pub transaction_id: String,
}

/// The orchestration core: admission, single-flight locking, provider
/// invocation, crediting and commission propagation, in that order.
pub struct AdsEngine {
    store: Arc<dyn KvStore>,
    registry: ProviderRegistry,
    catalog: Arc<ProviderCatalog>,
    gate: RateLimitGate,
    ledger: RewardLedger,
    referrals: ReferralCommissionPropagator,
    session: Arc<SessionState>,
    tz: FixedOffset,
    cutoff_hour: u32,
}

impl AdsEngine {
    pub fn new(
        store: Arc<dyn KvStore>,
        registry: ProviderRegistry,
        config: &Config,
    ) -> Result<Self, AdsError> {
        let tz = config.reset.timezone()?;
        Ok(Self {
            catalog: ProviderCatalog::new(store.clone(), config.providers.clone()),
            gate: RateLimitGate::new(tz),
            ledger: RewardLedger::new(store.clone(), tz),
            referrals: ReferralCommissionPropagator::new(
                store.clone(),
                config.referral.commission_rate,
            ),
            session: SessionState::new(),
            registry,
            store,
            tz,
            cutoff_hour: config.reset.cutoff_hour,
        })
    }

    /// Subscribe to config changes, load the current overrides, and start
    /// folding the feed into the catalog.
    pub async fn start(&self) -> Result<(), AdsError> {
        let feed = self.store.subscribe(paths::PROVIDER_CONFIG).await?;
        self.catalog.load_overrides().await?;
        Arc::clone(&self.catalog).watch_changes(feed);
        Ok(())
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.session
    }

    /// One full watch attempt for `account_id` against `provider_id`.
    pub async fn watch_ad(
        &self,
        account_id: &str,
        provider_id: &str,
    ) -> Result<WatchReceipt, AdsError> {
        let provider_cfg = self
            .catalog
            .get(provider_id)
            .await
            .ok_or_else(|| AdsError::NotFound(format!("ad provider {}", provider_id)))?;
        let adapter = self.registry.get(provider_id);
        let ready = adapter.as_ref().is_some_and(|a| a.is_ready());

        let now = Utc::now();
        let record: Option<WatchRecord> = get_typed(
            self.store.as_ref(),
            &paths::watch_record(account_id, provider_id),
        )
        .await?;

        self.gate.evaluate(
            &provider_cfg,
            record.as_ref(),
            ready,
            self.session.in_flight().as_deref(),
            now,
        )?;

        // Claim the single-flight lock; the guard releases it on every exit
        // path below, including the timeout and persistence-failure ones.
        let _guard = self.session.begin(provider_id)?;
        let adapter = adapter.ok_or(AdsError::ProviderNotReady)?;

        info!("Starting ad watch for {} via {}", account_id, provider_id);
        let minimum = Duration::from_secs(provider_cfg.minimum_watch_seconds);
        match adapter.attempt(minimum).await {
            WatchOutcome::Completed => {
                let now = Utc::now();
                let receipt = match self
                    .ledger
                    .credit(account_id, provider_id, provider_cfg.reward, now)
                    .await
                {
                    Ok(receipt) => receipt,
                    Err(err) => {
                        // No rollback of whatever the interrupted credit
                        // already wrote; the user sees a failure and retries.
                        error!("Failed to credit {} for {}: {}", account_id, provider_id, err);
                        return Err(err);
                    }
                };

                // Dependent side effect; never blocks or reverses the credit.
                match self.referrals.propagate(account_id, receipt.amount, now).await {
                    Ok(_) => {}
                    Err(err) => {
                        warn!("Referral commission skipped for {}: {}", account_id, err)
                    }
                }

                Ok(WatchReceipt {
                    provider: provider_id.to_string(),
                    reward: receipt.amount,
                    balance: receipt.balance,
                    watched_today: receipt.watched_today,
                    daily_limit: provider_cfg.daily_limit,
                    transaction_id: receipt.transaction_id,
                })
            }
            WatchOutcome::Incomplete { watched, minimum } => {
                warn!(
                    "Incomplete watch for {} via {}: {:?} of {:?}",
                    account_id, provider_id, watched, minimum
                );
                Err(AdsError::IncompleteWatch {
                    minimum_seconds: provider_cfg.minimum_watch_seconds,
                })
            }
            WatchOutcome::TimedOut => {
                warn!("Ad watch timed out for {} via {}", account_id, provider_id);
                Err(AdsError::ProviderTimedOut)
            }
            WatchOutcome::NotReady => Err(AdsError::ProviderNotReady),
        }
    }

    /// Per-provider snapshot for the UI: progress, cooldown, readiness.
    pub async fn ad_status(&self, account_id: &str) -> Result<AdsStatus, AdsError> {
        let now = Utc::now();
        let in_flight = self.session.in_flight();
        let mut providers = Vec::new();

        for cfg in self.catalog.all().await {
            let record: Option<WatchRecord> = get_typed(
                self.store.as_ref(),
                &paths::watch_record(account_id, &cfg.provider),
            )
            .await?;

            let watched_today = record
                .as_ref()
                .map(|r| r.watched_today_as_of(now, self.tz))
                .unwrap_or(0);
            let remaining = cooldown_remaining(
                cfg.cooldown_seconds,
                record.as_ref().and_then(|r| r.last_watched),
                now,
            );

            providers.push(ProviderStatus {
                ready: self.registry.is_ready(&cfg.provider),
                in_flight: in_flight.as_deref() == Some(cfg.provider.as_str()),
                watched_today,
                daily_limit: cfg.daily_limit,
                reward: cfg.reward,
                cooldown_remaining_seconds: remaining,
                enabled: cfg.enabled,
                provider: cfg.provider,
            });
        }

        Ok(AdsStatus {
            providers,
            next_reset_at: next_reset_at(now, self.tz, self.cutoff_hour),
        })
    }
}
