use chrono::{DateTime, FixedOffset, Utc};
use std::sync::{Arc, Mutex};

use crate::error::AdsError;
use crate::models::{ProviderConfig, WatchRecord};

/// Seconds left on a provider cooldown, rounded up to whole seconds. Zero
/// once the cooldown has elapsed.
pub fn cooldown_remaining(
    cooldown_seconds: u64,
    last_watched: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> u64 {
    let Some(last) = last_watched else {
        return 0;
    };
    let elapsed = (now - last).num_milliseconds() as f64 / 1000.0;
    let remaining = cooldown_seconds as f64 - elapsed;
    if remaining > 0.0 {
        remaining.ceil() as u64
    } else {
        0
    }
}

/// Pure admission decision over a watch attempt. No side effects; safe to
/// call repeatedly. Checks run in a fixed order and the first failing one
/// wins.
pub struct RateLimitGate {
    tz: FixedOffset,
}

impl RateLimitGate {
    pub fn new(tz: FixedOffset) -> Self {
        Self { tz }
    }

    pub fn evaluate(
        &self,
        provider: &ProviderConfig,
        record: Option<&WatchRecord>,
        adapter_ready: bool,
        in_flight: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), AdsError> {
        if !provider.enabled {
            return Err(AdsError::ProviderDisabled);
        }

        // daily_limit of 0 is the unlimited sentinel.
        let watched = record
            .map(|r| r.watched_today_as_of(now, self.tz))
            .unwrap_or(0);
        if provider.daily_limit > 0 && watched >= provider.daily_limit {
            return Err(AdsError::DailyLimitReached);
        }

        if !adapter_ready {
            return Err(AdsError::ProviderNotReady);
        }

        let remaining = cooldown_remaining(
            provider.cooldown_seconds,
            record.and_then(|r| r.last_watched),
            now,
        );
        if remaining > 0 {
            return Err(AdsError::CooldownActive {
                remaining_seconds: remaining,
            });
        }

        // hourly_limit is carried in the provider config but has never had an
        // admission rule; see DESIGN.md before adding one.

        if let Some(current) = in_flight {
            return Err(AdsError::AnotherWatchInProgress {
                provider: current.to_string(),
            });
        }

        Ok(())
    }
}

/// Session-owned watch state: at most one ad may be in flight per session,
/// across all providers. The in-flight provider's identity is kept so the
/// caller can tell "this ad is loading" from "a different ad is loading".
#[derive(Debug)]
pub struct SessionState {
    in_flight: Mutex<Option<String>>,
}

impl SessionState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            in_flight: Mutex::new(None),
        })
    }

    pub fn in_flight(&self) -> Option<String> {
        self.in_flight.lock().ok().and_then(|slot| slot.clone())
    }

    /// Claim the single-flight lock for `provider_id`. The returned guard
    /// releases it on drop, on every exit path.
    pub fn begin(self: &Arc<Self>, provider_id: &str) -> Result<FlightGuard, AdsError> {
        let mut slot = self
            .in_flight
            .lock()
            .map_err(|_| AdsError::Config("session state poisoned".to_string()))?;
        if let Some(current) = slot.as_ref() {
            return Err(AdsError::AnotherWatchInProgress {
                provider: current.clone(),
            });
        }
        *slot = Some(provider_id.to_string());
        Ok(FlightGuard {
            session: Arc::clone(self),
        })
    }
}

#[derive(Debug)]
pub struct FlightGuard {
    session: Arc<SessionState>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.session.in_flight.lock() {
            *slot = None;
        }
    }
}
