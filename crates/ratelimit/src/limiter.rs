use std::{fmt, sync::Arc, time::Duration};

use {
    switchboard_common::{duration_ms, normalize_sender, now_ms},
    switchboard_config::RateLimitConfig,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use switchboard_metrics::{counter, labels, rate_limit as rate_metrics};

use crate::{RateWindow, Result, store::RateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub hourly_max: u32,
    pub daily_max: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self::from(&RateLimitConfig::default())
    }
}

impl From<&RateLimitConfig> for RateLimits {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            hourly_max: config.hourly_max,
            daily_max: config.daily_max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// An explicit block is in force until this time.
    Blocked { until_ms: u64 },
    HourlyLimit { count: u32, max: u32 },
    DailyLimit { count: u32, max: u32 },
    /// The counters could not be read, so the send is refused.
    StoreUnavailable,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocked { .. } => "blocked",
            Self::HourlyLimit { .. } => "hourly_limit",
            Self::DailyLimit { .. } => "daily_limit",
            Self::StoreUnavailable => "store_unavailable",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked { until_ms } => write!(f, "blocked until {until_ms}"),
            Self::HourlyLimit { count, max } => write!(f, "hourly limit reached ({count}/{max})"),
            Self::DailyLimit { count, max } => write!(f, "daily limit reached ({count}/{max})"),
            Self::StoreUnavailable => f.write_str("rate limit store unavailable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Blocked(BlockReason),
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Hourly and daily send limits per (account, destination).
///
/// Destinations are normalised the same way as senders, so a reply to
/// `5511987654321@s.whatsapp.net` and one to `+55 11 98765-4321` share
/// counters.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateStore>,
    limits: RateLimits,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateStore>, limits: RateLimits) -> Self {
        Self { store, limits }
    }

    pub fn limits(&self) -> RateLimits {
        self.limits
    }

    /// May a send to `destination_id` happen now?
    pub async fn check(&self, account_id: &str, destination_id: &str) -> RateDecision {
        self.check_at(account_id, destination_id, now_ms()).await
    }

    pub async fn check_at(
        &self,
        account_id: &str,
        destination_id: &str,
        now_ms: u64,
    ) -> RateDecision {
        let destination = normalize_sender(destination_id);
        let decision = match self.store.window(account_id, &destination).await {
            Ok(Some(window)) => self.decide(&window, now_ms),
            Ok(None) => RateDecision::Allowed,
            Err(e) => {
                warn!(
                    account_id,
                    destination = %destination,
                    error = %e,
                    "rate limit store unavailable, refusing send"
                );
                #[cfg(feature = "metrics")]
                counter!(rate_metrics::STORE_ERRORS_TOTAL).increment(1);
                RateDecision::Blocked(BlockReason::StoreUnavailable)
            },
        };

        match &decision {
            RateDecision::Allowed => {
                #[cfg(feature = "metrics")]
                counter!(rate_metrics::ALLOWED_TOTAL).increment(1);
            },
            RateDecision::Blocked(reason) => {
                debug!(account_id, destination = %destination, %reason, "send blocked");
                #[cfg(feature = "metrics")]
                counter!(rate_metrics::BLOCKED_TOTAL, labels::REASON => reason.as_str())
                    .increment(1);
            },
        }
        decision
    }

    fn decide(&self, window: &RateWindow, now_ms: u64) -> RateDecision {
        if let Some(until_ms) = window.active_block(now_ms) {
            return RateDecision::Blocked(BlockReason::Blocked { until_ms });
        }
        let hourly = window.hourly_count_at(now_ms);
        if hourly >= self.limits.hourly_max {
            return RateDecision::Blocked(BlockReason::HourlyLimit {
                count: hourly,
                max: self.limits.hourly_max,
            });
        }
        let daily = window.daily_count_at(now_ms);
        if daily >= self.limits.daily_max {
            return RateDecision::Blocked(BlockReason::DailyLimit {
                count: daily,
                max: self.limits.daily_max,
            });
        }
        RateDecision::Allowed
    }

    /// Count a send that actually happened. Failures are logged only; the
    /// send already went out.
    pub async fn increment(&self, account_id: &str, destination_id: &str) -> Option<RateWindow> {
        self.increment_at(account_id, destination_id, now_ms()).await
    }

    pub async fn increment_at(
        &self,
        account_id: &str,
        destination_id: &str,
        now_ms: u64,
    ) -> Option<RateWindow> {
        let destination = normalize_sender(destination_id);
        match self.store.increment(account_id, &destination, now_ms).await {
            Ok(window) => Some(window),
            Err(e) => {
                warn!(
                    account_id,
                    destination = %destination,
                    error = %e,
                    "failed to count send"
                );
                #[cfg(feature = "metrics")]
                counter!(rate_metrics::STORE_ERRORS_TOTAL).increment(1);
                None
            },
        }
    }

    /// Clear counters and any block for the pair.
    pub async fn reset(&self, account_id: &str, destination_id: &str) -> Result<bool> {
        let destination = normalize_sender(destination_id);
        let removed = self.store.reset(account_id, &destination).await?;
        info!(account_id, destination = %destination, "rate window reset");
        Ok(removed)
    }

    /// Refuse all sends to the pair for `duration`, regardless of counts.
    pub async fn block(
        &self,
        account_id: &str,
        destination_id: &str,
        duration: Duration,
    ) -> Result<u64> {
        let destination = normalize_sender(destination_id);
        let until_ms = now_ms().saturating_add(duration_ms(duration));
        self.store
            .block_until(account_id, &destination, until_ms)
            .await?;
        warn!(account_id, destination = %destination, until_ms, "destination blocked");
        Ok(until_ms)
    }

    pub async fn window(&self, account_id: &str, destination_id: &str) -> Result<Option<RateWindow>> {
        self.store
            .window(account_id, &normalize_sender(destination_id))
            .await
    }
}
