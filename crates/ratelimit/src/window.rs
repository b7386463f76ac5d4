use serde::Serialize;

pub const HOUR_MS: u64 = 3_600_000;
pub const DAY_MS: u64 = 86_400_000;

/// Start of the clock hour containing `now_ms`.
pub fn hour_start(now_ms: u64) -> u64 {
    now_ms - now_ms % HOUR_MS
}

/// Start of the UTC day containing `now_ms`.
pub fn day_start(now_ms: u64) -> u64 {
    now_ms - now_ms % DAY_MS
}

/// Stored counters for one (account, destination) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RateWindow {
    pub account_id: String,
    pub destination_id: String,
    pub hour_start_ms: u64,
    pub hour_count: u32,
    pub day_start_ms: u64,
    pub day_count: u32,
    pub blocked_until_ms: Option<u64>,
}

impl RateWindow {
    pub fn new(account_id: &str, destination_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            destination_id: destination_id.to_string(),
            ..Self::default()
        }
    }

    /// Sends counted in the hour bucket containing `now_ms`.
    pub fn hourly_count_at(&self, now_ms: u64) -> u32 {
        if self.hour_start_ms >= hour_start(now_ms) {
            self.hour_count
        } else {
            0
        }
    }

    /// Sends counted in the day bucket containing `now_ms`.
    pub fn daily_count_at(&self, now_ms: u64) -> u32 {
        if self.day_start_ms >= day_start(now_ms) {
            self.day_count
        } else {
            0
        }
    }

    /// The block deadline, if one is still in force at `now_ms`.
    pub fn active_block(&self, now_ms: u64) -> Option<u64> {
        self.blocked_until_ms.filter(|until| *until > now_ms)
    }

    /// Count one send at `now_ms`. Buckets only ever move forward.
    pub(crate) fn bump(&mut self, now_ms: u64) {
        let hour = hour_start(now_ms);
        if hour > self.hour_start_ms {
            self.hour_start_ms = hour;
            self.hour_count = 1;
        } else {
            self.hour_count = self.hour_count.saturating_add(1);
        }
        let day = day_start(now_ms);
        if day > self.day_start_ms {
            self.day_start_ms = day;
            self.day_count = 1;
        } else {
            self.day_count = self.day_count.saturating_add(1);
        }
    }
}
