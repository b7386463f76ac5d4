use std::{fmt, str::FromStr, time::Duration};

use {
    serde::{Deserialize, Serialize, de::DeserializeOwned},
    switchboard_dedup::IdempotencyKey,
};

use crate::{Error, Result};

/// Stable job key. Redeliveries of one external event map to the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn from_external_id(external_id: &str) -> Self {
        Self(format!(
            "job:{}",
            IdempotencyKey::from_external_id(external_id)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Active,
    Completed,
    DeadLetter,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::DeadLetter => "dead_letter",
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::DeadLetter)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(Error::message(format!("unknown job state: {other}"))),
        }
    }
}

/// A unit of work as stored by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: serde_json::Value,
    pub state: JobState,
    /// Failed runs so far. Incremented when a run is nacked or dead-lettered.
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Times the job was recovered after its worker stopped responding.
    pub stalled_count: u32,
    pub enqueued_at_ms: u64,
    /// Earliest time the job may be claimed.
    pub run_at_ms: u64,
    pub claimed_at_ms: Option<u64>,
    pub finished_at_ms: Option<u64>,
    /// Opaque token unique to the current claim.
    pub lease: Option<String>,
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(id: JobId, payload: serde_json::Value, max_attempts: u32, now_ms: u64) -> Self {
        Self {
            id,
            payload,
            state: JobState::Pending,
            attempts_made: 0,
            max_attempts,
            stalled_count: 0,
            enqueued_at_ms: now_ms,
            run_at_ms: now_ms,
            claimed_at_ms: None,
            finished_at_ms: None,
            lease: None,
            last_error: None,
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// The attempt currently running, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempts_made + 1
    }

    pub fn lease(&self) -> &str {
        self.lease.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A job with this id already exists; nothing was written.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Back to pending; `attempt` failed runs so far.
    Retrying { attempt: u32, delay: Duration },
    DeadLettered,
    /// The lease no longer matches; another worker owns the job now.
    Stale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub active: u64,
    pub completed: u64,
    pub dead_letter: u64,
}

impl QueueCounts {
    pub fn in_flight(&self) -> u64 {
        self.pending + self.active
    }

    pub(crate) fn add(&mut self, state: JobState, n: u64) {
        match state {
            JobState::Pending => self.pending += n,
            JobState::Active => self.active += n,
            JobState::Completed => self.completed += n,
            JobState::DeadLetter => self.dead_letter += n,
        }
    }
}

/// Result of one stall-recovery sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StallSweep {
    pub requeued: u64,
    pub dead_lettered: u64,
}
