//! Admission of inbound events: idempotency gate, then enqueue.

use {
    switchboard_common::InboundEvent,
    switchboard_dedup::{IdempotencyGate, IdempotencyKey},
    switchboard_queue::{EnqueueOutcome, JobId, WorkQueue},
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use switchboard_metrics::{counter, labels, pipeline as pipeline_metrics};

use crate::Result;

/// What happened to an inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// First sighting; the event is queued under this job id.
    Admitted(JobId),
    /// Seen within the idempotency window, or already queued.
    Duplicate,
    /// Not queued. The idempotency marker is withdrawn so a redelivery can
    /// try again.
    Rejected(String),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Admitted(_) => "admitted",
            Self::Duplicate => "duplicate",
            Self::Rejected(_) => "rejected",
        }
    }
}

/// Entry point for the messaging-channel client.
#[derive(Clone)]
pub struct Ingress {
    gate: IdempotencyGate,
    queue: WorkQueue,
}

impl Ingress {
    pub fn new(gate: IdempotencyGate, queue: WorkQueue) -> Self {
        Self { gate, queue }
    }

    /// Admit an event at most once per idempotency window and queue it.
    ///
    /// Returns quickly; processing happens on the worker pool. Errors are
    /// only returned for queue store failures, after the marker has been
    /// withdrawn.
    pub async fn admit(&self, event: &InboundEvent) -> Result<Admission> {
        let admission = self.admit_inner(event).await;

        #[cfg(feature = "metrics")]
        if let Ok(admission) = &admission {
            counter!(
                pipeline_metrics::EVENTS_RECEIVED_TOTAL,
                labels::OUTCOME => admission.label()
            )
            .increment(1);
        }
        if let Ok(admission) = &admission {
            debug!(
                external_id = %event.external_id,
                outcome = admission.label(),
                "inbound event handled"
            );
        }

        admission
    }

    async fn admit_inner(&self, event: &InboundEvent) -> Result<Admission> {
        if event.external_id.trim().is_empty() {
            warn!(sender = %event.sender(), "dropping event without an external id");
            return Ok(Admission::Rejected("missing external id".into()));
        }

        let key = IdempotencyKey::from_external_id(&event.external_id);
        if !self.gate.admit_default(&key).await {
            info!(external_id = %event.external_id, "duplicate event ignored");
            return Ok(Admission::Duplicate);
        }

        let job_id = JobId::from_external_id(&event.external_id);
        match self.queue.enqueue(job_id.clone(), event).await {
            Ok(EnqueueOutcome::Enqueued) => Ok(Admission::Admitted(job_id)),
            Ok(EnqueueOutcome::Duplicate) => Ok(Admission::Duplicate),
            Err(switchboard_queue::Error::Full { capacity }) => {
                warn!(
                    external_id = %event.external_id,
                    capacity,
                    "queue full, event rejected"
                );
                self.gate.forget(&key).await;
                Ok(Admission::Rejected(format!("queue full ({capacity} jobs)")))
            },
            Err(e) => {
                self.gate.forget(&key).await;
                Err(e.into())
            },
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        std::{sync::Arc, time::Duration},
        switchboard_config::SwitchboardConfig,
        switchboard_queue::QueueOptions,
    };

    fn ingress(capacity: u64) -> Ingress {
        let mut config = SwitchboardConfig::default();
        config.queue.capacity = capacity;
        Ingress::new(
            IdempotencyGate::new(
                Arc::new(switchboard_dedup::InMemoryStore::new()),
                Duration::from_secs(300),
            ),
            WorkQueue::new(
                Arc::new(switchboard_queue::InMemoryStore::new()),
                QueueOptions::from(&config.queue),
            ),
        )
    }

    #[tokio::test]
    async fn redelivery_is_a_duplicate() {
        let ingress = ingress(10);
        let event = InboundEvent::text("msg-1", "5511987654321", "oi");

        let first = ingress.admit(&event).await.unwrap();
        assert_eq!(
            first,
            Admission::Admitted(JobId::from_external_id("msg-1"))
        );
        assert!(ingress.admit(&event).await.unwrap().is_duplicate());
        assert_eq!(ingress.queue.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn full_queue_withdraws_the_marker() {
        let ingress = ingress(1);
        ingress
            .admit(&InboundEvent::text("msg-1", "551100000001", "a"))
            .await
            .unwrap();

        let second = InboundEvent::text("msg-2", "551100000002", "b");
        let rejected = ingress.admit(&second).await.unwrap();
        assert!(matches!(rejected, Admission::Rejected(_)));

        // Capacity frees up; the redelivered event is accepted this time.
        let job = ingress.queue.try_dequeue().await.unwrap().unwrap();
        ingress.queue.ack(&job).await.unwrap();
        assert!(ingress.admit(&second).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn blank_external_id_is_rejected() {
        let ingress = ingress(10);
        let outcome = ingress
            .admit(&InboundEvent::text("  ", "551100000001", "a"))
            .await
            .unwrap();
        assert!(matches!(outcome, Admission::Rejected(_)));
        assert_eq!(ingress.queue.counts().await.unwrap().pending, 0);
    }
}
