#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    switchboard_breaker::CircuitState,
    switchboard_common::{InboundEvent, MessagePayload},
    switchboard_config::SwitchboardConfig,
    switchboard_locks::{LockOptions, LockRecord, LockStore, SessionMutex},
    switchboard_pipeline::{
        Admission, PROCESSOR_BREAKER, Processor, ReplySender, Services, WorkerOptions, WorkerPool,
    },
    switchboard_queue::{Job, JobId, JobState},
};

/// Stalls past the breaker timeout for the first `slow_calls` calls.
struct SlowThenFast {
    calls: AtomicUsize,
    slow_calls: usize,
}

#[async_trait]
impl Processor for SlowThenFast {
    async fn process(&self, _sender: &str, payload: &MessagePayload) -> anyhow::Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.slow_calls {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Ok(format!("re: {}", payload.as_text().unwrap_or_default()))
    }
}

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ReplySender for Outbox {
    async fn send(&self, destination: &str, text: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((destination.to_string(), text.to_string()));
        Ok(())
    }
}

fn fast_config() -> SwitchboardConfig {
    let mut config = SwitchboardConfig::default();
    config.queue.max_attempts = 3;
    config.queue.backoff_base_ms = 5;
    config.queue.backoff_jitter = 0.0;
    config.queue.poll_interval_ms = 5;
    config.breaker.timeout_ms = 50;
    config.breaker.volume_threshold = 100;
    config.locks.retry_count = 2;
    config.locks.retry_delay_ms = 5;
    config.locks.retry_jitter_ms = 0;
    config.workers.concurrency = 2;
    config
}

async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn job(services: &Services, external_id: &str) -> Job {
    services
        .queue
        .get(&JobId::from_external_id(external_id))
        .await
        .unwrap()
        .unwrap()
}

async fn run_until_finished(services: &Services, external_id: &str) {
    let watcher = services.clone();
    let external_id = external_id.to_string();
    wait_for(|| {
        let watcher = watcher.clone();
        let external_id = external_id.clone();
        async move { job(&watcher, &external_id).await.state.is_finished() }
    })
    .await;
}

#[tokio::test]
async fn slow_processor_is_retried_until_one_reply_is_sent() {
    let config = fast_config();
    let services = Services::in_memory(&config);
    let processor = Arc::new(SlowThenFast {
        calls: AtomicUsize::new(0),
        slow_calls: 2,
    });
    let outbox = Arc::new(Outbox::default());
    let handle = WorkerPool::new(
        services.clone(),
        processor.clone(),
        outbox.clone(),
        WorkerOptions::from(&config),
    )
    .start();

    let admission = services
        .ingress()
        .admit(&InboundEvent::text("msg-1", "5511987654321", "oi"))
        .await
        .unwrap();
    assert!(admission.is_admitted());

    run_until_finished(&services, "msg-1").await;
    handle.shutdown().await;

    let finished = job(&services, "msg-1").await;
    assert_eq!(finished.state, JobState::Completed);
    assert_eq!(finished.attempts_made, 2);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        *outbox.sent.lock().unwrap(),
        vec![("5511987654321".to_string(), "re: oi".to_string())]
    );

    let window = services
        .limiter
        .window("default", "5511987654321")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(window.hour_count, 1);
    assert_eq!(window.day_count, 1);
}

#[tokio::test]
async fn redelivery_within_the_window_creates_one_job() {
    let config = fast_config();
    let services = Services::in_memory(&config);
    let ingress = services.ingress();
    let event = InboundEvent::text("msg-2", "5511987654321", "oi");

    let first = ingress.admit(&event).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = ingress.admit(&event).await.unwrap();

    assert_eq!(first, Admission::Admitted(JobId::from_external_id("msg-2")));
    assert_eq!(second, Admission::Duplicate);
    assert_eq!(services.queue.counts().await.unwrap().in_flight(), 1);
}

#[tokio::test]
async fn exhausted_job_is_dead_lettered_once_and_never_replied() {
    let config = fast_config();
    let services = Services::in_memory(&config);
    let processor = Arc::new(SlowThenFast {
        calls: AtomicUsize::new(0),
        slow_calls: usize::MAX,
    });
    let outbox = Arc::new(Outbox::default());
    let handle = WorkerPool::new(
        services.clone(),
        processor.clone(),
        outbox.clone(),
        WorkerOptions::from(&config),
    )
    .start();

    services
        .ingress()
        .admit(&InboundEvent::text("msg-3", "5511987654321", "oi"))
        .await
        .unwrap();

    run_until_finished(&services, "msg-3").await;
    let breakers = handle.shutdown().await;

    let finished = job(&services, "msg-3").await;
    assert_eq!(finished.state, JobState::DeadLetter);
    assert_eq!(finished.attempts_made, 3);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
    assert!(outbox.sent.lock().unwrap().is_empty());
    assert_eq!(services.queue.dead_letters(10).await.unwrap().len(), 1);

    let processor_breaker = breakers
        .iter()
        .find(|b| b.name == PROCESSOR_BREAKER)
        .unwrap();
    assert_eq!(processor_breaker.counts.timeouts, 3);
    assert_eq!(processor_breaker.state, CircuitState::Closed);
}

#[tokio::test]
async fn messages_from_one_sender_never_overlap() {
    struct Tracking {
        active: AtomicUsize,
        overlaps: AtomicUsize,
    }

    #[async_trait]
    impl Processor for Tracking {
        async fn process(&self, _sender: &str, _payload: &MessagePayload) -> anyhow::Result<String> {
            if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok("ok".into())
        }
    }

    let mut config = fast_config();
    config.workers.concurrency = 4;
    config.breaker.timeout_ms = 1_000;
    let services = Services::in_memory(&config);
    let processor = Arc::new(Tracking {
        active: AtomicUsize::new(0),
        overlaps: AtomicUsize::new(0),
    });
    let outbox = Arc::new(Outbox::default());
    let handle = WorkerPool::new(
        services.clone(),
        processor.clone(),
        outbox.clone(),
        WorkerOptions::from(&config),
    )
    .start();

    let ingress = services.ingress();
    for n in 0..4 {
        ingress
            .admit(&InboundEvent::text(format!("burst-{n}"), "5511987654321", "oi"))
            .await
            .unwrap();
    }

    let watcher = services.clone();
    wait_for(|| {
        let watcher = watcher.clone();
        async move { watcher.queue.counts().await.unwrap().completed == 4 }
    })
    .await;
    handle.shutdown().await;

    assert_eq!(processor.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(outbox.sent.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn shared_sqlite_store_runs_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.store.database_url = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("switchboard.db").display()
    );
    let services = Services::open_sqlite(&config).await.unwrap();
    let processor = Arc::new(SlowThenFast {
        calls: AtomicUsize::new(0),
        slow_calls: 0,
    });
    let outbox = Arc::new(Outbox::default());
    let handle = WorkerPool::new(
        services.clone(),
        processor,
        outbox.clone(),
        WorkerOptions::from(&config),
    )
    .start();

    services
        .ingress()
        .admit(&InboundEvent::text("msg-4", "5511987654321", "oi"))
        .await
        .unwrap();
    run_until_finished(&services, "msg-4").await;
    handle.shutdown().await;

    assert_eq!(job(&services, "msg-4").await.state, JobState::Completed);
    assert_eq!(outbox.sent.lock().unwrap().len(), 1);
    services.close().await;
}

#[tokio::test]
async fn undecodable_payload_goes_straight_to_dead_letter() {
    let config = fast_config();
    let services = Services::in_memory(&config);
    services
        .queue
        .enqueue(JobId::from("job:garbage".to_string()), &serde_json::json!({"nope": 1}))
        .await
        .unwrap();

    let handle = WorkerPool::new(
        services.clone(),
        Arc::new(SlowThenFast {
            calls: AtomicUsize::new(0),
            slow_calls: 0,
        }),
        Arc::new(Outbox::default()),
        WorkerOptions::from(&config),
    )
    .start();

    let watcher = services.clone();
    wait_for(|| {
        let watcher = watcher.clone();
        async move { watcher.queue.counts().await.unwrap().dead_letter == 1 }
    })
    .await;
    handle.shutdown().await;

    let dead = services.queue.dead_letters(10).await.unwrap();
    assert_eq!(dead[0].attempts_made, 1);
    assert!(
        dead[0]
            .last_error
            .as_deref()
            .unwrap_or_default()
            .contains("undecodable")
    );
}

#[tokio::test]
async fn panicking_processor_costs_one_attempt_and_keeps_the_worker() {
    struct PanicsOnce {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Processor for PanicsOnce {
        async fn process(&self, _sender: &str, payload: &MessagePayload) -> anyhow::Result<String> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("processor bug");
            }
            Ok(format!("re: {}", payload.as_text().unwrap_or_default()))
        }
    }

    let mut config = fast_config();
    config.workers.concurrency = 1;
    let services = Services::in_memory(&config);
    let processor = Arc::new(PanicsOnce {
        calls: AtomicUsize::new(0),
    });
    let outbox = Arc::new(Outbox::default());
    let handle = WorkerPool::new(
        services.clone(),
        processor.clone(),
        outbox.clone(),
        WorkerOptions::from(&config),
    )
    .start();

    let ingress = services.ingress();
    ingress
        .admit(&InboundEvent::text("msg-a", "5511987654321", "a"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    ingress
        .admit(&InboundEvent::text("msg-b", "5511987654321", "b"))
        .await
        .unwrap();

    run_until_finished(&services, "msg-a").await;
    run_until_finished(&services, "msg-b").await;
    handle.shutdown().await;

    let first = job(&services, "msg-a").await;
    assert_eq!(first.state, JobState::Completed);
    assert_eq!(first.attempts_made, 1);
    assert_eq!(job(&services, "msg-b").await.state, JobState::Completed);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 3);

    let mut sent: Vec<_> = outbox
        .sent
        .lock()
        .unwrap()
        .iter()
        .map(|(_, text)| text.clone())
        .collect();
    sent.sort();
    assert_eq!(sent, vec!["re: a", "re: b"]);
}

#[tokio::test]
async fn job_abandoned_by_a_crashed_worker_runs_again_once() {
    let mut config = fast_config();
    config.queue.stall_timeout_secs = 1;
    config.queue.maintenance_interval_secs = 1;
    let services = Services::in_memory(&config);
    services
        .ingress()
        .admit(&InboundEvent::text("msg-5", "5511987654321", "oi"))
        .await
        .unwrap();

    // A worker claims the job and dies without settling it.
    let abandoned = services.queue.try_dequeue().await.unwrap().unwrap();

    let processor = Arc::new(SlowThenFast {
        calls: AtomicUsize::new(0),
        slow_calls: 0,
    });
    let outbox = Arc::new(Outbox::default());
    let handle = WorkerPool::new(
        services.clone(),
        processor.clone(),
        outbox.clone(),
        WorkerOptions::from(&config),
    )
    .start();

    run_until_finished(&services, "msg-5").await;
    handle.shutdown().await;

    let finished = job(&services, "msg-5").await;
    assert_eq!(finished.state, JobState::Completed);
    assert_eq!(finished.stalled_count, 1);
    assert_eq!(finished.attempts_made, 0);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 1);

    // The dead worker's lease no longer settles anything.
    assert!(!services.queue.ack(&abandoned).await.unwrap());
    assert_eq!(outbox.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn lock_store_outage_ends_in_dead_letter_not_an_endless_loop() {
    struct Unreachable;

    #[async_trait]
    impl LockStore for Unreachable {
        async fn try_acquire(&self, _: &str, _: &str, _: u64, _: u64) -> switchboard_locks::Result<bool> {
            Err(switchboard_locks::Error::unavailable("connection refused"))
        }

        async fn release(&self, _: &str, _: &str) -> switchboard_locks::Result<bool> {
            Err(switchboard_locks::Error::unavailable("connection refused"))
        }

        async fn extend(&self, _: &str, _: &str, _: u64, _: u64) -> switchboard_locks::Result<bool> {
            Err(switchboard_locks::Error::unavailable("connection refused"))
        }

        async fn holder(&self, _: &str, _: u64) -> switchboard_locks::Result<Option<LockRecord>> {
            Err(switchboard_locks::Error::unavailable("connection refused"))
        }

        async fn purge_expired(&self, _: u64) -> switchboard_locks::Result<u64> {
            Err(switchboard_locks::Error::unavailable("connection refused"))
        }
    }

    let config = fast_config();
    let mut services = Services::in_memory(&config);
    services.mutex = SessionMutex::new(Arc::new(Unreachable), LockOptions::from(&config.locks));
    let processor = Arc::new(SlowThenFast {
        calls: AtomicUsize::new(0),
        slow_calls: 0,
    });
    let outbox = Arc::new(Outbox::default());
    let mut options = WorkerOptions::from(&config);
    options.max_defer = Duration::from_millis(50);
    let handle = WorkerPool::new(services.clone(), processor.clone(), outbox.clone(), options).start();

    services
        .ingress()
        .admit(&InboundEvent::text("msg-6", "5511987654321", "oi"))
        .await
        .unwrap();
    run_until_finished(&services, "msg-6").await;
    handle.shutdown().await;

    let finished = job(&services, "msg-6").await;
    assert_eq!(finished.state, JobState::DeadLetter);
    assert_eq!(finished.attempts_made, 3);
    assert!(finished.last_error.unwrap_or_default().contains("unavailable"));
    assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
    assert!(outbox.sent.lock().unwrap().is_empty());
}
