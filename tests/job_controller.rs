use anyhow::{anyhow, Result};
use cartera_report::{
    backend::{JobBackend, JobRequest, JobStatus, Record, StartResponse, StatusResponse},
    config::Polling,
    controller::AsyncJobController,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Barrier, Notify};

#[derive(Debug, Clone)]
enum Reply {
    Status(JobStatus, Option<u32>),
    Failed(&'static str),
    Transport,
}

#[derive(Default)]
struct Fake {
    replies: Mutex<VecDeque<Reply>>,
    last: Mutex<Option<Reply>>,
    records: Vec<Record>,
    start_error: Option<&'static str>,
    fetch_error: bool,
    barrier: Option<Barrier>,
    gate: Option<Notify>,
    starts: AtomicUsize,
    polled: Mutex<Vec<String>>,
    fetches: AtomicUsize,
}

#[derive(Clone)]
struct FakeBackend(Arc<Fake>);

impl FakeBackend {
    fn new(fake: Fake) -> Self {
        Self(Arc::new(fake))
    }

    fn scripted(replies: Vec<Reply>) -> Fake {
        Fake {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        }
    }

    fn polled(&self) -> Vec<String> {
        self.0.polled.lock().unwrap().clone()
    }

    fn fetches(&self) -> usize {
        self.0.fetches.load(Ordering::SeqCst)
    }

    fn release(&self) {
        if let Some(gate) = &self.0.gate {
            gate.notify_one();
        }
    }

    fn next_reply(&self) -> Reply {
        let next = self.0.replies.lock().unwrap().pop_front();
        let mut last = self.0.last.lock().unwrap();
        match next {
            Some(r) => {
                *last = Some(r.clone());
                r
            }
            None => last.clone().unwrap_or(Reply::Status(JobStatus::Pending, None)),
        }
    }
}

impl JobBackend for FakeBackend {
    async fn start(&self, _req: &JobRequest) -> Result<StartResponse> {
        let n = self.0.starts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(msg) = self.0.start_error {
            return Err(anyhow!(msg));
        }
        Ok(StartResponse {
            task_id: format!("task-{n}"),
            status: JobStatus::Pending,
            message: "queued".into(),
        })
    }

    async fn status(&self, task_id: &str) -> Result<StatusResponse> {
        self.0.polled.lock().unwrap().push(task_id.to_string());
        if let Some(barrier) = &self.0.barrier {
            barrier.wait().await;
        }
        if let Some(gate) = &self.0.gate {
            gate.notified().await;
        }

        let (status, progress, error) = match self.next_reply() {
            Reply::Status(s, p) => (s, p, None),
            Reply::Failed(msg) => (JobStatus::Failure, None, Some(msg.to_string())),
            Reply::Transport => return Err(anyhow!("connection refused")),
        };
        Ok(StatusResponse {
            task_id: task_id.to_string(),
            status,
            progress: progress.map(f64::from),
            message: None,
            result: None,
            error,
        })
    }

    async fn fetch_result(&self, _task_id: &str) -> Result<Vec<Record>> {
        self.0.fetches.fetch_add(1, Ordering::SeqCst);
        if self.0.fetch_error {
            return Err(anyhow!("connection reset"));
        }
        Ok(self.0.records.clone())
    }
}

fn polling(interval_ms: u64, first_poll_delay_ms: u64) -> Polling {
    Polling {
        interval_ms,
        first_poll_delay_ms,
        max_wait_seconds: 0,
    }
}

/// Timer never fires during the test; ticks are driven by hand.
fn manual() -> Polling {
    polling(3_600_000, 3_600_000)
}

fn request() -> JobRequest {
    JobRequest::new("/api/ct_vencida", "2024", true)
}

fn rows() -> Vec<Record> {
    vec![
        json!({"cedula": "0102030405", "nombre": "ANA", "total": "12.50"}),
        json!({"cedula": "0911223344", "nombre": "LUIS", "total": "8.00"}),
    ]
}

#[tokio::test(start_paused = true)]
async fn pending_pending_success_resolves_once() {
    let fake = FakeBackend::new(Fake {
        records: rows(),
        ..FakeBackend::scripted(vec![
            Reply::Status(JobStatus::Pending, Some(10)),
            Reply::Status(JobStatus::Pending, Some(60)),
            Reply::Status(JobStatus::Success, Some(100)),
        ])
    });
    let c = AsyncJobController::new(fake.clone(), &polling(2000, 250));

    c.submit(request()).await;
    assert!(c.is_polling());
    assert!(c.snapshot().is_generating);

    let snap = c.wait_until_settled(None).await.unwrap();
    assert_eq!(snap.status, Some(JobStatus::Success));
    assert!(!snap.is_generating);
    assert_eq!(snap.progress, 100);
    assert_eq!(snap.result.len(), 2);
    assert_eq!(snap.task_id.as_deref(), Some("task-1"));
    assert!(snap.error.is_none());
    assert_eq!(fake.polled().len(), 3);
    assert_eq!(fake.fetches(), 1);
    assert!(!c.is_polling());
}

#[tokio::test(start_paused = true)]
async fn unnamed_queue_state_keeps_polling() {
    let fake = FakeBackend::new(Fake {
        records: rows(),
        ..FakeBackend::scripted(vec![
            Reply::Status(JobStatus::Other, Some(20)),
            Reply::Status(JobStatus::Success, None),
        ])
    });
    let c = AsyncJobController::new(fake.clone(), &polling(2000, 250));

    c.submit(request()).await;
    let snap = c.wait_until_settled(None).await.unwrap();

    assert_eq!(snap.status, Some(JobStatus::Success));
    assert!(snap.error.is_none());
    assert_eq!(snap.result.len(), 2);
    assert_eq!(fake.polled().len(), 2);
    assert_eq!(fake.fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn backend_failure_is_surfaced() {
    let fake = FakeBackend::new(FakeBackend::scripted(vec![
        Reply::Status(JobStatus::Processing, Some(30)),
        Reply::Failed("disk full"),
    ]));
    let c = AsyncJobController::new(fake.clone(), &polling(2000, 250));

    c.submit(request()).await;
    let snap = c.wait_until_settled(None).await.unwrap();

    assert_eq!(snap.status, Some(JobStatus::Failure));
    assert_eq!(snap.error.as_deref(), Some("disk full"));
    assert!(snap.result.is_empty());
    assert!(!snap.is_generating);
    assert!(!c.is_polling());
    assert_eq!(fake.fetches(), 0);
}

#[tokio::test(start_paused = true)]
async fn rejected_start_never_arms_polling() {
    let fake = FakeBackend::new(Fake {
        start_error: Some("503 Service Unavailable"),
        ..Default::default()
    });
    let c = AsyncJobController::new(fake.clone(), &polling(2000, 250));

    c.submit(request()).await;
    let snap = c.snapshot();
    assert_eq!(snap.status, Some(JobStatus::Failure));
    assert!(!snap.is_generating);
    assert!(snap.error.unwrap().contains("503 Service Unavailable"));
    assert!(!c.is_polling());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(fake.polled().is_empty());
}

#[tokio::test(start_paused = true)]
async fn poll_transport_fault_fails_the_job() {
    let fake = FakeBackend::new(FakeBackend::scripted(vec![
        Reply::Status(JobStatus::Pending, None),
        Reply::Transport,
    ]));
    let c = AsyncJobController::new(fake.clone(), &polling(2000, 250));

    c.submit(request()).await;
    let snap = c.wait_until_settled(None).await.unwrap();
    assert_eq!(snap.status, Some(JobStatus::Failure));
    assert!(snap
        .error
        .as_deref()
        .unwrap()
        .starts_with("failed to check report status"));
    assert!(!c.is_polling());

    let polls = fake.polled().len();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(fake.polled().len(), polls);
}

#[tokio::test(start_paused = true)]
async fn result_fetch_failure_is_not_silent() {
    let fake = FakeBackend::new(Fake {
        fetch_error: true,
        ..FakeBackend::scripted(vec![Reply::Status(JobStatus::Success, Some(100))])
    });
    let c = AsyncJobController::new(fake.clone(), &polling(2000, 250));

    c.submit(request()).await;
    let snap = c.wait_until_settled(None).await.unwrap();
    assert_eq!(snap.status, Some(JobStatus::Failure));
    assert!(!snap.is_generating);
    assert!(snap.result.is_empty());
    assert_eq!(
        snap.error.as_deref(),
        Some("failed to retrieve report data: connection reset")
    );
    assert_eq!(fake.fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn ticks_after_terminal_state_are_noops() {
    let fake = FakeBackend::new(Fake {
        records: rows(),
        ..FakeBackend::scripted(vec![Reply::Status(JobStatus::Success, None)])
    });
    let c = AsyncJobController::new(fake.clone(), &polling(2000, 250));

    c.submit(request()).await;
    let settled = c.wait_until_settled(None).await.unwrap();
    let polls = fake.polled().len();

    for _ in 0..5 {
        c.on_tick().await;
    }
    assert_eq!(c.snapshot(), settled);
    assert_eq!(fake.polled().len(), polls);
    assert_eq!(fake.fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn resubmitting_replaces_the_timer() {
    let fake = FakeBackend::new(FakeBackend::scripted(vec![Reply::Status(
        JobStatus::Processing,
        Some(5),
    )]));
    let c = AsyncJobController::new(fake.clone(), &polling(2000, 250));

    c.submit(request()).await;
    tokio::time::sleep(Duration::from_millis(4500)).await;
    assert!(fake.polled().iter().all(|t| t == "task-1"));
    assert!(!fake.polled().is_empty());

    c.submit(JobRequest::new("/api/ct_vencida_impuesto", "2023", true))
        .await;
    let before = fake.polled().len();
    assert_eq!(c.snapshot().progress, 0);
    assert_eq!(c.snapshot().task_id.as_deref(), Some("task-2"));

    tokio::time::sleep(Duration::from_millis(10_300)).await;
    let after: Vec<String> = fake.polled()[before..].to_vec();
    assert!(after.iter().all(|t| t == "task-2"), "stale timer still polling: {after:?}");
    assert!((5..=6).contains(&after.len()), "unexpected poll count {}", after.len());
    assert!(c.is_polling());
}

#[tokio::test]
async fn overlapping_ticks_fetch_result_once() {
    let fake = FakeBackend::new(Fake {
        records: rows(),
        barrier: Some(Barrier::new(2)),
        ..FakeBackend::scripted(vec![
            Reply::Status(JobStatus::Success, Some(100)),
            Reply::Status(JobStatus::Success, Some(100)),
        ])
    });
    let c = AsyncJobController::new(fake.clone(), &manual());

    c.submit(request()).await;
    tokio::join!(c.on_tick(), c.on_tick());

    assert_eq!(fake.polled().len(), 2, "both ticks should have reached the backend");
    assert_eq!(fake.fetches(), 1);
    let snap = c.snapshot();
    assert_eq!(snap.status, Some(JobStatus::Success));
    assert_eq!(snap.result.len(), 2);
    assert!(!snap.is_generating);
    assert!(!c.is_polling());
}

#[tokio::test]
async fn cancel_mid_poll_discards_inflight_response() {
    let fake = FakeBackend::new(Fake {
        records: rows(),
        gate: Some(Notify::new()),
        ..FakeBackend::scripted(vec![
            Reply::Status(JobStatus::Processing, Some(40)),
            Reply::Status(JobStatus::Success, Some(100)),
        ])
    });
    let c = AsyncJobController::new(fake.clone(), &manual());

    c.submit(request()).await;
    fake.release();
    c.on_tick().await;
    assert_eq!(c.snapshot().progress, 40);
    assert_eq!(c.snapshot().status, Some(JobStatus::Processing));

    let tick = c.on_tick();
    tokio::pin!(tick);
    tokio::select! {
        biased;
        _ = &mut tick => panic!("tick should be parked on the gate"),
        _ = tokio::task::yield_now() => {}
    }
    assert_eq!(fake.polled().len(), 2);

    c.cancel();
    let cancelled = c.snapshot();
    assert!(!cancelled.is_generating);
    assert_eq!(cancelled.progress, 0);
    assert_eq!(cancelled.status, None);
    assert!(!c.is_polling());

    fake.release();
    tick.await;

    assert_eq!(c.snapshot(), cancelled);
    assert_eq!(fake.fetches(), 0);
}

#[tokio::test]
async fn cancel_keeps_previous_result_until_next_submit() {
    let fake = FakeBackend::new(Fake {
        records: rows(),
        ..FakeBackend::scripted(vec![Reply::Status(JobStatus::Success, None)])
    });
    let c = AsyncJobController::new(fake.clone(), &manual());

    c.submit(request()).await;
    c.on_tick().await;
    assert_eq!(c.snapshot().result.len(), 2);

    c.cancel();
    assert_eq!(c.snapshot().result.len(), 2);
    assert_eq!(c.snapshot().status, None);

    c.submit(request()).await;
    let snap = c.snapshot();
    assert!(snap.result.is_empty());
    assert!(snap.error.is_none());
    assert_eq!(snap.status, Some(JobStatus::Pending));
    assert!(snap.is_generating);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_controller_stops_polling() {
    let fake = FakeBackend::new(FakeBackend::scripted(vec![Reply::Status(
        JobStatus::Processing,
        None,
    )]));
    let c = AsyncJobController::new(fake.clone(), &polling(2000, 250));

    c.submit(request()).await;
    tokio::time::sleep(Duration::from_millis(4500)).await;
    assert!(!fake.polled().is_empty());

    drop(c);
    let polls = fake.polled().len();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(fake.polled().len(), polls);
}

#[tokio::test(start_paused = true)]
async fn max_wait_cancels_a_stuck_job() {
    let fake = FakeBackend::new(FakeBackend::scripted(vec![Reply::Status(
        JobStatus::Processing,
        Some(50),
    )]));
    let c = AsyncJobController::new(fake.clone(), &polling(2000, 250));

    c.submit(request()).await;
    let err = c
        .wait_until_settled(Some(Duration::from_secs(10)))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("did not finish within 10s"));

    let snap = c.snapshot();
    assert!(!snap.is_generating);
    assert_eq!(snap.status, None);
    assert!(!c.is_polling());
}
