use crate::{
    backend::{JobBackend, JobRequest},
    config::Polling,
    machine::{Effect, Event, JobError, JobMachine, JobSnapshot},
};
use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Drives one report job at a time against a [`JobBackend`].
///
/// Each timer tick runs as its own task, so ticks can overlap. The machine
/// leaves the polling phase under the lock before the timer is aborted and
/// before the result is fetched; a late tick finds nothing to poll.
pub struct AsyncJobController<B: JobBackend> {
    shared: Arc<Shared<B>>,
}

struct Shared<B> {
    backend: B,
    polling: Polling,
    state: Mutex<State>,
    updates: watch::Sender<JobSnapshot>,
}

struct State {
    machine: JobMachine,
    timer: Option<JoinHandle<()>>,
}

impl State {
    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl<B: JobBackend> AsyncJobController<B> {
    pub fn new(backend: B, polling: &Polling) -> Self {
        let (updates, _) = watch::channel(JobSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                backend,
                polling: polling.clone(),
                state: Mutex::new(State {
                    machine: JobMachine::new(),
                    timer: None,
                }),
                updates,
            }),
        }
    }

    /// Submits a new job, superseding whatever was running.
    ///
    /// Never fails: start errors end up in the snapshot as FAILURE.
    pub async fn submit(&self, req: JobRequest) {
        let generation = self.shared.begin();
        info!(
            endpoint = %req.endpoint,
            year = %req.year,
            use_year_path = req.use_year_path,
            generation,
            "submitting report job"
        );

        let event = match self.shared.backend.start(&req).await {
            Ok(resp) => {
                info!(task_id = %resp.task_id, status = %resp.status, "report job accepted");
                Event::Started(resp)
            }
            Err(err) => {
                warn!("report job submission failed: {err:#}");
                Event::Fault(JobError::Submission(format!("{err:#}")))
            }
        };
        self.shared.dispatch(generation, event);
    }

    /// Stops polling and returns to idle. In-flight calls finish but are ignored.
    pub fn cancel(&self) {
        let mut state = self.shared.lock();
        state.stop_timer();
        state.machine.cancel();
        self.shared.publish(&state);
        info!("report job cancelled");
    }

    /// One poll step. No-op unless a job is actively polling.
    pub async fn on_tick(&self) {
        self.shared.poll().await;
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.shared.updates.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.shared.updates.subscribe()
    }

    pub fn is_polling(&self) -> bool {
        self.shared
            .lock()
            .timer
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Waits until the current job stops generating. Cancels it when `max_wait` runs out.
    pub async fn wait_until_settled(&self, max_wait: Option<Duration>) -> Result<JobSnapshot> {
        let mut rx = self.subscribe();
        let settled = async {
            rx.wait_for(|s| !s.is_generating)
                .await
                .map(|s| (*s).clone())
                .map_err(|_| anyhow!("job controller closed"))
        };

        match max_wait {
            None => settled.await,
            Some(limit) => match tokio::time::timeout(limit, settled).await {
                Ok(res) => res,
                Err(_) => {
                    self.cancel();
                    Err(anyhow!(
                        "report did not finish within {}s",
                        limit.as_secs()
                    ))
                }
            },
        }
    }
}

impl<B: JobBackend> Drop for AsyncJobController<B> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if state.timer.is_some() {
            debug!("controller dropped while polling; stopping timer");
        }
        state.stop_timer();
        state.machine.cancel();
    }
}

impl<B: JobBackend> Shared<B> {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &State) {
        self.updates.send_replace(state.machine.snapshot().clone());
    }

    fn begin(&self) -> u64 {
        let mut state = self.lock();
        state.stop_timer();
        let generation = state.machine.begin();
        self.publish(&state);
        generation
    }

    fn poll_target(&self) -> Option<(u64, String)> {
        self.lock().machine.poll_target()
    }

    /// Applies `event` and carries out its effect. Returns the task whose
    /// result must be fetched next, if any.
    fn dispatch(self: &Arc<Self>, generation: u64, event: Event) -> Option<String> {
        let mut state = self.lock();
        let effect = state.machine.apply(generation, event);
        let fetch = match effect {
            Effect::None => None,
            Effect::ArmPolling { task_id } => {
                state.stop_timer();
                debug!(%task_id, "arming poll timer");
                state.timer = Some(self.arm(generation));
                None
            }
            Effect::StopPolling => {
                state.stop_timer();
                None
            }
            Effect::StopPollingAndFetch { task_id } => {
                state.stop_timer();
                Some(task_id)
            }
        };
        self.publish(&state);
        fetch
    }

    fn arm(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let first = Duration::from_millis(self.polling.first_poll_delay_ms);
        let period = Duration::from_millis(self.polling.interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if shared.lock().machine.generation() != generation {
                    break;
                }
                tokio::spawn(async move {
                    shared.poll().await;
                });
            }
        })
    }

    async fn poll(self: &Arc<Self>) {
        let Some((generation, task_id)) = self.poll_target() else {
            return;
        };

        let event = match self.backend.status(&task_id).await {
            Ok(resp) => {
                debug!(
                    %task_id,
                    status = %resp.status,
                    progress = ?resp.progress,
                    "poll"
                );
                Event::Polled(resp)
            }
            Err(err) => {
                warn!(%task_id, "status poll failed: {err:#}");
                Event::Fault(JobError::Poll(format!("{err:#}")))
            }
        };

        if let Some(task_id) = self.dispatch(generation, event) {
            self.complete(generation, task_id).await;
        }
    }

    async fn complete(self: &Arc<Self>, generation: u64, task_id: String) {
        let event = match self.backend.fetch_result(&task_id).await {
            Ok(records) => {
                info!(%task_id, records = records.len(), "report data retrieved");
                Event::ResultFetched(records)
            }
            Err(err) => {
                warn!(%task_id, "fetching report data failed: {err:#}");
                Event::Fault(JobError::ResultFetch(format!("{err:#}")))
            }
        };
        self.dispatch(generation, event);
    }
}
