//! Job lifecycle state machine.
//!
//! Pure and synchronous: the controller feeds it backend outcomes and acts on
//! the returned [`Effect`]. Every event is tagged with the generation it was
//! issued under; anything from an older generation is dropped, and no event
//! moves a job out of a terminal phase.

use crate::backend::{JobStatus, Record, StartResponse, StatusResponse};
use std::sync::Arc;
use thiserror::Error;

pub const GENERIC_FAILURE: &str = "report generation failed";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("failed to start report generation: {0}")]
    Submission(String),
    #[error("failed to check report status: {0}")]
    Poll(String),
    #[error("{0}")]
    BackendReported(String),
    #[error("failed to retrieve report data: {0}")]
    ResultFetch(String),
}

/// What observers see.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobSnapshot {
    pub task_id: Option<String>,
    /// `None` before the first submission and after a cancel.
    pub status: Option<JobStatus>,
    pub progress: u8,
    pub is_generating: bool,
    pub error: Option<String>,
    pub result: Arc<Vec<Record>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Submitting,
    Polling { task_id: String },
    /// SUCCESS observed; result fetch outstanding. Ticks are no longer accepted.
    Completing { task_id: String },
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub enum Event {
    Started(StartResponse),
    Polled(StatusResponse),
    ResultFetched(Vec<Record>),
    Fault(JobError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    None,
    ArmPolling { task_id: String },
    StopPolling,
    /// Stop the timer first, then fetch the result.
    StopPollingAndFetch { task_id: String },
}

#[derive(Debug)]
pub struct JobMachine {
    generation: u64,
    phase: Phase,
    snapshot: JobSnapshot,
}

impl Default for JobMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl JobMachine {
    pub fn new() -> Self {
        Self {
            generation: 0,
            phase: Phase::Idle,
            snapshot: JobSnapshot::default(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn snapshot(&self) -> &JobSnapshot {
        &self.snapshot
    }

    /// Starts a new job generation and clears everything the previous job left behind.
    pub fn begin(&mut self) -> u64 {
        self.generation += 1;
        self.phase = Phase::Submitting;
        self.snapshot = JobSnapshot {
            task_id: None,
            status: Some(JobStatus::Pending),
            progress: 0,
            is_generating: true,
            error: None,
            result: Arc::new(Vec::new()),
        };
        self.generation
    }

    /// Back to idle. Result and error of the last job stay visible.
    pub fn cancel(&mut self) {
        self.generation += 1;
        self.phase = Phase::Idle;
        self.snapshot.status = None;
        self.snapshot.progress = 0;
        self.snapshot.is_generating = false;
    }

    /// The task to poll, or `None` when a tick must be a no-op.
    pub fn poll_target(&self) -> Option<(u64, String)> {
        match &self.phase {
            Phase::Polling { task_id } => Some((self.generation, task_id.clone())),
            _ => None,
        }
    }

    pub fn apply(&mut self, generation: u64, event: Event) -> Effect {
        if generation != self.generation {
            return Effect::None;
        }

        match (self.phase.clone(), event) {
            (Phase::Submitting, Event::Started(resp)) => {
                self.snapshot.task_id = Some(resp.task_id.clone());
                if resp.status == JobStatus::Failure {
                    let msg = non_empty(Some(resp.message)).unwrap_or(GENERIC_FAILURE.into());
                    self.fail(JobError::BackendReported(msg));
                    return Effect::None;
                }
                self.snapshot.status = Some(observed(resp.status));
                self.phase = Phase::Polling {
                    task_id: resp.task_id.clone(),
                };
                Effect::ArmPolling {
                    task_id: resp.task_id,
                }
            }
            (Phase::Submitting, Event::Fault(err @ JobError::Submission(_))) => {
                self.fail(err);
                Effect::None
            }
            (Phase::Polling { task_id }, Event::Polled(resp)) => {
                match resp.status {
                    JobStatus::Pending | JobStatus::Processing | JobStatus::Other => {
                        self.snapshot.status = Some(observed(resp.status));
                        self.snapshot.progress = resp.progress_percent().unwrap_or(0);
                        Effect::None
                    }
                    JobStatus::Success => {
                        self.snapshot.status = Some(JobStatus::Success);
                        self.snapshot.progress = resp.progress_percent().unwrap_or(100);
                        self.phase = Phase::Completing {
                            task_id: task_id.clone(),
                        };
                        Effect::StopPollingAndFetch { task_id }
                    }
                    JobStatus::Failure => {
                        self.snapshot.progress = resp.progress_percent().unwrap_or(0);
                        let msg = non_empty(resp.error)
                            .or_else(|| non_empty(resp.message))
                            .unwrap_or(GENERIC_FAILURE.into());
                        self.fail(JobError::BackendReported(msg));
                        Effect::StopPolling
                    }
                }
            }
            (Phase::Polling { .. }, Event::Fault(err @ JobError::Poll(_))) => {
                self.fail(err);
                Effect::StopPolling
            }
            (Phase::Completing { .. }, Event::ResultFetched(records)) => {
                self.snapshot.result = Arc::new(records);
                self.snapshot.is_generating = false;
                self.phase = Phase::Succeeded;
                Effect::None
            }
            (Phase::Completing { .. }, Event::Fault(err @ JobError::ResultFetch(_))) => {
                self.fail(err);
                Effect::None
            }
            _ => Effect::None,
        }
    }

    fn fail(&mut self, err: JobError) {
        self.snapshot.status = Some(JobStatus::Failure);
        self.snapshot.error = Some(err.to_string());
        self.snapshot.result = Arc::new(Vec::new());
        self.snapshot.is_generating = false;
        self.phase = Phase::Failed;
    }
}

/// Queue states without a name of their own show as PROCESSING.
fn observed(status: JobStatus) -> JobStatus {
    match status {
        JobStatus::Other => JobStatus::Processing,
        other => other,
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.trim().is_empty())
}
