pub mod http;
pub mod types;

use anyhow::Result;
use std::future::Future;

pub use types::{JobRequest, JobResult, JobStatus, Record, StartResponse, StatusResponse, Titulo};

/// The remote side of a report job.
pub trait JobBackend: Send + Sync + 'static {
    fn start(&self, req: &JobRequest) -> impl Future<Output = Result<StartResponse>> + Send;

    fn status(&self, task_id: &str) -> impl Future<Output = Result<StatusResponse>> + Send;

    /// Rows of a finished job. Empty when the job has not succeeded or carried no data.
    fn fetch_result(&self, task_id: &str) -> impl Future<Output = Result<Vec<Record>>> + Send;
}
