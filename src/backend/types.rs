use serde::{Deserialize, Serialize};

/// One report row. Shapes differ per report, so rows stay untyped.
pub type Record = serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Success,
    Failure,
    /// Any other state the backend's task queue reports (`STARTED`, `RETRY`, ...).
    /// Never terminal; polling carries on.
    #[serde(other)]
    Other,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failure => "FAILURE",
            JobStatus::Other => "OTHER",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller asks the backend to generate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub endpoint: String,
    pub year: String,
    pub use_year_path: bool,
}

impl JobRequest {
    pub fn new(endpoint: impl Into<String>, year: impl Into<String>, use_year_path: bool) -> Self {
        Self {
            endpoint: endpoint.into(),
            year: year.into(),
            use_year_path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartResponse {
    pub task_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub task_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result: Option<JobResult>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StatusResponse {
    /// Progress rounded and clamped to 0..=100.
    pub fn progress_percent(&self) -> Option<u8> {
        self.progress
            .filter(|p| p.is_finite())
            .map(|p| p.round().clamp(0.0, 100.0) as u8)
    }

    /// Rows carried by a SUCCESS response; empty for anything else.
    pub fn into_records(self) -> Vec<Record> {
        if self.status != JobStatus::Success {
            return Vec::new();
        }
        self.result.and_then(|r| r.data).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    #[serde(default)]
    pub records: u64,
    #[serde(default)]
    pub data: Option<Vec<Record>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct Titulo {
    pub codigo: i64,
    pub descripcion: String,
}
