use crate::{
    backend::{JobStatus, Record},
    config::Config,
    util::{ensure_dir, sha256_hex},
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Summary written next to the exported rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIndex {
    pub task_id: String,
    pub report: String,
    pub endpoint: String,
    pub year: String,
    pub status: Option<JobStatus>,
    pub error: Option<String>,
    pub record_count: usize,
    #[serde(default)]
    pub records_file: Option<String>,
    #[serde(default)]
    pub records_sha256: Option<String>,
    pub started: String,
    pub finished: String,
}

/// Writes rows and index under `job_dir`. Returns the paths written.
pub fn write_outputs(
    cfg: &Config,
    job_dir: &Path,
    mut index: RunIndex,
    records: &[Record],
) -> Result<Vec<PathBuf>> {
    ensure_dir(job_dir)?;
    let mut written = Vec::new();

    if cfg.output.write_records_json && index.status == Some(JobStatus::Success) {
        let path = job_dir.join(&cfg.output.records_filename);
        let raw = to_json(cfg, records)?;
        std::fs::write(&path, &raw)
            .with_context(|| format!("writing records: {}", path.display()))?;
        index.records_file = Some(cfg.output.records_filename.clone());
        index.records_sha256 = Some(sha256_hex(raw.as_bytes()));
        written.push(path);
    }

    if cfg.output.write_index_json {
        let path = job_dir.join("index.json");
        std::fs::write(&path, to_json(cfg, &index)?)
            .with_context(|| format!("writing index: {}", path.display()))?;
        written.push(path);
    }

    Ok(written)
}

fn to_json<T: Serialize + ?Sized>(cfg: &Config, value: &T) -> Result<String> {
    let raw = if cfg.output.pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    Ok(raw)
}
