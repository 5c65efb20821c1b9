use anyhow::{Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::Path;
use time::format_description::well_known::Rfc3339;

pub fn ensure_dir(p: &Path) -> Result<()> {
    std::fs::create_dir_all(p).with_context(|| format!("create_dir_all {}", p.display()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    format!("{:x}", h.finalize())
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

pub fn current_year() -> i32 {
    time::OffsetDateTime::now_utc().year()
}

/// Backend task ids become directory names; keep them to a safe alphabet.
pub fn safe_dir_name(task_id: &str) -> Result<String> {
    let re = Regex::new(r"[^A-Za-z0-9_-]+")?;
    let cleaned = re.replace_all(task_id.trim(), "_");
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        // Nothing usable left; fall back to a stable digest of the raw id.
        Ok(sha256_hex(task_id.as_bytes())[..16].to_string())
    } else {
        Ok(cleaned.to_string())
    }
}
