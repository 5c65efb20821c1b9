use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: Api,
    #[serde(default)]
    pub polling: Polling,
    #[serde(default)]
    pub output: Output,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        Ok(cfg)
    }

    /// Loads `path` when given, otherwise falls back to built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Api {
    pub base_url: String,
    /// Sent as `x-api-key`. Takes precedence over `api_key_env`.
    pub api_key: String,
    pub api_key_env: String,
    /// `{task_id}` is substituted with the URL-encoded task id.
    pub status_path: String,
    pub titulos_path: String,
    pub request_timeout_seconds: u64,
}
impl Default for Api {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            api_key: "".into(),
            api_key_env: "CARTERA_API_KEY".into(),
            status_path: "/api/ct_vencida/status/{task_id}/".into(),
            titulos_path: "/api/ct_vencida_titulo".into(),
            request_timeout_seconds: 120,
        }
    }
}

impl Api {
    pub fn resolve_api_key(&self) -> Option<String> {
        if !self.api_key.trim().is_empty() {
            return Some(self.api_key.trim().to_string());
        }
        if self.api_key_env.is_empty() {
            return None;
        }
        std::env::var(&self.api_key_env)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Polling {
    pub interval_ms: u64,
    pub first_poll_delay_ms: u64,
    /// 0 waits forever.
    pub max_wait_seconds: u64,
}
impl Default for Polling {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            first_poll_delay_ms: 250,
            max_wait_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Output {
    pub out_dir: String,
    pub write_records_json: bool,
    pub records_filename: String,
    pub write_index_json: bool,
    pub pretty: bool,
}
impl Default for Output {
    fn default() -> Self {
        Self {
            out_dir: "out".into(),
            write_records_json: true,
            records_filename: "records.json".into(),
            write_index_json: true,
            pretty: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: false,
            file_path: "".into(),
        }
    }
}
