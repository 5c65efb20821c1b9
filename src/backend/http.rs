use super::{types::*, JobBackend};
use crate::{config::Config, paging::PageRequest};
use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    status_path: String,
    titulos_path: String,
}

impl HttpBackend {
    pub fn new(cfg: &Config) -> Result<Self> {
        let base_url = cfg.api.base_url.trim();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(anyhow!("api.base_url must be an http(s) URL: {base_url}"));
        }
        if !cfg.api.status_path.contains("{task_id}") {
            return Err(anyhow!(
                "api.status_path must contain {{task_id}}: {}",
                cfg.api.status_path
            ));
        }

        let api_key = cfg.api.resolve_api_key();
        if api_key.is_none() {
            warn!(
                "no API key configured (api.api_key / ${}); requests will be sent without x-api-key",
                cfg.api.api_key_env
            );
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.api.request_timeout_seconds.max(1)))
            .build()
            .with_context(|| "building HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            status_path: cfg.api.status_path.clone(),
            titulos_path: cfg.api.titulos_path.clone(),
        })
    }

    /// `{base}{endpoint}[/{year}]`, with the year as a path segment only when asked for.
    pub fn endpoint_url(&self, endpoint: &str, year: &str, use_year_path: bool) -> String {
        let mut url = join_url(&self.base_url, endpoint);
        let year = year.trim();
        if use_year_path && !year.is_empty() {
            url.push('/');
            url.push_str(&urlencoding::encode(year));
        }
        url
    }

    pub fn status_url(&self, task_id: &str) -> String {
        let path = self
            .status_path
            .replace("{task_id}", &urlencoding::encode(task_id));
        join_url(&self.base_url, &path)
    }

    fn year_query(year: &str, use_year_path: bool) -> Vec<(&'static str, String)> {
        let year = year.trim();
        if use_year_path || year.is_empty() {
            Vec::new()
        } else {
            vec![("year", year.to_string())]
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&'static str, String)],
    ) -> Result<T> {
        debug!(url, ?query, "GET");
        let mut req = self.client.get(url).query(query);
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("GET {url} returned {status}: {}", body.trim()));
        }

        resp.json::<T>()
            .await
            .with_context(|| format!("decoding JSON from {url}"))
    }

    /// One page of a report read synchronously, outside the job flow.
    pub async fn fetch_page(
        &self,
        endpoint: &str,
        year: &str,
        use_year_path: bool,
        page: &PageRequest,
    ) -> Result<Vec<Record>> {
        let url = self.endpoint_url(endpoint, year, use_year_path);
        let mut query = Self::year_query(year, use_year_path);
        query.extend(page.query_pairs());
        self.get_json(&url, &query).await
    }

    pub async fn list_titulos(&self) -> Result<Vec<Titulo>> {
        let url = join_url(&self.base_url, &self.titulos_path);
        self.get_json(&url, &[]).await
    }
}

impl JobBackend for HttpBackend {
    async fn start(&self, req: &JobRequest) -> Result<StartResponse> {
        let url = self.endpoint_url(&req.endpoint, &req.year, req.use_year_path);
        let query = Self::year_query(&req.year, req.use_year_path);
        self.get_json(&url, &query)
            .await
            .with_context(|| format!("starting report job at {}", req.endpoint))
    }

    async fn status(&self, task_id: &str) -> Result<StatusResponse> {
        let url = self.status_url(task_id);
        self.get_json(&url, &[]).await
    }

    async fn fetch_result(&self, task_id: &str) -> Result<Vec<Record>> {
        let resp = self.status(task_id).await?;
        let missing_data = resp.result.as_ref().is_none_or(|r| r.data.is_none());
        if resp.status == JobStatus::Success && missing_data {
            warn!(task_id, "job succeeded but the status response carried no data");
        }
        Ok(resp.into_records())
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}
