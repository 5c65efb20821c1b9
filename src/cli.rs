use crate::{
    backend::{http::HttpBackend, JobBackend},
    catalog::{FilterMode, ReportKind, ReportQuery},
    config::Config,
    controller::AsyncJobController,
    paging::{estimate_total, PageRequest},
    report::{write_outputs, RunIndex},
    util::{current_year, ensure_dir, now_rfc3339, safe_dir_name},
};
use anyhow::{anyhow, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "cartera-report")]
#[command(about = "Generate and export cartera vencida reports from the reporting API")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./cartera-report.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ReportSel {
    /// Report id, e.g. carteraVencida.
    #[arg(long)]
    pub report: ReportKind,
    #[arg(long)]
    pub year: String,
    /// Send the year as a query parameter instead of a path segment.
    #[arg(long)]
    pub range: bool,
}

impl ReportSel {
    fn query(&self) -> Result<ReportQuery> {
        let query = ReportQuery {
            kind: self.report,
            mode: if self.range {
                FilterMode::Range
            } else {
                FilterMode::ByYear
            },
            year: Some(self.year.clone()),
        };
        query.validate(current_year())?;
        Ok(query)
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the reports the backend offers.
    Catalog {},
    /// Start a report job and print the backend's answer.
    Start {
        #[command(flatten)]
        sel: ReportSel,
    },
    /// Print the current status of a job.
    Status {
        #[arg(long)]
        task_id: String,
    },
    /// Start a job, poll until it settles and write the rows to disk.
    Run {
        #[command(flatten)]
        sel: ReportSel,
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Read one page of a report directly.
    Page {
        #[command(flatten)]
        sel: ReportSel,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 25)]
        page_size: u32,
        #[arg(long)]
        q: Option<String>,
        /// Start date (ISO), sent as `from`.
        #[arg(long)]
        from: Option<String>,
        /// End date (ISO), sent as `to`.
        #[arg(long)]
        to: Option<String>,
        /// Title code filter, repeatable.
        #[arg(long = "titulo")]
        titulos: Vec<i64>,
        /// Fetch every row in one request instead of a display page.
        #[arg(long)]
        all: bool,
    },
    /// List title codes for the by-title report.
    Titulos {},
}

pub async fn dispatch(args: Args) -> Result<()> {
    let cfg_path = resolve_config_path(args.config.as_deref());
    let cfg = Config::load_or_default(cfg_path.as_deref())?;

    match &args.cmd {
        Command::Catalog {} => {
            let _guard = init_default_logging(&args, &cfg)?;
            catalog()
        }
        Command::Start { sel } => {
            let _guard = init_default_logging(&args, &cfg)?;
            start(&cfg, sel).await
        }
        Command::Status { task_id } => {
            let _guard = init_default_logging(&args, &cfg)?;
            status(&cfg, task_id).await
        }
        Command::Run { sel, out_dir } => run(&args, &cfg, sel, out_dir.as_deref()).await,
        Command::Page {
            sel,
            page,
            page_size,
            q,
            from,
            to,
            titulos,
            all,
        } => {
            let _guard = init_default_logging(&args, &cfg)?;
            let mut req = if *all {
                PageRequest::export_all()
            } else {
                PageRequest::display(*page, *page_size)
            };
            if let Some(q) = q {
                req = req.with_search(q.clone());
            }
            req = req.with_range(from.clone(), to.clone());
            req.titulos = titulos.clone();
            page_cmd(&cfg, sel, &req).await
        }
        Command::Titulos {} => {
            let _guard = init_default_logging(&args, &cfg)?;
            titulos(&cfg).await
        }
    }
}

fn init_default_logging(args: &Args, cfg: &Config) -> Result<Option<WorkerGuard>> {
    let log_path = resolve_log_path(cfg, None);
    init_logging(args, cfg, log_path.as_deref())
}

fn resolve_config_path(user: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = user {
        return Some(p.to_path_buf());
    }
    let default = PathBuf::from("cartera-report.toml");
    default.exists().then_some(default)
}

fn init_logging(args: &Args, cfg: &Config, file_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::File::create(path)
            .with_context(|| format!("create log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn catalog() -> Result<()> {
    let reports: Vec<_> = ReportKind::ALL
        .iter()
        .map(|k| {
            serde_json::json!({
                "id": k.id(),
                "endpoint": k.endpoint(),
                "description": k.description(),
                "bulk_only": k.bulk_only(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

async fn start(cfg: &Config, sel: &ReportSel) -> Result<()> {
    let backend = HttpBackend::new(cfg)?;
    let resp = backend.start(&sel.query()?.job_request()).await?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(())
}

async fn status(cfg: &Config, task_id: &str) -> Result<()> {
    let backend = HttpBackend::new(cfg)?;
    let resp = backend.status(task_id).await?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(())
}

async fn page_cmd(cfg: &Config, sel: &ReportSel, req: &PageRequest) -> Result<()> {
    let query = sel.query()?;
    if query.kind.bulk_only() && req.page_size < crate::paging::EXPORT_PAGE_SIZE {
        warn!(
            "{} is normally exported in full; consider `run` or --all",
            query.kind.id()
        );
    }
    let job = query.page_request();
    let backend = HttpBackend::new(cfg)?;
    let rows = backend
        .fetch_page(&job.endpoint, &job.year, job.use_year_path, req)
        .await?;
    let total = estimate_total(req.page, req.page_size, rows.len());
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "report": query.kind.id(),
            "page": req.page,
            "page_size": req.page_size,
            "estimated_total": total,
            "rows": rows,
        }))?
    );
    Ok(())
}

async fn titulos(cfg: &Config) -> Result<()> {
    let backend = HttpBackend::new(cfg)?;
    let list = backend.list_titulos().await?;
    println!("{}", serde_json::to_string_pretty(&list)?);
    Ok(())
}

async fn run(args: &Args, cfg: &Config, sel: &ReportSel, out_override: Option<&Path>) -> Result<()> {
    let query = sel.query()?;
    let job = query.job_request();

    let out_root = out_override
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&cfg.output.out_dir));
    ensure_dir(&out_root)?;

    let log_path = resolve_log_path(cfg, Some(&out_root));
    let _guard = init_logging(args, cfg, log_path.as_deref())?;

    let backend = HttpBackend::new(cfg)?;
    let controller = AsyncJobController::new(backend, &cfg.polling);

    let mut updates = controller.subscribe();
    let progress_log = tokio::spawn(async move {
        let mut last = None;
        while updates.changed().await.is_ok() {
            let snap = updates.borrow_and_update().clone();
            let key = (snap.status, snap.progress);
            if last != Some(key) {
                if let Some(status) = snap.status {
                    info!("status={} progress={}%", status, snap.progress);
                }
                last = Some(key);
            }
        }
    });

    let started = now_rfc3339();
    controller.submit(job.clone()).await;

    let max_wait = (cfg.polling.max_wait_seconds > 0)
        .then(|| Duration::from_secs(cfg.polling.max_wait_seconds));

    let outcome = tokio::select! {
        res = controller.wait_until_settled(max_wait) => res,
        _ = tokio::signal::ctrl_c() => {
            controller.cancel();
            Err(anyhow!("interrupted; report job cancelled"))
        }
    };
    progress_log.abort();
    let snap = outcome?;

    let task_id = snap.task_id.clone().ok_or_else(|| {
        anyhow!(
            "report job was not accepted: {}",
            snap.error.as_deref().unwrap_or("unknown error")
        )
    })?;
    let job_dir = out_root.join(safe_dir_name(&task_id)?);

    let index = RunIndex {
        task_id: task_id.clone(),
        report: query.kind.id().to_string(),
        endpoint: job.endpoint.clone(),
        year: job.year.clone(),
        status: snap.status,
        error: snap.error.clone(),
        record_count: snap.result.len(),
        records_file: None,
        records_sha256: None,
        started,
        finished: now_rfc3339(),
    };
    let written = write_outputs(cfg, &job_dir, index, &snap.result)?;
    for path in &written {
        info!("wrote {}", path.display());
    }

    if let Some(err) = &snap.error {
        return Err(anyhow!("report {task_id} failed: {err}"));
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "task_id": task_id,
            "job_dir": job_dir,
            "records": snap.result.len(),
            "status": "ok"
        }))?
    );
    Ok(())
}

fn resolve_log_path(cfg: &Config, out_dir: Option<&Path>) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }

    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }

    let dir = out_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(&cfg.output.out_dir));
    Some(dir.join("cartera-report.log"))
}
