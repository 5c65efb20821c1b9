use crate::backend::JobRequest;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Oldest year the backend carries data for.
pub const FIRST_YEAR: i32 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportKind {
    CarteraVencida,
    CarteraVencidaImpuesto,
    CarteraVencidaTitulo,
    CarteraVencidaDetalle,
}

impl ReportKind {
    pub const ALL: [ReportKind; 4] = [
        ReportKind::CarteraVencida,
        ReportKind::CarteraVencidaImpuesto,
        ReportKind::CarteraVencidaTitulo,
        ReportKind::CarteraVencidaDetalle,
    ];

    pub fn id(self) -> &'static str {
        match self {
            ReportKind::CarteraVencida => "carteraVencida",
            ReportKind::CarteraVencidaImpuesto => "carteraVencidaImpuesto",
            ReportKind::CarteraVencidaTitulo => "carteraVencidaTitulo",
            ReportKind::CarteraVencidaDetalle => "carteraVencidaDetalle",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.id().eq_ignore_ascii_case(id.trim()))
    }

    pub fn endpoint(self) -> &'static str {
        match self {
            ReportKind::CarteraVencida => "/api/ct_vencida",
            ReportKind::CarteraVencidaImpuesto => "/api/ct_vencida_impuesto",
            ReportKind::CarteraVencidaTitulo => "/api/ct_vencida_titulo",
            ReportKind::CarteraVencidaDetalle => "/api/ct_vencida_titulo_detalle",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ReportKind::CarteraVencida => "overdue portfolio by taxpayer",
            ReportKind::CarteraVencidaImpuesto => "overdue portfolio by tax",
            ReportKind::CarteraVencidaTitulo => "overdue portfolio by title",
            ReportKind::CarteraVencidaDetalle => "overdue portfolio, per-taxpayer title detail",
        }
    }

    /// Too large for a paged table; only generated as a job and exported.
    pub fn bulk_only(self) -> bool {
        !matches!(self, ReportKind::CarteraVencidaTitulo)
    }
}

impl std::str::FromStr for ReportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_id(s).ok_or_else(|| {
            let known = Self::ALL.map(|k| k.id()).join(", ");
            anyhow!("unknown report: {s} (expected one of: {known})")
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilterMode {
    #[default]
    ByYear,
    Range,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportQuery {
    pub kind: ReportKind,
    pub mode: FilterMode,
    pub year: Option<String>,
}

impl ReportQuery {
    pub fn by_year(kind: ReportKind, year: impl Into<String>) -> Self {
        Self {
            kind,
            mode: FilterMode::ByYear,
            year: Some(year.into()),
        }
    }

    /// Checks the query against the backend's rules, using `current_year` as the upper bound.
    pub fn validate(&self, current_year: i32) -> Result<()> {
        let year = self
            .year
            .as_deref()
            .map(str::trim)
            .filter(|y| !y.is_empty())
            .ok_or_else(|| anyhow!("a year is required for {}", self.kind.id()))?;

        let parsed: i32 = year
            .parse()
            .map_err(|_| anyhow!("year is not a number: {year}"))?;
        if !(FIRST_YEAR..=current_year).contains(&parsed) {
            return Err(anyhow!(
                "year {parsed} out of range {FIRST_YEAR}..={current_year}"
            ));
        }

        if self.kind == ReportKind::CarteraVencidaImpuesto && self.mode != FilterMode::ByYear {
            return Err(anyhow!("{} can only be filtered by year", self.kind.id()));
        }
        Ok(())
    }

    /// Target of a synchronous page read. Outside by-year mode no year is sent at all.
    pub fn page_request(&self) -> JobRequest {
        match self.mode {
            FilterMode::ByYear => self.job_request(),
            FilterMode::Range => JobRequest::new(self.kind.endpoint(), "", false),
        }
    }

    pub fn job_request(&self) -> JobRequest {
        JobRequest::new(
            self.kind.endpoint(),
            self.year.as_deref().unwrap_or("").trim(),
            self.mode == FilterMode::ByYear,
        )
    }
}
