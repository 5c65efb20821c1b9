use serde::{Deserialize, Serialize};

/// Largest page the table view will ask for.
pub const DISPLAY_PAGE_CAP: u32 = 100;
/// Page size used when pulling a whole report for export.
pub const EXPORT_PAGE_SIZE: u32 = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
    pub q: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub titulos: Vec<i64>,
}

impl PageRequest {
    /// A table page, with the size capped for display.
    pub fn display(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, DISPLAY_PAGE_CAP),
            ..Default::default()
        }
    }

    /// Everything in one request, no search filter.
    pub fn export_all() -> Self {
        Self {
            page: 1,
            page_size: EXPORT_PAGE_SIZE,
            ..Default::default()
        }
    }

    pub fn with_search(mut self, q: impl Into<String>) -> Self {
        let q = q.into();
        self.q = (!q.trim().is_empty()).then_some(q);
        self
    }

    /// Date bounds (ISO dates); blank bounds are dropped.
    pub fn with_range(mut self, from: Option<String>, to: Option<String>) -> Self {
        self.from = from.filter(|s| !s.trim().is_empty());
        self.to = to.filter(|s| !s.trim().is_empty());
        self
    }

    /// Query parameters as the backend expects them. Empty filters are omitted.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(q) = self.q.as_deref().filter(|q| !q.is_empty()) {
            pairs.push(("q", q.to_string()));
        }
        if let Some(from) = self.from.as_deref().filter(|s| !s.is_empty()) {
            pairs.push(("from", from.to_string()));
        }
        if let Some(to) = self.to.as_deref().filter(|s| !s.is_empty()) {
            pairs.push(("to", to.to_string()));
        }
        pairs.push(("page", self.page.to_string()));
        pairs.push(("page_size", self.page_size.to_string()));
        if !self.titulos.is_empty() {
            let codigos = self
                .titulos
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(",");
            pairs.push(("codigos", codigos));
        }
        pairs
    }
}

/// Total-row estimate for a backend that does not report totals.
///
/// A short page is the last one, so the total is exact. A full page means
/// at least one more page exists; the estimate never exceeds the display cap.
pub fn estimate_total(page: u32, page_size: u32, rows: usize) -> u64 {
    let page = page.max(1) as u64;
    let size = page_size as u64;
    let rows = rows as u64;
    if rows < size {
        (page - 1) * size + rows
    } else {
        (DISPLAY_PAGE_CAP as u64).min((page + 1) * size)
    }
}
