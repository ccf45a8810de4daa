//! Page windows over an owner's scan history.

use serde::{Deserialize, Serialize};

/// 1-based page request. Missing or out-of-range values fall back to sane
/// bounds rather than erroring.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Pagination {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

impl Pagination {
    const SCANS_PER_PAGE: i64 = 20;
    const SCANS_PER_PAGE_MAX: i64 = 100;

    pub fn new(page: i64, per_page: i64) -> Self {
        Self {
            page: Some(page),
            per_page: Some(per_page),
        }
    }

    pub fn current_page(&self) -> i64 {
        self.page.map_or(1, |p| p.max(1))
    }

    pub fn limit(&self) -> i64 {
        self.per_page
            .map_or(Self::SCANS_PER_PAGE, |n| n.clamp(1, Self::SCANS_PER_PAGE_MAX))
    }

    /// Rows to skip before this page.
    pub fn offset(&self) -> i64 {
        self.limit().saturating_mul(self.current_page() - 1)
    }
}

/// One page of results plus enough totals to render a pager.
#[derive(Debug, Clone, Serialize)]
pub struct PagedResult<T: Serialize> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
    pub has_more: bool,
}

impl<T: Serialize> PagedResult<T> {
    pub fn new(items: Vec<T>, total: i64, pagination: &Pagination) -> Self {
        let page = pagination.current_page();
        let per_page = pagination.limit();
        let total_pages = if total <= 0 {
            0
        } else {
            (total - 1) / per_page + 1
        };
        Self {
            items,
            total,
            page,
            per_page,
            total_pages,
            has_more: page < total_pages,
        }
    }
}
