//! Database models and DTOs for scan jobs and their findings.

pub mod pagination;
pub mod scan;
pub mod scan_finding;
