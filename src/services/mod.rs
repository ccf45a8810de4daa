//! Scan orchestration services.

pub mod admission;
pub mod dispatcher;
pub mod ingestion;
pub mod lifecycle;
pub mod metrics;
pub mod progress;
pub mod recovery;
pub mod runner;
pub mod scan;
