//! Ralph iteration loop: PRD-driven agent iterations, completed-item
//! archival, and guardrail hook generation.

pub mod hooks;
pub mod loop_driver;
pub mod prd_archive;
pub mod reports;

pub use loop_driver::{ProgressEvent, RalphLoopDriver};
pub use prd_archive::PrdArchive;
pub use reports::IterationReportStore;
