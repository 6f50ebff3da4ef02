//! # Performance Status
//!
//! Local operating-mode accounting and the reports built from it.

pub mod accounting;
pub mod recorder;
pub mod report;

pub use accounting::{AccountingSnapshot, ModeCounters, OperatingMode, StatusAccounting};
pub use recorder::PerformanceRecorder;
pub use report::{ModeStatus, PerformanceReport};
