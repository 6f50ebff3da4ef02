//! # Distributed DFS Crawl
//!
//! Each node periodically walks the live overlay depth-first, collecting
//! every reachable relay node's performance report, and turns the result
//! into an eligibility position.
//!
//! - [`message`]: the values passed hop to hop.
//! - [`coordinator`]: per-instance lifecycle and timers.
//! - [`traversal`]: the per-hop state machine.
//! - [`eligibility`]: judging collected reports at conclusion.
//!
//! There is no agreement on crawl results. Every node crawls on its own,
//! and a partial walk is an acceptable outcome.

pub mod coordinator;
pub mod eligibility;
pub mod message;
pub mod traversal;

pub use coordinator::{CrawlCoordinator, CrawlStatus, TimerFired, TimerKind};
pub use eligibility::{EligibilityChecker, EligibilityMap, Ineligible};
pub use message::{CrawlAck, CrawlInstanceKey, CrawlKind, CrawlMessage};
pub use traversal::{CrawlEvent, CrawlOutcome, CrawlTraversal, DropReason};
