//! # Crawl Messages
//!
//! One crawl hop carries everything the walk has learned so far: who has
//! been visited, the open DFS call chain, and every report collected.
//!
//! Messages are values. Each hop builds its outgoing message from the
//! incoming one with the consuming builder methods below; nothing is
//! mutated after it has been handed to the peer directory.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::keys::NodeKey;
use crate::ledger::LedgerIndex;
use crate::performance::report::PerformanceReport;

/// Direction of a hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlKind {
    /// Going deeper: "crawl your subtree".
    Request,
    /// Backtracking: "my subtree is done".
    Response,
}

/// Identifies one logical crawl: who started it and at which ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CrawlInstanceKey {
    pub initiator: NodeKey,
    pub start_ledger: LedgerIndex,
}

impl fmt::Display for CrawlInstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.initiator.as_str().get(..8).unwrap_or(self.initiator.as_str());
        write!(f, "{}@{}", short, self.start_ledger)
    }
}

/// A crawl request or response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlMessage {
    pub kind: CrawlKind,
    /// Every node the walk has reached or given up on, in order. The first
    /// entry is the initiator.
    pub visited: Vec<NodeKey>,
    /// The open call chain. Top is the node currently holding the walk.
    pub dfs: Vec<NodeKey>,
    /// Collected reports, keyed by reporter.
    pub reports: BTreeMap<NodeKey, PerformanceReport>,
    /// Round marker. Peers running an older protocol leave it out, and
    /// such messages are rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ledger: Option<LedgerIndex>,
}

impl CrawlMessage {
    /// The first request of a crawl started by `me`.
    pub fn begin(me: NodeKey, report: PerformanceReport, start_ledger: LedgerIndex) -> Self {
        let mut reports = BTreeMap::new();
        reports.insert(me.clone(), report);
        Self {
            kind: CrawlKind::Request,
            visited: vec![me.clone()],
            dfs: vec![me],
            reports,
            start_ledger: Some(start_ledger),
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind == CrawlKind::Request
    }

    /// The crawl this message belongs to. `None` without a round marker or
    /// without an initiator.
    pub fn instance(&self) -> Option<CrawlInstanceKey> {
        Some(CrawlInstanceKey {
            initiator: self.visited.first()?.clone(),
            start_ledger: self.start_ledger?,
        })
    }

    pub fn initiator(&self) -> Option<&NodeKey> {
        self.visited.first()
    }

    pub fn has_visited(&self, key: &NodeKey) -> bool {
        self.visited.contains(key)
    }

    /// Whether every node in `earlier` is also visited here.
    pub fn visited_superset_of(&self, earlier: &CrawlMessage) -> bool {
        earlier.visited.iter().all(|k| self.has_visited(k))
    }

    pub fn dfs_top(&self) -> Option<&NodeKey> {
        self.dfs.last()
    }

    pub fn with_kind(mut self, kind: CrawlKind) -> Self {
        self.kind = kind;
        self
    }

    /// Appends `key` to `visited` unless it is already there.
    pub fn visit(mut self, key: NodeKey) -> Self {
        if !self.visited.contains(&key) {
            self.visited.push(key);
        }
        self
    }

    pub fn with_report(mut self, key: NodeKey, report: PerformanceReport) -> Self {
        self.reports.insert(key, report);
        self
    }

    pub fn push_dfs(mut self, key: NodeKey) -> Self {
        self.dfs.push(key);
        self
    }

    /// Pops the top of the call chain.
    pub fn pop_dfs(mut self) -> (Self, Option<NodeKey>) {
        let top = self.dfs.pop();
        (self, top)
    }
}

/// Receipt of a request. Says nothing about the subtree's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlAck {
    /// The crawl initiator, bottom of the DFS stack.
    pub dfs_root: NodeKey,
    pub start_ledger: LedgerIndex,
}

impl CrawlAck {
    pub fn for_instance(key: &CrawlInstanceKey) -> Self {
        Self {
            dfs_root: key.initiator.clone(),
            start_ledger: key.start_ledger,
        }
    }

    pub fn instance(&self) -> CrawlInstanceKey {
        CrawlInstanceKey {
            initiator: self.dfs_root.clone(),
            start_ledger: self.start_ledger,
        }
    }
}
