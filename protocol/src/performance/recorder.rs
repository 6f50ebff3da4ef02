//! # Performance Recorder
//!
//! Owns this node's status accounting and turns it into a
//! [`PerformanceReport`] at every reporting boundary.
//!
//! Each report covers only the period since the previous one: counters are
//! diffed against a baseline snapshot, and the baseline then moves forward.
//! The prepared report is what crawl hops embed until the next boundary.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::UNKNOWN_LATENCY_MS;
use crate::crypto::keys::NodeKey;
use crate::identity::NodeIdentity;
use crate::ledger::{LedgerIndex, LedgerState};
use crate::network::overlay::{OverlayMessage, PeerDirectory};

use super::accounting::{AccountingSnapshot, OperatingMode, StatusAccounting};
use super::report::{ModeStatus, PerformanceReport};

struct RecorderState {
    baseline: AccountingSnapshot,
    baseline_seq: LedgerIndex,
    prepared: PerformanceReport,
}

/// Status accounting plus report assembly for the local relay node.
pub struct PerformanceRecorder {
    identity: NodeIdentity,
    ledger: Arc<dyn LedgerState>,
    activation_reserve: u64,
    accounting: StatusAccounting,
    state: Mutex<RecorderState>,
    /// Latest gossip report per peer.
    peer_reports: DashMap<NodeKey, PerformanceReport>,
}

impl PerformanceRecorder {
    /// Creates a recorder. Until the first boundary the prepared report
    /// covers an empty ledger range with unknown latency.
    pub fn new(identity: NodeIdentity, ledger: Arc<dyn LedgerState>, activation_reserve: u64) -> Self {
        let accounting = StatusAccounting::new();
        let baseline = accounting.snapshot();
        let baseline_seq = ledger.valid_ledger_index().unwrap_or(0);
        let prepared = build_report(
            &identity,
            &baseline,
            &AccountingSnapshot {
                current: baseline.current,
                counters: Default::default(),
            },
            baseline_seq,
            baseline_seq,
            UNKNOWN_LATENCY_MS,
            false,
        );
        Self {
            identity,
            ledger,
            activation_reserve,
            accounting,
            state: Mutex::new(RecorderState {
                baseline,
                baseline_seq,
                prepared,
            }),
            peer_reports: DashMap::new(),
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Records an operating-mode change.
    pub fn mode(&self, new: OperatingMode) {
        self.accounting.mode(new);
    }

    pub fn current_mode(&self) -> OperatingMode {
        self.accounting.current()
    }

    /// Direct access to the accounting, for callers that need snapshots.
    pub fn accounting(&self) -> &StatusAccounting {
        &self.accounting
    }

    /// Builds the report for the period ending at `ledger_seq_end`, rebases
    /// the delta baseline, and stores the result as the prepared report.
    pub fn prepare_report(&self, ledger_seq_end: LedgerIndex, peers: &dyn PeerDirectory) -> PerformanceReport {
        let latency_ms = min_latency_ms(peers);
        let activated = self.identity.activated(self.ledger.as_ref(), self.activation_reserve);
        let now = self.accounting.snapshot();

        let mut state = self.state.lock();
        let report = build_report(
            &self.identity,
            &now,
            &state.baseline,
            state.baseline_seq,
            ledger_seq_end,
            latency_ms,
            activated,
        );
        state.baseline = now;
        state.baseline_seq = ledger_seq_end;
        state.prepared = report.clone();
        drop(state);

        info!(
            seq_begin = report.ledger_seq_begin,
            seq_end = report.ledger_seq_end,
            latency_ms = report.latency_ms,
            activated = report.activated,
            mode = ?report.current_mode,
            "performance report prepared"
        );
        report
    }

    /// The report embedded in crawl messages until the next boundary.
    pub fn get_prepared_report(&self) -> PerformanceReport {
        self.state.lock().prepared.clone()
    }

    /// Gossips the redacted prepared report to every active peer. Returns
    /// the number of peers it was sent to.
    pub fn broadcast(&self, peers: &dyn PeerDirectory) -> usize {
        let gossip = self.get_prepared_report().redacted();
        let targets = peers.active_peers();
        for peer in &targets {
            peers.send(&peer.key, OverlayMessage::ReportState(gossip.clone()));
        }
        debug!(peers = targets.len(), "report state broadcast");
        targets.len()
    }

    /// Stores a peer's gossip report. Returns whether it was kept.
    pub fn on_report_state(&self, from: &NodeKey, report: PerformanceReport) -> bool {
        if &report.pubkey == self.identity.public_key() {
            debug!("ignoring gossip report about ourselves");
            return false;
        }
        if &report.pubkey != from {
            warn!(peer = %from, claimed = %report.pubkey, "report state public key mismatch");
            return false;
        }
        if let Some(existing) = self.peer_reports.get(from) {
            if existing.ledger_seq_end >= report.ledger_seq_end {
                return false;
            }
        }
        self.peer_reports.insert(from.clone(), report);
        true
    }

    /// Latest gossip report from `peer`.
    pub fn peer_report(&self, peer: &NodeKey) -> Option<PerformanceReport> {
        self.peer_reports.get(peer).map(|r| r.value().clone())
    }

    pub fn peer_report_count(&self) -> usize {
        self.peer_reports.len()
    }
}

fn min_latency_ms(peers: &dyn PeerDirectory) -> u32 {
    peers
        .sane_peers()
        .iter()
        .filter_map(|p| p.latency)
        .min()
        .map(|d| u32::try_from(d.as_millis()).unwrap_or(UNKNOWN_LATENCY_MS))
        .unwrap_or(UNKNOWN_LATENCY_MS)
}

fn build_report(
    identity: &NodeIdentity,
    now: &AccountingSnapshot,
    baseline: &AccountingSnapshot,
    ledger_seq_begin: LedgerIndex,
    ledger_seq_end: LedgerIndex,
    latency_ms: u32,
    activated: bool,
) -> PerformanceReport {
    let delta = now.delta_since(baseline);
    let status = OperatingMode::ALL
        .iter()
        .map(|mode| ModeStatus::from_counters(*mode, delta[mode.index()]))
        .collect();
    PerformanceReport {
        current_mode: now.current,
        ledger_seq_begin,
        ledger_seq_end,
        status,
        pubkey: identity.public_key().clone(),
        domain: identity.domain().to_string(),
        latency_ms,
        activated,
        signature: Some(identity.domain_signature().to_string()),
    }
}
