//! # DFS Crawl Traversal
//!
//! Per-hop protocol logic. Every inbound request, response, ack and timer
//! fire for a crawl comes through [`CrawlTraversal::handle`], which decides
//! whether to go deeper, backtrack, or conclude.
//!
//! ## Walk
//!
//! ```text
//!   A (initiator)          B                    C
//!   visited=[A] dfs=[A]
//!   ---- REQUEST ------->  push B
//!                          visited=[A,B] dfs=[A,B]
//!                          ---- REQUEST ------> push C
//!                                               no unvisited peer: pop C
//!                          <--- RESPONSE ------ dfs=[A,B]
//!                          no unvisited peer: pop B
//!   <--- RESPONSE -------  dfs=[A]
//!   pop A, dfs empty: conclude
//! ```
//!
//! A node pushes itself when it accepts a request and pops itself right
//! before handing the walk back, so `dfs` is always exactly the open call
//! chain. A peer that does not answer in time is marked visited with no
//! report and the walk carries on as if it had responded.
//!
//! A skipped peer may still be alive and carry on its own branch of the
//! walk. Its requests can reach nodes the live branch has already passed
//! through. Such a node answers with its report straight back to the sender
//! and leaves its own state alone, so the live branch keeps going.
//!
//! ## Locking
//!
//! All state inspection and mutation for a hop happens under the
//! coordinator lock. The resulting send happens after the lock is
//! released. A timer fire and a late genuine response for the same hop
//! therefore serialize, and whichever comes second finds the hop already
//! resolved and is dropped.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::config::{CrnConfig, NeighborOrder};
use crate::crypto::keys::NodeKey;
use crate::ledger::{LedgerIndex, LedgerState};
use crate::network::overlay::{OverlayMessage, PeerDirectory, PeerInfo};
use crate::performance::recorder::PerformanceRecorder;
use crate::performance::report::PerformanceReport;
use crate::registry::EligibilityRegistry;
use crate::tally::EligibilityTally;

use super::coordinator::{CoordinatorGuard, CrawlCoordinator, CrawlStatus, TimerFired, TimerKind};
use super::eligibility::{EligibilityChecker, EligibilityMap};
use super::message::{CrawlAck, CrawlInstanceKey, CrawlKind, CrawlMessage};

// ---------------------------------------------------------------------------
// Events & Outcomes
// ---------------------------------------------------------------------------

/// Everything that can drive a crawl instance forward.
#[derive(Debug, Clone)]
pub enum CrawlEvent {
    Request(CrawlMessage),
    Response(CrawlMessage),
    Ack(CrawlAck),
    Timeout(TimerFired),
}

impl CrawlEvent {
    /// Routes a crawl message by its kind.
    pub fn from_message(message: CrawlMessage) -> Self {
        match message.kind {
            CrawlKind::Request => Self::Request(message),
            CrawlKind::Response => Self::Response(message),
        }
    }
}

/// Why an event was dropped without advancing the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    /// No round marker: peer speaks an older protocol.
    UnsupportedVersion,
    /// Structurally unusable message.
    Malformed,
    /// Response or ack for an instance we never took part in.
    UnknownInstance,
    /// Instance is past its retention window.
    Expired,
    /// Instance already reached a terminal state.
    AlreadyConcluded,
    /// We are already in the request's `visited` list.
    AlreadyVisited,
    /// Response from a hop we have already given up on.
    Obsolete,
    /// Response whose call chain does not end at us.
    NotOnTop,
    /// Timer fire for a hop that was cancelled or re-armed.
    StaleTimer,
    /// `start` called twice for the same round.
    AlreadyRunning,
}

/// What handling an event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlOutcome {
    /// Sent a request one level deeper.
    Forwarded { instance: CrawlInstanceKey, to: NodeKey },
    /// Handed the walk back to the parent.
    Backtracked { instance: CrawlInstanceKey, to: NodeKey },
    /// Crawl finished and the position was updated.
    Concluded {
        instance: CrawlInstanceKey,
        forced: bool,
        eligibility: EligibilityMap,
    },
    /// Ack timer cancelled.
    AckAccepted { instance: CrawlInstanceKey },
    Dropped(DropReason),
}

impl CrawlOutcome {
    pub fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped(_))
    }
}

/// Decision made under the lock, executed after it.
enum Step {
    Forward { to: NodeKey, message: CrawlMessage },
    Backtrack { to: NodeKey, message: CrawlMessage },
    Conclude { message: CrawlMessage },
    Drop(DropReason),
}

// ---------------------------------------------------------------------------
// Traversal
// ---------------------------------------------------------------------------

/// The DFS crawl state machine for the local node.
pub struct CrawlTraversal {
    local: NodeKey,
    neighbor_order: NeighborOrder,
    neighbor_seed: u64,
    reporting_period: LedgerIndex,
    force_conclude_margin: LedgerIndex,
    coordinator: Arc<CrawlCoordinator>,
    recorder: Arc<PerformanceRecorder>,
    checker: EligibilityChecker,
    tally: Arc<EligibilityTally>,
    peers: Arc<dyn PeerDirectory>,
    ledger: Arc<dyn LedgerState>,
}

impl CrawlTraversal {
    pub fn new(
        config: &CrnConfig,
        recorder: Arc<PerformanceRecorder>,
        coordinator: Arc<CrawlCoordinator>,
        registry: Arc<EligibilityRegistry>,
        tally: Arc<EligibilityTally>,
        ledger: Arc<dyn LedgerState>,
        peers: Arc<dyn PeerDirectory>,
    ) -> Self {
        Self {
            local: recorder.identity().public_key().clone(),
            neighbor_order: config.neighbor_order,
            neighbor_seed: config.neighbor_seed,
            reporting_period: config.reporting_period,
            force_conclude_margin: config.force_conclude_margin,
            checker: EligibilityChecker::new(registry, ledger.clone(), config),
            coordinator,
            recorder,
            tally,
            peers,
            ledger,
        }
    }

    pub fn local_key(&self) -> &NodeKey {
        &self.local
    }

    pub fn coordinator(&self) -> &CrawlCoordinator {
        &self.coordinator
    }

    /// Single dispatch point for crawl events.
    pub fn handle(&self, from: &NodeKey, event: CrawlEvent) -> CrawlOutcome {
        match event {
            CrawlEvent::Request(message) => self.evaluate_request(from, message),
            CrawlEvent::Response(message) => self.evaluate_response(from, message),
            CrawlEvent::Ack(ack) => self.evaluate_ack(from, &ack),
            CrawlEvent::Timeout(fired) => self.add_timed_out_node(fired),
        }
    }

    /// Starts a crawl for the round beginning at `start_ledger`.
    pub fn start(&self, start_ledger: LedgerIndex) -> CrawlOutcome {
        let instance = CrawlInstanceKey {
            initiator: self.local.clone(),
            start_ledger,
        };
        let message =
            CrawlMessage::begin(self.local.clone(), self.recorder.get_prepared_report(), start_ledger);
        let peers = self.ordered_peers(start_ledger);

        let step = {
            let mut guard = self.coordinator.lock();
            if !guard.start_crawl(&instance, start_ledger) {
                debug!(instance = %instance, "crawl already started");
                return CrawlOutcome::Dropped(DropReason::AlreadyRunning);
            }
            info!(instance = %instance, peers = peers.len(), "starting crawl");
            self.advance(&mut guard, &instance, message, &peers)
        };
        self.execute(instance, step)
    }

    /// A peer asks us to crawl our subtree.
    pub fn evaluate_request(&self, from: &NodeKey, message: CrawlMessage) -> CrawlOutcome {
        let instance = match instance_of(&message) {
            Ok(instance) => instance,
            Err(reason) => {
                debug!(peer = %from, ?reason, "crawl request rejected");
                return CrawlOutcome::Dropped(reason);
            }
        };

        if message.has_visited(&self.local) {
            if message.dfs_top() == Some(&self.local) {
                warn!(peer = %from, instance = %instance, "request at backtrack stage, coercing to response");
                return self.evaluate_response(from, message.with_kind(CrawlKind::Response));
            }
            warn!(peer = %from, instance = %instance, "already visited, ignoring request");
            return CrawlOutcome::Dropped(DropReason::AlreadyVisited);
        }

        let report = self.recorder.get_prepared_report();
        let peers = self.ordered_peers(instance.start_ledger);
        let current = self.current_ledger(instance.start_ledger);

        let step = {
            let mut guard = self.coordinator.lock();
            let joined_before = !guard.start_crawl(&instance, current);
            match guard.state(&instance).map(|s| s.status()) {
                None => return CrawlOutcome::Dropped(DropReason::Expired),
                Some(status) if status.is_terminal() => {
                    debug!(instance = %instance, "request for concluded crawl");
                    return CrawlOutcome::Dropped(DropReason::AlreadyConcluded);
                }
                Some(_) if joined_before => {
                    // We are on another branch of this walk. Our state
                    // belongs to that branch and stays untouched.
                    if message.dfs_top() != Some(from) {
                        warn!(peer = %from, instance = %instance, "request call chain does not end at sender");
                        return CrawlOutcome::Dropped(DropReason::Malformed);
                    }
                    debug!(peer = %from, instance = %instance, "already part of this crawl, handing request back");
                    Step::Backtrack {
                        to: from.clone(),
                        message: message
                            .visit(self.local.clone())
                            .with_report(self.local.clone(), report)
                            .with_kind(CrawlKind::Response),
                    }
                }
                Some(_) => {
                    let message = message
                        .visit(self.local.clone())
                        .with_report(self.local.clone(), report)
                        .push_dfs(self.local.clone());
                    trace!(
                        instance = %instance,
                        visited = message.visited.len(),
                        dfs = message.dfs.len(),
                        "accepted crawl request"
                    );
                    self.advance(&mut guard, &instance, message, &peers)
                }
            }
        };

        self.peers
            .send(from, OverlayMessage::CrawlAck(CrawlAck::for_instance(&instance)));
        self.execute(instance, step)
    }

    /// A peer hands the walk back after crawling its subtree.
    pub fn evaluate_response(&self, from: &NodeKey, message: CrawlMessage) -> CrawlOutcome {
        let instance = match instance_of(&message) {
            Ok(instance) => instance,
            Err(reason) => {
                debug!(peer = %from, ?reason, "crawl response rejected");
                return CrawlOutcome::Dropped(reason);
            }
        };
        let message = if message.kind != CrawlKind::Response {
            warn!(peer = %from, instance = %instance, "coercing message to response");
            message.with_kind(CrawlKind::Response)
        } else {
            message
        };
        let peers = self.ordered_peers(instance.start_ledger);

        let step = {
            let mut guard = self.coordinator.lock();
            let Some(state) = guard.state(&instance) else {
                debug!(peer = %from, instance = %instance, "response for unknown crawl");
                return CrawlOutcome::Dropped(DropReason::UnknownInstance);
            };
            if state.is_concluded() {
                debug!(peer = %from, instance = %instance, "response for concluded crawl");
                return CrawlOutcome::Dropped(DropReason::AlreadyConcluded);
            }
            let expected = state.last_recipient() == Some(from)
                && state
                    .last_message()
                    .map_or(false, |last| message.visited_superset_of(last));
            if !expected {
                debug!(peer = %from, instance = %instance, "obsolete crawl response");
                return CrawlOutcome::Dropped(DropReason::Obsolete);
            }
            if message.dfs_top() != Some(&self.local) {
                warn!(peer = %from, instance = %instance, "response call chain does not end here");
                return CrawlOutcome::Dropped(DropReason::NotOnTop);
            }
            guard.clear_pending(&instance);
            self.advance(&mut guard, &instance, message, &peers)
        };
        self.execute(instance, step)
    }

    /// Receipt confirmation. Only stops the ack timer.
    pub fn evaluate_ack(&self, from: &NodeKey, ack: &CrawlAck) -> CrawlOutcome {
        let instance = ack.instance();
        let mut guard = self.coordinator.lock();
        let Some(state) = guard.state(&instance) else {
            return CrawlOutcome::Dropped(DropReason::UnknownInstance);
        };
        if state.is_concluded() {
            return CrawlOutcome::Dropped(DropReason::AlreadyConcluded);
        }
        if state.last_recipient() != Some(from) {
            trace!(peer = %from, instance = %instance, "ack from peer we are not waiting on");
            return CrawlOutcome::Dropped(DropReason::Obsolete);
        }
        guard.cancel_timer(&instance, TimerKind::Ack);
        trace!(peer = %from, instance = %instance, "crawl ack");
        CrawlOutcome::AckAccepted { instance }
    }

    /// A hop's timer fired: treat the silent peer as visited with no
    /// report and continue from the last message we sent.
    pub fn add_timed_out_node(&self, fired: TimerFired) -> CrawlOutcome {
        let instance = fired.instance.clone();
        let peers = self.ordered_peers(instance.start_ledger);

        let step = {
            let mut guard = self.coordinator.lock();
            if !guard.timer_is_current(&fired) {
                trace!(instance = %instance, hop = fired.hop, "stale timer fire");
                return CrawlOutcome::Dropped(DropReason::StaleTimer);
            }
            let Some((timed_out, last)) = guard.take_pending(&instance) else {
                return CrawlOutcome::Dropped(DropReason::StaleTimer);
            };
            warn!(
                instance = %instance,
                peer = %timed_out,
                timer = ?fired.kind,
                hop = fired.hop,
                "crawl hop timed out, skipping peer"
            );
            let message = last.visit(timed_out).with_kind(CrawlKind::Response);
            self.advance(&mut guard, &instance, message, &peers)
        };
        self.execute(instance, step)
    }

    /// Whether a crawl we are running should be cut short at `current`.
    pub fn should_force_conclude(&self, instance: &CrawlInstanceKey, current: LedgerIndex) -> bool {
        let deadline = instance
            .start_ledger
            .saturating_add(self.reporting_period)
            .saturating_sub(self.force_conclude_margin);
        current >= deadline && self.coordinator.status(instance) == Some(CrawlStatus::Running)
    }

    /// Concludes a running crawl with whatever has been collected so far.
    pub fn force_conclude(&self, instance: &CrawlInstanceKey) -> CrawlOutcome {
        let collected = {
            let mut guard = self.coordinator.lock();
            match guard.state(instance) {
                None => return CrawlOutcome::Dropped(DropReason::UnknownInstance),
                Some(state) if state.is_concluded() => {
                    return CrawlOutcome::Dropped(DropReason::AlreadyConcluded)
                }
                Some(_) => {}
            }
            let pending = guard.take_pending(instance).map(|(_, message)| message);
            guard.conclude(instance, true);
            pending
        };
        let reports = match collected {
            Some(message) => message.reports,
            None => self.own_report_only(),
        };
        self.finish(instance.clone(), &reports, true)
    }

    /// Concludes the crawl `message` belongs to with the reports it
    /// carries. No-op for an instance that is already terminal.
    pub fn conclude(&self, message: &CrawlMessage, force: bool) -> CrawlOutcome {
        let instance = match instance_of(message) {
            Ok(instance) => instance,
            Err(reason) => return CrawlOutcome::Dropped(reason),
        };
        if !self.coordinator.conclude(&instance, force) {
            return CrawlOutcome::Dropped(DropReason::AlreadyConcluded);
        }
        self.finish(instance, &message.reports, force)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Continue the walk from `message`, which has us on top of `dfs`.
    fn advance(
        &self,
        guard: &mut CoordinatorGuard<'_>,
        instance: &CrawlInstanceKey,
        message: CrawlMessage,
        peers: &[PeerInfo],
    ) -> Step {
        match self.next_peer(&message, peers) {
            Some(next) => {
                let message = message.with_kind(CrawlKind::Request);
                guard.restart_timers(instance, &next, &message);
                Step::Forward { to: next, message }
            }
            None => self.backtrack(guard, instance, message),
        }
    }

    fn backtrack(
        &self,
        guard: &mut CoordinatorGuard<'_>,
        instance: &CrawlInstanceKey,
        message: CrawlMessage,
    ) -> Step {
        let (message, _) = message.pop_dfs();
        guard.clear_pending(instance);
        match message.dfs_top().cloned() {
            Some(parent) => {
                guard.mark_returned(instance);
                Step::Backtrack {
                    to: parent,
                    message: message.with_kind(CrawlKind::Response),
                }
            }
            None if instance.initiator == self.local => {
                if guard.conclude(instance, false) {
                    Step::Conclude { message }
                } else {
                    Step::Drop(DropReason::AlreadyConcluded)
                }
            }
            None => {
                warn!(instance = %instance, "call chain emptied at a non-initiator");
                Step::Drop(DropReason::Malformed)
            }
        }
    }

    fn execute(&self, instance: CrawlInstanceKey, step: Step) -> CrawlOutcome {
        match step {
            Step::Forward { to, message } => {
                debug!(
                    instance = %instance,
                    peer = %to,
                    visited = message.visited.len(),
                    dfs = message.dfs.len(),
                    "forwarding crawl request"
                );
                self.peers.send(&to, OverlayMessage::Crawl(message));
                CrawlOutcome::Forwarded { instance, to }
            }
            Step::Backtrack { to, message } => {
                debug!(
                    instance = %instance,
                    peer = %to,
                    visited = message.visited.len(),
                    dfs = message.dfs.len(),
                    "backtracking crawl"
                );
                self.peers.send(&to, OverlayMessage::Crawl(message));
                CrawlOutcome::Backtracked { instance, to }
            }
            Step::Conclude { message } => self.finish(instance, &message.reports, false),
            Step::Drop(reason) => CrawlOutcome::Dropped(reason),
        }
    }

    fn finish(
        &self,
        instance: CrawlInstanceKey,
        reports: &BTreeMap<NodeKey, PerformanceReport>,
        forced: bool,
    ) -> CrawlOutcome {
        let eligibility = self.checker.evaluate(reports);
        info!(
            instance = %instance,
            forced,
            reports = reports.len(),
            eligible = eligibility.values().filter(|e| **e).count(),
            "crawl finished"
        );
        self.tally
            .update_position(instance.start_ledger, eligibility.clone(), forced);
        CrawlOutcome::Concluded {
            instance,
            forced,
            eligibility,
        }
    }

    fn own_report_only(&self) -> BTreeMap<NodeKey, PerformanceReport> {
        let mut reports = BTreeMap::new();
        reports.insert(self.local.clone(), self.recorder.get_prepared_report());
        reports
    }

    fn next_peer(&self, message: &CrawlMessage, peers: &[PeerInfo]) -> Option<NodeKey> {
        peers
            .iter()
            .map(|p| &p.key)
            .find(|k| **k != self.local && !message.has_visited(k))
            .cloned()
    }

    fn ordered_peers(&self, start_ledger: LedgerIndex) -> Vec<PeerInfo> {
        let mut peers = self.peers.active_peers();
        match self.neighbor_order {
            NeighborOrder::Overlay => {}
            NeighborOrder::Sorted => peers.sort_by(|a, b| a.key.cmp(&b.key)),
            NeighborOrder::Seeded => {
                peers.sort_by(|a, b| a.key.cmp(&b.key));
                let mut rng = StdRng::seed_from_u64(self.neighbor_seed ^ u64::from(start_ledger));
                peers.shuffle(&mut rng);
            }
        }
        peers
    }

    fn current_ledger(&self, fallback: LedgerIndex) -> LedgerIndex {
        self.ledger.valid_ledger_index().unwrap_or(fallback)
    }
}

fn instance_of(message: &CrawlMessage) -> Result<CrawlInstanceKey, DropReason> {
    if message.start_ledger.is_none() {
        return Err(DropReason::UnsupportedVersion);
    }
    message.instance().ok_or(DropReason::Malformed)
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::crypto::keys::NodeKeypair;
    use crate::identity::NodeIdentity;
    use crate::ledger::InMemoryLedger;

    struct Peers {
        peers: Mutex<Vec<PeerInfo>>,
        sent: Mutex<Vec<(NodeKey, OverlayMessage)>>,
    }

    impl Peers {
        fn new(keys: &[NodeKey]) -> Arc<Self> {
            Arc::new(Self {
                peers: Mutex::new(keys.iter().cloned().map(PeerInfo::new).collect()),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn take_sent(&self) -> Vec<(NodeKey, OverlayMessage)> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl PeerDirectory for Peers {
        fn active_peers(&self) -> Vec<PeerInfo> {
            self.peers.lock().clone()
        }
        fn sane_peers(&self) -> Vec<PeerInfo> {
            self.active_peers()
        }
        fn send(&self, peer: &NodeKey, message: OverlayMessage) {
            self.sent.lock().push((peer.clone(), message));
        }
    }

    struct Harness {
        traversal: CrawlTraversal,
        peers: Arc<Peers>,
        tally: Arc<EligibilityTally>,
        me: NodeKey,
    }

    fn identity(seed: u8) -> NodeIdentity {
        NodeIdentity::create(&NodeKeypair::from_seed(&[seed; 32]), "relay.example.com")
    }

    fn harness(seed: u8, neighbors: &[NodeKey], config: CrnConfig) -> Harness {
        let id = identity(seed);
        let me = id.public_key().clone();
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.set_validated(256);
        let registry = Arc::new(EligibilityRegistry::from_entries(&[me.to_string()]).unwrap());
        let recorder = Arc::new(PerformanceRecorder::new(id, ledger.clone(), 0));
        let coordinator = Arc::new(CrawlCoordinator::new(&config));
        let tally = Arc::new(EligibilityTally::new(&config, registry.clone()));
        let peers = Peers::new(neighbors);
        let traversal = CrawlTraversal::new(
            &config,
            recorder,
            coordinator,
            registry,
            tally.clone(),
            ledger,
            peers.clone(),
        );
        Harness {
            traversal,
            peers,
            tally,
            me,
        }
    }

    fn key(s: &str) -> NodeKey {
        NodeKey::parse(s).unwrap()
    }

    fn crawl_of(sent: &(NodeKey, OverlayMessage)) -> CrawlMessage {
        match &sent.1 {
            OverlayMessage::Crawl(m) => m.clone(),
            other => panic!("expected crawl message, got {:?}", other),
        }
    }

    #[test]
    fn lonely_node_concludes_immediately() {
        let h = harness(1, &[], CrnConfig::default());
        let outcome = h.traversal.start(256);
        match outcome {
            CrawlOutcome::Concluded {
                forced, eligibility, ..
            } => {
                assert!(!forced);
                assert_eq!(eligibility.len(), 1);
                assert!(eligibility.contains_key(&h.me));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(h.tally.position().is_some());
    }

    #[test]
    fn start_twice_is_noop() {
        let h = harness(1, &[key("bb")], CrnConfig::default());
        assert!(matches!(h.traversal.start(256), CrawlOutcome::Forwarded { .. }));
        assert_eq!(
            h.traversal.start(256),
            CrawlOutcome::Dropped(DropReason::AlreadyRunning)
        );
    }

    #[test]
    fn request_without_round_marker_is_rejected() {
        let h = harness(1, &[key("bb")], CrnConfig::default());
        let mut msg = CrawlMessage::begin(key("bb"), h.traversal.recorder.get_prepared_report(), 256);
        msg.start_ledger = None;
        assert_eq!(
            h.traversal.handle(&key("bb"), CrawlEvent::from_message(msg)),
            CrawlOutcome::Dropped(DropReason::UnsupportedVersion)
        );
        assert!(h.peers.take_sent().is_empty());
    }

    #[test]
    fn leaf_acks_and_replies_to_parent() {
        let h = harness(1, &[key("bb")], CrnConfig::default());
        let parent_report = h.traversal.recorder.get_prepared_report();
        let msg = CrawlMessage::begin(key("bb"), parent_report, 256);
        let outcome = h.traversal.handle(&key("bb"), CrawlEvent::from_message(msg));
        assert!(matches!(outcome, CrawlOutcome::Backtracked { ref to, .. } if *to == key("bb")));

        let sent = h.peers.take_sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0].1, OverlayMessage::CrawlAck(_)));
        let reply = crawl_of(&sent[1]);
        assert_eq!(reply.kind, CrawlKind::Response);
        assert_eq!(reply.dfs, vec![key("bb")]);
        assert_eq!(reply.visited, vec![key("bb"), h.me.clone()]);
        assert!(reply.reports.contains_key(&h.me));

        let instance = reply.instance().unwrap();
        assert_eq!(h.traversal.coordinator.status(&instance), Some(CrawlStatus::Returned));
    }

    #[test]
    fn request_from_another_branch_is_handed_back() {
        let h = harness(1, &[key("bb"), key("cc")], CrnConfig::default());
        let report = h.traversal.recorder.get_prepared_report();
        let live = CrawlMessage::begin(key("bb"), report.clone(), 256);
        let outcome = h.traversal.evaluate_request(&key("bb"), live);
        assert!(matches!(outcome, CrawlOutcome::Forwarded { ref to, .. } if *to == key("cc")));
        h.peers.take_sent();

        // bb gave up on a peer that kept crawling on its own.
        let stray = CrawlMessage::begin(key("bb"), report, 256)
            .visit(key("dd"))
            .push_dfs(key("dd"));
        let instance = stray.instance().unwrap();
        let outcome = h.traversal.evaluate_request(&key("dd"), stray);
        assert!(matches!(outcome, CrawlOutcome::Backtracked { ref to, .. } if *to == key("dd")));

        let sent = h.peers.take_sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0].1, OverlayMessage::CrawlAck(_)));
        let reply = crawl_of(&sent[1]);
        assert_eq!(reply.kind, CrawlKind::Response);
        assert_eq!(reply.dfs, vec![key("bb"), key("dd")]);
        assert!(reply.has_visited(&h.me));
        assert!(reply.reports.contains_key(&h.me));

        let guard = h.traversal.coordinator.lock();
        let state = guard.state(&instance).unwrap();
        assert_eq!(state.status(), CrawlStatus::Running);
        assert_eq!(state.last_recipient(), Some(&key("cc")));
        assert_eq!(state.hop(), 1);
    }

    #[test]
    fn already_visited_request_is_ignored() {
        let h = harness(1, &[key("bb")], CrnConfig::default());
        let report = h.traversal.recorder.get_prepared_report();
        let msg = CrawlMessage::begin(key("bb"), report, 256)
            .visit(h.me.clone())
            .push_dfs(key("cc"));
        assert_eq!(
            h.traversal.evaluate_request(&key("cc"), msg),
            CrawlOutcome::Dropped(DropReason::AlreadyVisited)
        );
    }

    #[test]
    fn ack_cancels_only_ack_timer() {
        let h = harness(1, &[key("bb")], CrnConfig::default());
        let CrawlOutcome::Forwarded { instance, .. } = h.traversal.start(256) else {
            panic!("expected forward");
        };
        let ack = CrawlAck::for_instance(&instance);
        assert_eq!(
            h.traversal.handle(&key("bb"), CrawlEvent::Ack(ack.clone())),
            CrawlOutcome::AckAccepted {
                instance: instance.clone()
            }
        );
        let guard = h.traversal.coordinator().lock();
        let state = guard.state(&instance).unwrap();
        assert_eq!(state.armed_hop(TimerKind::Ack), None);
        assert_eq!(state.armed_hop(TimerKind::Response), Some(1));
        drop(guard);

        // An ack from somebody else changes nothing.
        assert_eq!(
            h.traversal.evaluate_ack(&key("cc"), &ack),
            CrawlOutcome::Dropped(DropReason::Obsolete)
        );
    }

    #[test]
    fn timeout_then_late_response_is_dropped() {
        let h = harness(1, &[key("bb")], CrnConfig::default());
        let CrawlOutcome::Forwarded { instance, .. } = h.traversal.start(256) else {
            panic!("expected forward");
        };
        let request = crawl_of(&h.peers.take_sent()[0]);

        let fired = TimerFired {
            instance: instance.clone(),
            kind: TimerKind::Response,
            hop: 1,
        };
        match h.traversal.handle(&key("bb"), CrawlEvent::Timeout(fired.clone())) {
            CrawlOutcome::Concluded { eligibility, .. } => {
                assert!(!eligibility.contains_key(&key("bb")));
            }
            other => panic!("unexpected {:?}", other),
        }

        // Same fire again, and the peer's belated answer, are both no-ops.
        assert_eq!(
            h.traversal.add_timed_out_node(fired),
            CrawlOutcome::Dropped(DropReason::StaleTimer)
        );
        let late = request
            .visit(key("bb"))
            .with_kind(CrawlKind::Response);
        assert_eq!(
            h.traversal.evaluate_response(&key("bb"), late),
            CrawlOutcome::Dropped(DropReason::AlreadyConcluded)
        );
    }

    #[test]
    fn response_from_wrong_peer_is_obsolete() {
        let h = harness(1, &[key("bb"), key("cc")], CrnConfig::default());
        let CrawlOutcome::Forwarded { to, .. } = h.traversal.start(256) else {
            panic!("expected forward");
        };
        assert_eq!(to, key("bb"));
        let request = crawl_of(&h.peers.take_sent()[0]);
        let bogus = request.visit(key("cc")).with_kind(CrawlKind::Response);
        assert_eq!(
            h.traversal.evaluate_response(&key("cc"), bogus),
            CrawlOutcome::Dropped(DropReason::Obsolete)
        );
    }

    #[test]
    fn force_conclude_uses_collected_reports() {
        let config = CrnConfig {
            reporting_period: 256,
            force_conclude_margin: 16,
            ..CrnConfig::default()
        };
        let h = harness(1, &[key("bb")], config);
        let CrawlOutcome::Forwarded { instance, .. } = h.traversal.start(256) else {
            panic!("expected forward");
        };
        assert!(!h.traversal.should_force_conclude(&instance, 495));
        assert!(h.traversal.should_force_conclude(&instance, 496));

        match h.traversal.force_conclude(&instance) {
            CrawlOutcome::Concluded { forced, eligibility, .. } => {
                assert!(forced);
                assert_eq!(eligibility.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!h.traversal.should_force_conclude(&instance, 500));
        assert_eq!(
            h.traversal.force_conclude(&instance),
            CrawlOutcome::Dropped(DropReason::AlreadyConcluded)
        );
        assert!(h.tally.position().unwrap().partial);
    }

    #[test]
    fn sorted_order_picks_smallest_key() {
        let config = CrnConfig {
            neighbor_order: NeighborOrder::Sorted,
            ..CrnConfig::default()
        };
        let h = harness(1, &[key("ff"), key("cc"), key("ee")], config);
        let CrawlOutcome::Forwarded { to, .. } = h.traversal.start(256) else {
            panic!("expected forward");
        };
        assert_eq!(to, key("cc"));
    }

    #[test]
    fn seeded_order_is_reproducible() {
        let config = CrnConfig {
            neighbor_order: NeighborOrder::Seeded,
            neighbor_seed: 42,
            ..CrnConfig::default()
        };
        let neighbors: Vec<NodeKey> = (0..8).map(|i| key(&format!("n{}", i))).collect();
        let a = harness(1, &neighbors, config.clone());
        let b = harness(1, &neighbors, config);
        assert_eq!(a.traversal.ordered_peers(256), b.traversal.ordered_peers(256));
    }
}
