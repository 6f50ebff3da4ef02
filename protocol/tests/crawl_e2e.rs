//! End-to-end crawl tests over an in-memory overlay.
//!
//! Every node gets its own `PeerDirectory` view onto a shared wire queue.
//! `Cluster::run` delivers queued messages one at a time until the wire is
//! quiet, so a whole DFS walk plays out deterministically on one thread.
//! Timers are never spawned here; tests fire them by hand.
//!
//! Every crawl message that crosses the wire is checked for a well-formed
//! call chain, so each scenario also covers the payload shape hop by hop.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crn_protocol::config::CrnConfig;
use crn_protocol::crawl::{CrawlInstanceKey, CrawlKind, CrawlMessage, CrawlOutcome, CrawlStatus, TimerFired, TimerKind};
use crn_protocol::crypto::keys::{NodeKey, NodeKeypair};
use crn_protocol::identity::NodeIdentity;
use crn_protocol::ledger::InMemoryLedger;
use crn_protocol::network::{NodeEvent, OverlayMessage, PeerDirectory, PeerInfo, RelayNode};

const START: u32 = 256;

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

type Envelope = (NodeKey, NodeKey, OverlayMessage);

#[derive(Default)]
struct Wire {
    queue: Mutex<VecDeque<Envelope>>,
    offline: Mutex<HashSet<NodeKey>>,
}

/// One node's view of the overlay.
struct LinkedPeers {
    local: NodeKey,
    neighbors: Vec<NodeKey>,
    wire: Arc<Wire>,
}

impl PeerDirectory for LinkedPeers {
    fn active_peers(&self) -> Vec<PeerInfo> {
        self.neighbors
            .iter()
            .map(|k| PeerInfo::new(k.clone()).with_latency(Duration::from_millis(20)))
            .collect()
    }

    fn sane_peers(&self) -> Vec<PeerInfo> {
        self.active_peers()
    }

    fn send(&self, peer: &NodeKey, message: OverlayMessage) {
        self.wire
            .queue
            .lock()
            .push_back((self.local.clone(), peer.clone(), message));
    }
}

struct Cluster {
    keys: Vec<NodeKey>,
    nodes: BTreeMap<NodeKey, RelayNode>,
    wire: Arc<Wire>,
}

impl Cluster {
    /// Builds `n` funded, trusted nodes; `links` are undirected edges by index.
    fn new(n: usize, links: &[(usize, usize)]) -> Self {
        let keypairs: Vec<NodeKeypair> = (0..n)
            .map(|i| NodeKeypair::from_seed(&[i as u8 + 1; 32]))
            .collect();
        let keys: Vec<NodeKey> = keypairs.iter().map(|kp| kp.node_key()).collect();

        let ledger = Arc::new(InMemoryLedger::new());
        ledger.set_validated(START);
        let config = CrnConfig {
            activation_reserve: 1_000,
            fee_distribution: 300,
            trusted_keys: keys.iter().map(|k| k.to_string()).collect(),
            ..CrnConfig::default()
        };

        let wire = Arc::new(Wire::default());
        let mut nodes = BTreeMap::new();
        for (i, kp) in keypairs.iter().enumerate() {
            let identity = NodeIdentity::create(kp, &format!("node{i}.example.com"));
            ledger.fund(identity.account_id(), 5_000);
            let neighbors = links
                .iter()
                .filter_map(|&(a, b)| match (a == i, b == i) {
                    (true, _) => Some(keys[b].clone()),
                    (_, true) => Some(keys[a].clone()),
                    _ => None,
                })
                .collect();
            let peers = Arc::new(LinkedPeers {
                local: keys[i].clone(),
                neighbors,
                wire: wire.clone(),
            });
            let node = RelayNode::new(identity, config.clone(), ledger.clone(), peers.clone(), None)
                .expect("node");
            node.recorder().prepare_report(START, peers.as_ref());
            nodes.insert(keys[i].clone(), node);
        }
        Self { keys, nodes, wire }
    }

    fn node(&self, i: usize) -> &RelayNode {
        &self.nodes[&self.keys[i]]
    }

    fn take_offline(&self, i: usize) {
        self.wire.offline.lock().insert(self.keys[i].clone());
    }

    /// Delivers queued messages until the wire is empty.
    fn run(&self) -> Vec<(NodeKey, NodeEvent)> {
        let mut events = Vec::new();
        loop {
            let next = self.wire.queue.lock().pop_front();
            let Some((from, to, message)) = next else {
                break;
            };
            let dfs = match &message {
                OverlayMessage::Crawl(crawl) => {
                    assert_well_formed(&from, &to, crawl);
                    Some(crawl.dfs.clone())
                }
                _ => None,
            };
            if self.wire.offline.lock().contains(&to) {
                continue;
            }
            let event = self.nodes[&to].on_message(&from, message);
            if let NodeEvent::Crawl(CrawlOutcome::Concluded { forced: false, .. }) = &event {
                // Only the initiator's own frame may be left to pop.
                assert_eq!(dfs.as_deref(), Some(std::slice::from_ref(&to)));
            }
            events.push((to, event));
        }
        events
    }
}

/// Each hop moves the call chain by exactly one frame: a request carries its
/// sender on top, a response has already popped its sender.
fn assert_well_formed(from: &NodeKey, to: &NodeKey, message: &CrawlMessage) {
    let mut visited = HashSet::new();
    for key in &message.visited {
        assert!(visited.insert(key), "{key} visited twice");
    }
    let mut open = HashSet::new();
    for key in &message.dfs {
        assert!(open.insert(key), "{key} twice on the call chain");
        assert!(visited.contains(key), "{key} on the call chain but never visited");
    }
    match message.kind {
        CrawlKind::Request => {
            assert_eq!(message.dfs.last(), Some(from), "request from {from} without its frame");
        }
        CrawlKind::Response => {
            assert_eq!(message.dfs.last(), Some(to), "response to {to} not on top");
            assert!(!open.contains(from), "response from {from} still holds its frame");
        }
    }
}

fn concluded(events: &[(NodeKey, NodeEvent)]) -> Vec<&CrawlOutcome> {
    events
        .iter()
        .filter_map(|(_, e)| match e {
            NodeEvent::Crawl(outcome @ CrawlOutcome::Concluded { .. }) => Some(outcome),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn line_of_three_collects_every_report() {
    let cluster = Cluster::new(3, &[(0, 1), (1, 2)]);
    let a = cluster.node(0);

    let started = cluster.node(0).traversal().start(START);
    assert!(matches!(started, CrawlOutcome::Forwarded { ref to, .. } if *to == cluster.keys[1]));
    let events = cluster.run();

    let done = concluded(&events);
    assert_eq!(done.len(), 1);
    let CrawlOutcome::Concluded { forced, eligibility, .. } = done[0] else {
        unreachable!()
    };
    assert!(!forced);
    assert_eq!(eligibility.len(), 3);
    assert!(eligibility.values().all(|e| *e));

    let position = a.tally().position().expect("position");
    assert_eq!(position.start_ledger, START);
    assert!(!position.partial);

    let instance = crawl_from_first(&cluster);
    assert_eq!(a.coordinator().status(&instance), Some(CrawlStatus::Concluded));
    for i in [1, 2] {
        assert_eq!(
            cluster.node(i).coordinator().status(&instance),
            Some(CrawlStatus::Returned)
        );
    }
}

fn crawl_from_first(cluster: &Cluster) -> CrawlInstanceKey {
    CrawlInstanceKey {
        initiator: cluster.keys[0].clone(),
        start_ledger: START,
    }
}

#[test]
fn abandoned_branch_does_not_evict_live_nodes() {
    // Square: A-B, A-C, B-D, D-C. A gives up on B before B even sees the
    // request, so B and C both end up walking towards D.
    let cluster = Cluster::new(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
    let a = cluster.node(0);

    let CrawlOutcome::Forwarded { instance, to } = a.traversal().start(START) else {
        panic!("expected forward")
    };
    assert_eq!(to, cluster.keys[1]);
    let hop = a
        .coordinator()
        .lock()
        .state(&instance)
        .and_then(|s| s.armed_hop(TimerKind::Ack))
        .expect("ack timer");
    let outcome = a.on_timer(TimerFired {
        instance: instance.clone(),
        kind: TimerKind::Ack,
        hop,
    });
    assert!(matches!(outcome, CrawlOutcome::Forwarded { ref to, .. } if *to == cluster.keys[2]));

    let events = cluster.run();
    let done = concluded(&events);
    assert_eq!(done.len(), 1);
    let CrawlOutcome::Concluded { forced, eligibility, .. } = done[0] else {
        unreachable!()
    };
    assert!(!forced);
    let reached: HashSet<_> = eligibility.keys().cloned().collect();
    let expected: HashSet<_> = [0, 2, 3].iter().map(|&i| cluster.keys[i].clone()).collect();
    assert_eq!(reached, expected);

    assert_eq!(a.coordinator().status(&instance), Some(CrawlStatus::Concluded));
    for i in 1..4 {
        assert_eq!(
            cluster.node(i).coordinator().status(&instance),
            Some(CrawlStatus::Returned)
        );
    }
}

#[test]
fn acks_clear_the_ack_timer() {
    let cluster = Cluster::new(2, &[(0, 1)]);
    cluster.node(0).traversal().start(START);

    // Deliver only the request; B's ack lands back on the wire.
    let (from, to, message) = cluster.wire.queue.lock().pop_front().expect("request");
    cluster.nodes[&to].on_message(&from, message);
    let (from, to, ack) = cluster.wire.queue.lock().pop_front().expect("ack");
    assert!(matches!(ack, OverlayMessage::CrawlAck(_)));

    let event = cluster.nodes[&to].on_message(&from, ack);
    assert!(matches!(event, NodeEvent::Crawl(CrawlOutcome::AckAccepted { .. })));
}

#[test]
fn silent_peer_is_skipped_after_timeout() {
    // Triangle: A-B, A-C, B-C. B never answers.
    let cluster = Cluster::new(3, &[(0, 1), (0, 2), (1, 2)]);
    cluster.take_offline(1);
    let a = cluster.node(0);

    let first = a.traversal().start(START);
    let CrawlOutcome::Forwarded { instance, to } = first else {
        panic!("expected forward")
    };
    assert!(cluster.run().is_empty());

    let hop = a
        .coordinator()
        .lock()
        .state(&instance)
        .and_then(|s| s.armed_hop(TimerKind::Response))
        .expect("response timer");
    let outcome = a.on_timer(TimerFired {
        instance: instance.clone(),
        kind: TimerKind::Response,
        hop,
    });

    // Overlay order: B is A's first neighbor.
    assert_eq!(to, cluster.keys[1]);
    assert!(matches!(outcome, CrawlOutcome::Forwarded { ref to, .. } if *to == cluster.keys[2]));
    let events = cluster.run();

    let done = concluded(&events);
    assert_eq!(done.len(), 1);
    let CrawlOutcome::Concluded { eligibility, .. } = done[0] else {
        unreachable!()
    };
    assert!(eligibility.contains_key(&cluster.keys[0]));
    assert!(eligibility.contains_key(&cluster.keys[2]));
    assert!(!eligibility.contains_key(&cluster.keys[1]));
    assert_eq!(a.coordinator().status(&instance), Some(CrawlStatus::Concluded));
}

#[test]
fn stale_timer_after_response_is_dropped() {
    let cluster = Cluster::new(2, &[(0, 1)]);
    let a = cluster.node(0);
    let CrawlOutcome::Forwarded { instance, .. } = a.traversal().start(START) else {
        panic!("expected forward")
    };
    let hop = a
        .coordinator()
        .lock()
        .state(&instance)
        .and_then(|s| s.armed_hop(TimerKind::Response))
        .expect("response timer");

    cluster.run();
    assert!(a.coordinator().is_concluded(&instance));

    let late = a.on_timer(TimerFired {
        instance,
        kind: TimerKind::Response,
        hop,
    });
    assert!(late.is_dropped());
}

#[test]
fn boundary_ledger_gossips_reports_and_crawls() {
    let cluster = Cluster::new(3, &[(0, 1), (1, 2)]);
    let outcomes = cluster.node(1).on_validated_ledger(START);
    assert_eq!(outcomes.len(), 1);

    let events = cluster.run();
    let stored = events
        .iter()
        .filter(|(_, e)| *e == NodeEvent::ReportState(true))
        .count();
    assert_eq!(stored, 2);
    assert!(cluster.node(0).recorder().peer_report(&cluster.keys[1]).is_some());
    assert!(cluster.node(2).recorder().peer_report(&cluster.keys[1]).is_some());

    assert_eq!(concluded(&events).len(), 1);
    assert_eq!(cluster.node(1).tally().position().unwrap().eligibility.len(), 3);
}

#[test]
fn two_initiators_crawl_independently() {
    let cluster = Cluster::new(3, &[(0, 1), (1, 2), (0, 2)]);
    cluster.node(0).traversal().start(START);
    cluster.node(2).traversal().start(START);
    let events = cluster.run();

    assert_eq!(concluded(&events).len(), 2);
    for i in [0, 2] {
        let position = cluster.node(i).tally().position().expect("position");
        assert_eq!(position.eligibility.len(), 3);
    }
    assert!(cluster.node(1).tally().position().is_none());
}

#[test]
fn positions_feed_a_vote() {
    let cluster = Cluster::new(3, &[(0, 1), (1, 2)]);
    for i in 0..3 {
        cluster.node(i).traversal().start(START);
        cluster.run();
    }
    let positions: Vec<_> = (0..3)
        .filter_map(|i| cluster.node(i).validator_position())
        .collect();
    assert_eq!(positions.len(), 3);

    let round = cluster.node(0).do_voting(&positions);
    assert_eq!(round.trusted_validations, 3);
    assert_eq!(round.eligible_count(), 3);
    assert_eq!(round.share, 100);
    assert_eq!(round.remainder, 0);
}
