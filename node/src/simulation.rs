//! # In-Process Network Simulation
//!
//! Runs `n` relay nodes in one process, wired together over tokio
//! channels. Every node's overlay sends land on one shared wire channel;
//! every node's crawl timers are forwarded onto one shared timer channel.
//! A single driver task validates ledgers one by one and, between ledgers,
//! delivers wire traffic and timer fires for a fixed wall-clock window.
//!
//! Offline nodes are built but never driven: anything sent to them is
//! discarded, so crawls have to time out around them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

use crn_protocol::config::CrnConfig;
use crn_protocol::crawl::TimerFired;
use crn_protocol::crypto::keys::{NodeKey, NodeKeypair};
use crn_protocol::identity::NodeIdentity;
use crn_protocol::ledger::{InMemoryLedger, LedgerIndex};
use crn_protocol::network::{NodeEvent, OverlayMessage, PeerDirectory, PeerInfo, RelayNode};
use crn_protocol::performance::OperatingMode;
use crn_protocol::tally::FinalizedRound;

use crate::cli::Topology;
use crate::metrics::NodeMetrics;

type Envelope = (NodeKey, NodeKey, OverlayMessage);

const FUNDING: u64 = 10_000_000;
const SIMULATED_LATENCY: Duration = Duration::from_millis(25);

/// Parameters for one simulation run.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub nodes: usize,
    pub topology: Topology,
    pub offline: usize,
    pub ledgers: LedgerIndex,
    pub period: LedgerIndex,
    pub ledger_interval: Duration,
}

/// Printed at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationSummary {
    pub nodes: usize,
    pub offline: usize,
    pub ledgers: LedgerIndex,
    /// Online nodes holding a position at the end.
    pub positions: usize,
    /// Vote over all positions, run from the first node.
    pub round: Option<FinalizedRound>,
}

// ---------------------------------------------------------------------------
// Overlay
// ---------------------------------------------------------------------------

/// One node's view onto the shared wire.
struct ChannelPeers {
    local: NodeKey,
    neighbors: Vec<NodeKey>,
    wire: UnboundedSender<Envelope>,
}

impl PeerDirectory for ChannelPeers {
    fn active_peers(&self) -> Vec<PeerInfo> {
        self.neighbors
            .iter()
            .map(|k| PeerInfo::new(k.clone()).with_latency(SIMULATED_LATENCY))
            .collect()
    }

    fn sane_peers(&self) -> Vec<PeerInfo> {
        self.active_peers()
    }

    fn send(&self, peer: &NodeKey, message: OverlayMessage) {
        // Receiver gone means the run is over.
        let _ = self.wire.send((self.local.clone(), peer.clone(), message));
    }
}

/// Undirected edges by node index.
fn links(topology: Topology, n: usize) -> Vec<(usize, usize)> {
    match topology {
        Topology::Line => (1..n).map(|i| (i - 1, i)).collect(),
        Topology::Ring if n > 2 => (0..n).map(|i| (i, (i + 1) % n)).collect(),
        Topology::Ring => links(Topology::Line, n),
        Topology::Mesh => (0..n)
            .flat_map(|a| (a + 1..n).map(move |b| (a, b)))
            .collect(),
    }
}

fn neighbors_of(i: usize, links: &[(usize, usize)], keys: &[NodeKey]) -> Vec<NodeKey> {
    links
        .iter()
        .filter_map(|&(a, b)| {
            if a == i {
                Some(keys[b].clone())
            } else if b == i {
                Some(keys[a].clone())
            } else {
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

pub struct Simulation {
    config: SimulationConfig,
    ledger: Arc<InMemoryLedger>,
    nodes: HashMap<NodeKey, RelayNode>,
    online: Vec<NodeKey>,
    wire_rx: UnboundedReceiver<Envelope>,
    timer_rx: UnboundedReceiver<(NodeKey, TimerFired)>,
    metrics: NodeMetrics,
}

impl Simulation {
    /// Builds the network. Must be called inside a tokio runtime; timer
    /// forwarding runs as spawned tasks.
    pub fn new(config: SimulationConfig, metrics: NodeMetrics) -> Result<Self> {
        anyhow::ensure!(config.nodes > 0, "at least one node is required");
        anyhow::ensure!(
            config.offline < config.nodes,
            "at least one node must stay online"
        );
        anyhow::ensure!(config.period > 0, "reporting period must be positive");

        let keypairs: Vec<NodeKeypair> = (0..config.nodes)
            .map(|i| {
                let mut seed = [0u8; 32];
                seed[..8].copy_from_slice(&(i as u64 + 1).to_le_bytes());
                NodeKeypair::from_seed(&seed)
            })
            .collect();
        let keys: Vec<NodeKey> = keypairs.iter().map(|kp| kp.node_key()).collect();
        let edges = links(config.topology, config.nodes);

        let crn = CrnConfig {
            reporting_period: config.period,
            force_conclude_margin: (config.period / 4).max(1).min(config.period - 1),
            ack_timeout_ms: 50,
            crawl_budget_ms: 400,
            fee_distribution: 1_000,
            trusted_keys: keys.iter().map(|k| k.to_string()).collect(),
            ..CrnConfig::default()
        };

        let ledger = Arc::new(InMemoryLedger::new());
        let (wire_tx, wire_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let mut nodes = HashMap::with_capacity(config.nodes);

        for (i, kp) in keypairs.iter().enumerate() {
            let identity = NodeIdentity::create(kp, &format!("relay{i}.sim.local"));
            ledger.fund(identity.account_id(), FUNDING);

            let peers = Arc::new(ChannelPeers {
                local: keys[i].clone(),
                neighbors: neighbors_of(i, &edges, &keys),
                wire: wire_tx.clone(),
            });
            let (node_timer_tx, mut node_timer_rx) = mpsc::unbounded_channel::<TimerFired>();
            let node = RelayNode::new(identity, crn.clone(), ledger.clone(), peers, Some(node_timer_tx))
                .with_context(|| format!("failed to build node {i}"))?;
            node.set_mode(OperatingMode::Validating);

            let key = keys[i].clone();
            let shared = timer_tx.clone();
            tokio::spawn(async move {
                while let Some(fired) = node_timer_rx.recv().await {
                    if shared.send((key.clone(), fired)).is_err() {
                        break;
                    }
                }
            });
            nodes.insert(keys[i].clone(), node);
        }

        let online = keys[..config.nodes - config.offline].to_vec();
        info!(
            nodes = config.nodes,
            offline = config.offline,
            topology = ?config.topology,
            links = edges.len(),
            "simulation built"
        );

        Ok(Self {
            config,
            ledger,
            nodes,
            online,
            wire_rx,
            timer_rx,
            metrics,
        })
    }

    /// Validates every ledger in turn and votes at the end.
    pub async fn run(mut self) -> Result<SimulationSummary> {
        for seq in 1..=self.config.ledgers {
            self.ledger.set_validated(seq);
            for key in &self.online {
                let Some(node) = self.nodes.get(key) else {
                    continue;
                };
                let boundary = seq % self.config.period == 0;
                for outcome in node.on_validated_ledger(seq) {
                    self.metrics.observe(&outcome);
                }
                if boundary {
                    self.metrics.crawls_started.inc();
                }
            }
            self.pump(self.config.ledger_interval).await;
        }

        let positions: Vec<_> = self
            .online
            .iter()
            .filter_map(|k| self.nodes.get(k))
            .filter_map(RelayNode::validator_position)
            .collect();
        let round = match self.online.first().and_then(|k| self.nodes.get(k)) {
            Some(node) if !positions.is_empty() => Some(node.do_voting(&positions)),
            _ => None,
        };

        Ok(SimulationSummary {
            nodes: self.config.nodes,
            offline: self.config.offline,
            ledgers: self.config.ledgers,
            positions: positions.len(),
            round,
        })
    }

    /// Delivers wire traffic and timer fires until `window` elapses.
    async fn pump(&mut self, window: Duration) {
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                Some((from, to, message)) = self.wire_rx.recv() => {
                    if !self.online.contains(&to) {
                        debug!(peer = %to, kind = message.kind(), "peer offline, message lost");
                        continue;
                    }
                    if let Some(node) = self.nodes.get(&to) {
                        if let NodeEvent::Crawl(outcome) = node.on_message(&from, message) {
                            self.metrics.observe(&outcome);
                        }
                    }
                }
                Some((key, fired)) = self.timer_rx.recv() => {
                    if !self.online.contains(&key) {
                        continue;
                    }
                    if let Some(node) = self.nodes.get(&key) {
                        let outcome = node.on_timer(fired);
                        self.metrics.observe_timer(&outcome);
                    }
                }
                _ = &mut deadline => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(nodes: usize, topology: Topology, offline: usize) -> SimulationConfig {
        SimulationConfig {
            nodes,
            topology,
            offline,
            ledgers: 8,
            period: 8,
            ledger_interval: Duration::from_millis(500),
        }
    }

    #[test]
    fn topologies() {
        assert_eq!(links(Topology::Line, 3), vec![(0, 1), (1, 2)]);
        assert_eq!(links(Topology::Ring, 3), vec![(0, 1), (1, 2), (2, 0)]);
        assert_eq!(links(Topology::Ring, 2), vec![(0, 1)]);
        assert_eq!(links(Topology::Mesh, 4).len(), 6);
        assert!(links(Topology::Mesh, 1).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn line_reaches_every_node() {
        let metrics = NodeMetrics::new().unwrap();
        let sim = Simulation::new(config(3, Topology::Line, 0), metrics.clone()).unwrap();
        let summary = sim.run().await.unwrap();

        assert_eq!(summary.positions, 3);
        let round = summary.round.unwrap();
        assert_eq!(round.trusted_validations, 3);
        assert_eq!(round.eligible_count(), 3);
        assert_eq!(metrics.crawls_started.get(), 3);
        assert_eq!(metrics.crawls_concluded.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_node_is_routed_around() {
        let metrics = NodeMetrics::new().unwrap();
        let sim = Simulation::new(config(4, Topology::Mesh, 1), metrics.clone()).unwrap();
        let summary = sim.run().await.unwrap();

        assert_eq!(summary.positions, 3);
        let round = summary.round.unwrap();
        assert_eq!(round.eligible_count(), 3);
        assert!(metrics.hop_timeouts.get() >= 3);
    }

    #[tokio::test]
    async fn rejects_all_offline() {
        let metrics = NodeMetrics::new().unwrap();
        assert!(Simulation::new(config(2, Topology::Line, 2), metrics).is_err());
    }
}
