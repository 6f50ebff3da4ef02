//! # Relay Node Runtime
//!
//! `RelayNode` is the top-level object for a relay node. It owns every
//! crawl and voting service (no globals, everything shared by `Arc`) and
//! exposes the three entry points the surrounding node calls into:
//!
//! ```text
//! on_message(from, msg)      overlay delivered something
//! on_timer(fired)            a crawl timer went off
//! on_validated_ledger(seq)   a new ledger was validated
//! ```
//!
//! Reporting boundaries are ledgers with `seq % reporting_period == 0`. At
//! a boundary the node prepares its report, gossips the redacted copy, and
//! starts a crawl for that round. Shortly before the next boundary a crawl
//! that is still running is force-concluded so there is a position ready
//! for the vote.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::config::{ConfigError, CrnConfig};
use crate::crawl::coordinator::{CrawlCoordinator, TimerFired};
use crate::crawl::message::CrawlInstanceKey;
use crate::crawl::traversal::{CrawlEvent, CrawlOutcome, CrawlTraversal};
use crate::crypto::keys::NodeKey;
use crate::identity::{IdentityError, NodeIdentity};
use crate::ledger::{LedgerIndex, LedgerState};
use crate::performance::accounting::OperatingMode;
use crate::performance::recorder::PerformanceRecorder;
use crate::registry::{EligibilityRegistry, RegistryError};
use crate::tally::{EligibilityTally, FinalizedRound, ValidatorPosition};

use super::overlay::{OverlayMessage, PeerDirectory};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Startup failures. Anything after startup is logged, not returned.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("trusted key list rejected: {0}")]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// No `[relay_node]` section in the config.
    #[error("relay node identity not configured")]
    MissingIdentity,
}

/// What an inbound overlay message led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Crawl(CrawlOutcome),
    /// Gossip report intake; `true` if it was stored.
    ReportState(bool),
}

// ---------------------------------------------------------------------------
// Relay Node
// ---------------------------------------------------------------------------

/// A relay node participating in crawls and eligibility votes.
pub struct RelayNode {
    config: CrnConfig,
    registry: Arc<EligibilityRegistry>,
    recorder: Arc<PerformanceRecorder>,
    coordinator: Arc<CrawlCoordinator>,
    tally: Arc<EligibilityTally>,
    traversal: CrawlTraversal,
    peers: Arc<dyn PeerDirectory>,
    /// The crawl this node started most recently.
    current_crawl: Mutex<Option<CrawlInstanceKey>>,
}

impl RelayNode {
    /// Wires up all services. Fails if the config or the trusted key list
    /// is invalid; a node never runs with a partial trust list.
    ///
    /// With `timers` set, crawl timers fire into that channel and the
    /// caller feeds them back through [`on_timer`](Self::on_timer).
    pub fn new(
        identity: NodeIdentity,
        config: CrnConfig,
        ledger: Arc<dyn LedgerState>,
        peers: Arc<dyn PeerDirectory>,
        timers: Option<UnboundedSender<TimerFired>>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let registry = Arc::new(EligibilityRegistry::from_entries(&config.trusted_keys)?);
        let recorder = Arc::new(PerformanceRecorder::new(
            identity,
            ledger.clone(),
            config.activation_reserve,
        ));
        let mut coordinator = CrawlCoordinator::new(&config);
        if let Some(tx) = timers {
            coordinator = coordinator.with_timer_channel(tx);
        }
        let coordinator = Arc::new(coordinator);
        // Relay nodes are also the validators whose positions count.
        let tally = Arc::new(EligibilityTally::new(&config, registry.clone()));
        let traversal = CrawlTraversal::new(
            &config,
            recorder.clone(),
            coordinator.clone(),
            registry.clone(),
            tally.clone(),
            ledger,
            peers.clone(),
        );

        info!(
            node = %recorder.identity().public_key(),
            domain = recorder.identity().domain(),
            trusted = registry.len(),
            period = config.reporting_period,
            "relay node initialized"
        );

        Ok(Self {
            config,
            registry,
            recorder,
            coordinator,
            tally,
            traversal,
            peers,
            current_crawl: Mutex::new(None),
        })
    }

    /// Like [`new`](Self::new), with the identity taken from the config's
    /// `[relay_node]` section.
    pub fn from_config(
        config: CrnConfig,
        ledger: Arc<dyn LedgerState>,
        peers: Arc<dyn PeerDirectory>,
        timers: Option<UnboundedSender<TimerFired>>,
    ) -> Result<Self, NodeError> {
        let relay = config.relay_node.as_ref().ok_or(NodeError::MissingIdentity)?;
        let identity = NodeIdentity::from_config(relay)?;
        Self::new(identity, config, ledger, peers, timers)
    }

    pub fn local_key(&self) -> &NodeKey {
        self.traversal.local_key()
    }

    pub fn config(&self) -> &CrnConfig {
        &self.config
    }

    pub fn registry(&self) -> &EligibilityRegistry {
        &self.registry
    }

    pub fn recorder(&self) -> &PerformanceRecorder {
        &self.recorder
    }

    pub fn coordinator(&self) -> &CrawlCoordinator {
        &self.coordinator
    }

    pub fn tally(&self) -> &EligibilityTally {
        &self.tally
    }

    pub fn traversal(&self) -> &CrawlTraversal {
        &self.traversal
    }

    /// Signals an operating-mode change.
    pub fn set_mode(&self, mode: OperatingMode) {
        self.recorder.mode(mode);
    }

    /// The crawl this node started most recently.
    pub fn current_crawl(&self) -> Option<CrawlInstanceKey> {
        self.current_crawl.lock().clone()
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Handles a message the overlay delivered from `from`.
    pub fn on_message(&self, from: &NodeKey, message: OverlayMessage) -> NodeEvent {
        match message {
            OverlayMessage::Crawl(crawl) => {
                NodeEvent::Crawl(self.traversal.handle(from, CrawlEvent::from_message(crawl)))
            }
            OverlayMessage::CrawlAck(ack) => {
                NodeEvent::Crawl(self.traversal.handle(from, CrawlEvent::Ack(ack)))
            }
            OverlayMessage::ReportState(report) => {
                NodeEvent::ReportState(self.recorder.on_report_state(from, report))
            }
        }
    }

    /// Handles a crawl timer fire.
    pub fn on_timer(&self, fired: TimerFired) -> CrawlOutcome {
        let from = fired.instance.initiator.clone();
        self.traversal.handle(&from, CrawlEvent::Timeout(fired))
    }

    /// Drives boundary work for a newly validated ledger.
    pub fn on_validated_ledger(&self, seq: LedgerIndex) -> Vec<CrawlOutcome> {
        let mut outcomes = Vec::new();
        let running = self.current_crawl();

        if let Some(instance) = running.as_ref() {
            if self.traversal.should_force_conclude(instance, seq) {
                info!(instance = %instance, seq, "force-concluding crawl before boundary");
                outcomes.push(self.traversal.force_conclude(instance));
            }
        }

        if seq % self.config.reporting_period == 0 {
            self.recorder.prepare_report(seq, self.peers.as_ref());
            self.recorder.broadcast(self.peers.as_ref());
            let outcome = self.traversal.start(seq);
            *self.current_crawl.lock() = Some(CrawlInstanceKey {
                initiator: self.local_key().clone(),
                start_ledger: seq,
            });
            outcomes.push(outcome);
        } else {
            debug!(seq, "not a reporting boundary");
        }
        outcomes
    }

    // -----------------------------------------------------------------------
    // Voting
    // -----------------------------------------------------------------------

    /// This node's position as a validator, if a crawl has concluded.
    pub fn validator_position(&self) -> Option<ValidatorPosition> {
        self.tally.position().map(|p| ValidatorPosition {
            validator: self.local_key().clone(),
            eligibility: p.eligibility,
            fee_distribution: Some(self.tally.local_fee()),
        })
    }

    /// Runs the eligibility vote over the collected validator positions.
    pub fn do_voting(&self, positions: &[ValidatorPosition]) -> FinalizedRound {
        self.tally.do_voting(positions)
    }
}
