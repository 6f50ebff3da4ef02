//! # Eligibility Tally
//!
//! Two halves:
//!
//! - This node's own **position**: the eligibility map of its last
//!   concluded crawl, set by the crawl and read by whoever assembles this
//!   node's validation vote.
//! - The **vote**: at a reporting boundary, the positions of trusted
//!   validators are counted into a fresh [`NodesEligibilitySet`] and
//!   finalized into a payment map.
//!
//! A crawl that never concludes leaves the previous position in place.

pub mod fee;
pub mod round;

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::CrnConfig;
use crate::crawl::eligibility::EligibilityMap;
use crate::ledger::LedgerIndex;
use crate::registry::EligibilityRegistry;

pub use fee::FeeVoteSelector;
pub use round::{
    compute_threshold, split_evenly, FinalizedRound, NodesEligibilitySet, ValidatorPosition,
    VoteCount,
};

/// Our proposal for the next vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPosition {
    /// Start ledger of the crawl that produced it.
    pub start_ledger: LedgerIndex,
    pub eligibility: EligibilityMap,
    /// Whether the crawl was force-concluded.
    pub partial: bool,
}

/// Position holder and vote runner. One per node, shared by `Arc`.
pub struct EligibilityTally {
    majority_fraction: u32,
    local_fee: u64,
    validators: Arc<EligibilityRegistry>,
    position: RwLock<Option<LocalPosition>>,
    last_vote: RwLock<Option<FinalizedRound>>,
}

impl EligibilityTally {
    /// `validators` decides whose positions count.
    pub fn new(config: &CrnConfig, validators: Arc<EligibilityRegistry>) -> Self {
        Self {
            majority_fraction: config.majority_fraction,
            local_fee: config.fee_distribution,
            validators,
            position: RwLock::new(None),
            last_vote: RwLock::new(None),
        }
    }

    /// Replaces this node's position with the result of a concluded crawl.
    pub fn update_position(&self, start_ledger: LedgerIndex, eligibility: EligibilityMap, partial: bool) {
        let eligible = eligibility.values().filter(|e| **e).count();
        info!(
            start_ledger,
            candidates = eligibility.len(),
            eligible,
            partial,
            "eligibility position updated"
        );
        *self.position.write() = Some(LocalPosition {
            start_ledger,
            eligibility,
            partial,
        });
    }

    /// This node's current position, if any crawl has concluded.
    pub fn position(&self) -> Option<LocalPosition> {
        self.position.read().clone()
    }

    /// The fee amount this node proposes.
    pub fn local_fee(&self) -> u64 {
        self.local_fee
    }

    /// Counts the trusted positions and finalizes the round.
    pub fn do_voting(&self, positions: &[ValidatorPosition]) -> FinalizedRound {
        let mut set = NodesEligibilitySet::new(self.majority_fraction, self.local_fee);
        for position in positions {
            if self.validators.listed(&position.validator) {
                set.tally(position);
            } else {
                debug!(validator = %position.validator, "position from untrusted validator ignored");
            }
        }
        let round = set.set_voting_finished().clone();
        *self.last_vote.write() = Some(round.clone());
        round
    }

    /// Result of the most recent [`do_voting`](Self::do_voting).
    pub fn last_vote(&self) -> Option<FinalizedRound> {
        self.last_vote.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::NodeKey;

    fn key(s: &str) -> NodeKey {
        NodeKey::parse(s).unwrap()
    }

    fn tally() -> EligibilityTally {
        let validators = Arc::new(EligibilityRegistry::from_entries(&["v1", "v2", "v3"]).unwrap());
        let config = CrnConfig {
            majority_fraction: 128,
            fee_distribution: 100,
            ..CrnConfig::default()
        };
        EligibilityTally::new(&config, validators)
    }

    fn position(validator: &str, candidates: &[&str]) -> ValidatorPosition {
        ValidatorPosition {
            validator: key(validator),
            eligibility: candidates.iter().map(|c| (key(c), true)).collect(),
            fee_distribution: None,
        }
    }

    #[test]
    fn position_starts_empty_and_is_replaced() {
        let t = tally();
        assert!(t.position().is_none());
        let mut map = EligibilityMap::new();
        map.insert(key("aa"), true);
        t.update_position(256, map.clone(), false);
        let pos = t.position().unwrap();
        assert_eq!(pos.eligibility, map);
        assert_eq!(pos.start_ledger, 256);

        t.update_position(512, EligibilityMap::new(), true);
        assert!(t.position().unwrap().partial);
    }

    #[test]
    fn only_trusted_validators_count() {
        let t = tally();
        let round = t.do_voting(&[
            position("v1", &["aa", "bb"]),
            position("v2", &["aa"]),
            position("intruder", &["bb", "cc"]),
        ]);
        assert_eq!(round.trusted_validations, 2);
        assert_eq!(round.threshold, 1);
        assert_eq!(round.eligible_count(), 2);
        assert!(!round.payments.contains_key(&key("cc")));
        assert_eq!(round.share, 50);
        assert_eq!(t.last_vote(), Some(round));
    }

    #[test]
    fn nobody_eligible_keeps_everything() {
        let t = tally();
        let round = t.do_voting(&[]);
        assert_eq!(round.eligible_count(), 0);
        assert_eq!(round.remainder, 100);
    }
}
