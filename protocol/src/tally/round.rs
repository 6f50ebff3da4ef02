//! # Eligibility Round
//!
//! One voting round over relay-node eligibility. Trusted validators each
//! submit a position (candidate → yes/no plus a proposed fee amount); the
//! round counts them, and once finished, pays the voted amount out evenly
//! to every candidate that cleared the threshold.
//!
//! ## Threshold
//!
//! ```text
//! threshold = max(1, floor(trusted_validations * majority_fraction / 256))
//! ```
//!
//! A candidate is eligible when `yes - nay >= threshold`, compared as
//! signed integers so a nay-heavy candidate never wraps around.
//!
//! ## Lifecycle
//!
//! Collecting until [`NodesEligibilitySet::set_voting_finished`], finalized
//! after. Tallies into a finalized round are ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::MAJORITY_DENOMINATOR;
use crate::crawl::eligibility::EligibilityMap;
use crate::crypto::keys::NodeKey;

use super::fee::FeeVoteSelector;

/// A validator's submitted position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorPosition {
    pub validator: NodeKey,
    pub eligibility: EligibilityMap,
    /// Proposed fee-distribution amount, if the validator proposed one.
    pub fee_distribution: Option<u64>,
}

/// Yes/nay counters for one candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteCount {
    pub yes: u32,
    pub nay: u32,
}

impl VoteCount {
    /// `yes - nay`, signed.
    pub fn margin(&self) -> i64 {
        i64::from(self.yes) - i64::from(self.nay)
    }
}

/// Outcome of a finished round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedRound {
    pub trusted_validations: u32,
    pub threshold: u32,
    /// Total voted for distribution.
    pub amount: u64,
    /// Per-node share.
    pub share: u64,
    /// Left undistributed.
    pub remainder: u64,
    pub payments: BTreeMap<NodeKey, u64>,
}

impl FinalizedRound {
    pub fn eligible_count(&self) -> usize {
        self.payments.len()
    }

    pub fn distributed(&self) -> u64 {
        self.payments.values().sum()
    }
}

/// Vote counters for one round.
#[derive(Debug, Clone)]
pub struct NodesEligibilitySet {
    majority_fraction: u32,
    votes: BTreeMap<NodeKey, VoteCount>,
    trusted_validations: u32,
    fee_votes: FeeVoteSelector,
    finalized: Option<FinalizedRound>,
}

impl NodesEligibilitySet {
    /// `local_fee` is used when no validator proposes an amount.
    pub fn new(majority_fraction: u32, local_fee: u64) -> Self {
        Self {
            majority_fraction,
            votes: BTreeMap::new(),
            trusted_validations: 0,
            fee_votes: FeeVoteSelector::new(local_fee),
            finalized: None,
        }
    }

    /// Counts one trusted validator's position. No-op once finalized.
    pub fn tally(&mut self, position: &ValidatorPosition) {
        if self.finalized.is_some() {
            debug!(validator = %position.validator, "tally after voting finished, ignored");
            return;
        }
        for (candidate, eligible) in &position.eligibility {
            let count = self.votes.entry(candidate.clone()).or_default();
            if *eligible {
                count.yes += 1;
            } else {
                count.nay += 1;
            }
        }
        if let Some(fee) = position.fee_distribution {
            self.fee_votes.add(fee);
        }
        self.trusted_validations += 1;
    }

    pub fn trusted_validations(&self) -> u32 {
        self.trusted_validations
    }

    pub fn votes(&self, candidate: &NodeKey) -> VoteCount {
        self.votes.get(candidate).copied().unwrap_or_default()
    }

    pub fn threshold(&self) -> u32 {
        compute_threshold(self.trusted_validations, self.majority_fraction)
    }

    pub fn is_eligible(&self, candidate: &NodeKey) -> bool {
        self.votes(candidate).margin() >= i64::from(self.threshold())
    }

    /// Candidates that clear the threshold, in key order.
    pub fn eligible(&self) -> Vec<NodeKey> {
        self.votes
            .keys()
            .filter(|c| self.is_eligible(c))
            .cloned()
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.finalized.is_some()
    }

    /// Freezes the round and computes payments. Calling again returns the
    /// same result.
    pub fn set_voting_finished(&mut self) -> &FinalizedRound {
        let round = match self.finalized.take() {
            Some(round) => round,
            None => self.close_round(),
        };
        self.finalized.insert(round)
    }

    fn close_round(&self) -> FinalizedRound {
        let eligible = self.eligible();
        let amount = self.fee_votes.select();
        let (share, remainder) = split_evenly(amount, eligible.len());
        let payments: BTreeMap<NodeKey, u64> = eligible.into_iter().map(|k| (k, share)).collect();
        let round = FinalizedRound {
            trusted_validations: self.trusted_validations,
            threshold: self.threshold(),
            amount,
            share,
            remainder,
            payments,
        };
        info!(
            validations = round.trusted_validations,
            threshold = round.threshold,
            eligible = round.eligible_count(),
            amount,
            share,
            remainder,
            "eligibility voting finished"
        );
        round
    }

    pub fn finalized(&self) -> Option<&FinalizedRound> {
        self.finalized.as_ref()
    }
}

/// `max(1, floor(t * f / 256))`.
pub fn compute_threshold(trusted_validations: u32, majority_fraction: u32) -> u32 {
    let raw = u64::from(trusted_validations) * u64::from(majority_fraction)
        / u64::from(MAJORITY_DENOMINATOR);
    u32::try_from(raw).unwrap_or(u32::MAX).max(1)
}

/// `(floor(amount / n), amount mod n)`. With nobody to pay, everything is
/// remainder.
pub fn split_evenly(amount: u64, n: usize) -> (u64, u64) {
    if n == 0 {
        return (0, amount);
    }
    let n = n as u64;
    (amount / n, amount % n)
}
