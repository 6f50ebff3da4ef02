//! Fee-distribution amount selection.
//!
//! Validators each propose how much to distribute this round. The round
//! settles on the lower median of the proposals, so a single outlier on
//! either side cannot move it. With no proposals at all the local node's
//! own configured amount is used.

/// Collects proposals and picks the amount.
#[derive(Debug, Clone)]
pub struct FeeVoteSelector {
    local: u64,
    proposals: Vec<u64>,
}

impl FeeVoteSelector {
    pub fn new(local: u64) -> Self {
        Self {
            local,
            proposals: Vec::new(),
        }
    }

    pub fn add(&mut self, amount: u64) {
        self.proposals.push(amount);
    }

    pub fn proposal_count(&self) -> usize {
        self.proposals.len()
    }

    /// Lower median of the proposals, or the local amount if none.
    pub fn select(&self) -> u64 {
        if self.proposals.is_empty() {
            return self.local;
        }
        let mut sorted = self.proposals.clone();
        sorted.sort_unstable();
        sorted[(sorted.len() - 1) / 2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_local() {
        assert_eq!(FeeVoteSelector::new(77).select(), 77);
    }

    #[test]
    fn odd_count_takes_middle() {
        let mut sel = FeeVoteSelector::new(0);
        for v in [300, 100, 200] {
            sel.add(v);
        }
        assert_eq!(sel.select(), 200);
    }

    #[test]
    fn even_count_takes_lower_middle() {
        let mut sel = FeeVoteSelector::new(0);
        for v in [400, 100, 300, 200] {
            sel.add(v);
        }
        assert_eq!(sel.select(), 200);
    }

    #[test]
    fn outlier_cannot_drag_result() {
        let mut sel = FeeVoteSelector::new(0);
        for v in [100, 100, 100, u64::MAX] {
            sel.add(v);
        }
        assert_eq!(sel.select(), 100);
    }
}
