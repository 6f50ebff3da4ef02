//! # Eligibility Checks
//!
//! When a crawl concludes, every collected report is judged on its own.
//! A node is eligible only if all of these hold:
//!
//! 1. Its key is in the trusted registry.
//! 2. The report was filed under the key it is stored under.
//! 3. The domain signature in the report verifies against that key.
//! 4. Its payout account is activated in the last validated ledger.
//! 5. Its reported latency is within the configured maximum.
//!
//! A failure only costs that one node its eligibility.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::config::CrnConfig;
use crate::crypto::keys::NodeKey;
use crate::crypto::signatures::verify_domain;
use crate::identity::is_activated;
use crate::ledger::LedgerState;
use crate::performance::report::PerformanceReport;
use crate::registry::EligibilityRegistry;

/// Per-node result of one crawl.
pub type EligibilityMap = BTreeMap<NodeKey, bool>;

/// Why a node was judged ineligible.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Ineligible {
    #[error("key is not in the trusted list")]
    Unlisted,

    #[error("report filed under a different key")]
    KeyMismatch,

    #[error("report carries no domain signature")]
    MissingSignature,

    #[error("domain signature does not verify")]
    BadSignature,

    #[error("payout account is not activated")]
    NotActivated,

    #[error("latency {latency_ms}ms exceeds {max_ms}ms")]
    LatencyTooHigh { latency_ms: u32, max_ms: u32 },
}

/// Judges collected reports.
pub struct EligibilityChecker {
    registry: Arc<EligibilityRegistry>,
    ledger: Arc<dyn LedgerState>,
    max_latency_ms: u32,
    activation_reserve: u64,
}

impl EligibilityChecker {
    pub fn new(
        registry: Arc<EligibilityRegistry>,
        ledger: Arc<dyn LedgerState>,
        config: &CrnConfig,
    ) -> Self {
        Self {
            registry,
            ledger,
            max_latency_ms: config.max_latency_ms,
            activation_reserve: config.activation_reserve,
        }
    }

    /// Checks one report stored under `key`.
    pub fn check(&self, key: &NodeKey, report: &PerformanceReport) -> Result<(), Ineligible> {
        if !self.registry.listed(key) {
            return Err(Ineligible::Unlisted);
        }
        if &report.pubkey != key {
            return Err(Ineligible::KeyMismatch);
        }
        let signature = report.signature.as_deref().ok_or(Ineligible::MissingSignature)?;
        verify_domain(key, &report.domain, signature).map_err(|_| Ineligible::BadSignature)?;
        if !is_activated(key, self.ledger.as_ref(), self.activation_reserve) {
            return Err(Ineligible::NotActivated);
        }
        if report.latency_ms > self.max_latency_ms {
            return Err(Ineligible::LatencyTooHigh {
                latency_ms: report.latency_ms,
                max_ms: self.max_latency_ms,
            });
        }
        Ok(())
    }

    /// Builds the eligibility map for a set of collected reports.
    pub fn evaluate(&self, reports: &BTreeMap<NodeKey, PerformanceReport>) -> EligibilityMap {
        reports
            .iter()
            .map(|(key, report)| {
                let verdict = self.check(key, report);
                if let Err(reason) = &verdict {
                    debug!(node = %key, %reason, "relay node ineligible");
                }
                (key.clone(), verdict.is_ok())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::NodeKeypair;
    use crate::identity::NodeIdentity;
    use crate::ledger::InMemoryLedger;
    use crate::performance::accounting::OperatingMode;

    struct Fixture {
        checker: EligibilityChecker,
        ledger: Arc<InMemoryLedger>,
        good: NodeIdentity,
    }

    fn report_for(id: &NodeIdentity, latency_ms: u32) -> PerformanceReport {
        PerformanceReport {
            current_mode: OperatingMode::Validating,
            ledger_seq_begin: 0,
            ledger_seq_end: 256,
            status: Vec::new(),
            pubkey: id.public_key().clone(),
            domain: id.domain().to_string(),
            latency_ms,
            activated: true,
            signature: Some(id.domain_signature().to_string()),
        }
    }

    fn fixture() -> Fixture {
        let good = NodeIdentity::create(&NodeKeypair::from_seed(&[3u8; 32]), "good.example.com");
        let registry = Arc::new(
            EligibilityRegistry::from_entries(&[good.public_key().to_string()]).unwrap(),
        );
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.set_validated(256);
        ledger.fund(good.account_id(), 1_000);
        let config = CrnConfig {
            max_latency_ms: 500,
            activation_reserve: 1_000,
            ..CrnConfig::default()
        };
        Fixture {
            checker: EligibilityChecker::new(registry, ledger.clone(), &config),
            ledger,
            good,
        }
    }

    #[test]
    fn well_behaved_node_is_eligible() {
        let f = fixture();
        assert_eq!(f.checker.check(f.good.public_key(), &report_for(&f.good, 120)), Ok(()));
    }

    #[test]
    fn each_rule_can_fail_alone() {
        let f = fixture();
        let key = f.good.public_key();

        let slow = report_for(&f.good, 501);
        assert!(matches!(
            f.checker.check(key, &slow),
            Err(Ineligible::LatencyTooHigh { .. })
        ));

        let mut unsigned = report_for(&f.good, 10);
        unsigned.signature = None;
        assert_eq!(f.checker.check(key, &unsigned), Err(Ineligible::MissingSignature));

        let mut forged = report_for(&f.good, 10);
        forged.domain = "evil.example.com".into();
        assert_eq!(f.checker.check(key, &forged), Err(Ineligible::BadSignature));

        let stranger = NodeIdentity::create(&NodeKeypair::from_seed(&[4u8; 32]), "x.example.com");
        assert_eq!(
            f.checker.check(stranger.public_key(), &report_for(&stranger, 10)),
            Err(Ineligible::Unlisted)
        );

        f.ledger.fund(f.good.account_id(), 999);
        assert_eq!(
            f.checker.check(key, &report_for(&f.good, 10)),
            Err(Ineligible::NotActivated)
        );
    }

    #[test]
    fn report_under_wrong_key_rejected() {
        let f = fixture();
        let other = NodeIdentity::create(&NodeKeypair::from_seed(&[5u8; 32]), "o.example.com");
        assert_eq!(
            f.checker.check(f.good.public_key(), &report_for(&other, 10)),
            Err(Ineligible::KeyMismatch)
        );
    }

    #[test]
    fn evaluate_maps_every_report() {
        let f = fixture();
        let stranger = NodeIdentity::create(&NodeKeypair::from_seed(&[6u8; 32]), "s.example.com");
        let mut reports = BTreeMap::new();
        reports.insert(f.good.public_key().clone(), report_for(&f.good, 10));
        reports.insert(stranger.public_key().clone(), report_for(&stranger, 10));
        let map = f.checker.evaluate(&reports);
        assert_eq!(map.len(), 2);
        assert!(map[f.good.public_key()]);
        assert!(!map[stranger.public_key()]);
    }
}
