//! # Performance Report
//!
//! What a relay node says about itself for one reporting period. The full
//! form travels inside crawl messages and carries the domain signature;
//! the redacted form is gossiped to every peer and drops the per-mode
//! breakdown and the signature.

use serde::{Deserialize, Serialize};

use crate::crypto::keys::NodeKey;
use crate::ledger::LedgerIndex;

use super::accounting::{ModeCounters, OperatingMode};

/// One per-mode slot of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeStatus {
    pub mode: OperatingMode,
    /// Seconds spent in `mode` during the period.
    pub duration_secs: u64,
    /// Times `mode` was entered during the period.
    pub transitions: u32,
}

impl ModeStatus {
    pub(crate) fn from_counters(mode: OperatingMode, counters: ModeCounters) -> Self {
        Self {
            mode,
            duration_secs: counters.duration.as_secs(),
            transitions: counters.transitions,
        }
    }
}

/// Self-reported operating state of a relay node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub current_mode: OperatingMode,
    pub ledger_seq_begin: LedgerIndex,
    pub ledger_seq_end: LedgerIndex,
    /// Five slots in [`OperatingMode::ALL`] order. Empty when redacted.
    #[serde(default)]
    pub status: Vec<ModeStatus>,
    pub pubkey: NodeKey,
    pub domain: String,
    /// Minimum latency to a healthy peer, milliseconds.
    /// [`UNKNOWN_LATENCY_MS`](crate::config::UNKNOWN_LATENCY_MS) when none
    /// was measured.
    pub latency_ms: u32,
    pub activated: bool,
    /// Hex domain signature. Absent in the gossip form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl PerformanceReport {
    /// Gossip form: per-mode breakdown and signature stripped.
    pub fn redacted(&self) -> Self {
        Self {
            status: Vec::new(),
            signature: None,
            ..self.clone()
        }
    }

    pub fn is_redacted(&self) -> bool {
        self.status.is_empty() && self.signature.is_none()
    }

    /// Slot for `mode`, if the breakdown is present.
    pub fn mode_status(&self, mode: OperatingMode) -> Option<&ModeStatus> {
        self.status.iter().find(|s| s.mode == mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PerformanceReport {
        PerformanceReport {
            current_mode: OperatingMode::Validating,
            ledger_seq_begin: 0,
            ledger_seq_end: 256,
            status: OperatingMode::ALL
                .iter()
                .map(|m| ModeStatus {
                    mode: *m,
                    duration_secs: 10,
                    transitions: 1,
                })
                .collect(),
            pubkey: NodeKey::parse("abc1").unwrap(),
            domain: "relay.example.com".into(),
            latency_ms: 42,
            activated: true,
            signature: Some("00ff".into()),
        }
    }

    #[test]
    fn redaction_strips_breakdown_and_signature() {
        let full = sample();
        let gossip = full.redacted();
        assert!(gossip.is_redacted());
        assert!(!full.is_redacted());
        assert_eq!(gossip.pubkey, full.pubkey);
        assert_eq!(gossip.latency_ms, 42);
        assert!(gossip.mode_status(OperatingMode::Validating).is_none());
    }

    #[test]
    fn redacted_json_omits_signature() {
        let json = serde_json::to_string(&sample().redacted()).unwrap();
        assert!(!json.contains("signature"));
        let back: PerformanceReport = serde_json::from_str(&json).unwrap();
        assert!(back.is_redacted());
    }
}
