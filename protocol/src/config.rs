//! # Protocol Configuration & Constants
//!
//! Every tunable of the crawl and the eligibility vote lives here, either as
//! a constant or as a field of [`CrnConfig`]. Config files are TOML; all
//! fields are optional and fall back to the defaults below.
//!
//! ```toml
//! majority_fraction = 204
//! reporting_period = 256
//! max_latency_ms = 500
//! trusted_keys = [
//!     "3f1c...e9 relay-one",
//!     "a07b...42",
//! ]
//!
//! [relay_node]
//! domain = "relay.example.com"
//! public_key = "3f1c...e9"
//! signature = "9b2e...01"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::LedgerIndex;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Crate version, reported by the node binary.
pub const PROTOCOL_VERSION: &str = "0.1.0";

// ---------------------------------------------------------------------------
// Voting
// ---------------------------------------------------------------------------

/// Denominator of the majority fraction. Fractions are integers out of 256
/// so the threshold is computed without floating point.
pub const MAJORITY_DENOMINATOR: u32 = 256;

/// Default supermajority: 204/256, roughly 80%.
pub const DEFAULT_MAJORITY_FRACTION: u32 = 204;

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Ledgers between two reporting boundaries (crawl start + payout vote).
pub const DEFAULT_REPORTING_PERIOD: LedgerIndex = 256;

/// How long a peer has to acknowledge a crawl request before it is
/// treated as unresponsive.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Wall-clock budget for a whole crawl. Each hop gets a share of it.
pub const DEFAULT_CRAWL_BUDGET: Duration = Duration::from_secs(60);

/// Crawl instances older than this many reporting periods are pruned.
pub const DEFAULT_RETENTION_PERIODS: u32 = 5;

/// A crawl still running this many ledgers before the next boundary is
/// force-concluded so its position is ready for the vote.
pub const DEFAULT_FORCE_CONCLUDE_MARGIN: LedgerIndex = 16;

// ---------------------------------------------------------------------------
// Eligibility
// ---------------------------------------------------------------------------

/// Latency ceiling for eligibility, in milliseconds.
pub const DEFAULT_MAX_LATENCY_MS: u32 = 500;

/// Minimum balance for a relay node's payout account to count as activated.
pub const DEFAULT_ACTIVATION_RESERVE: u64 = 1_000_000;

/// Latency reported when no healthy peer has a measurement.
pub const UNKNOWN_LATENCY_MS: u32 = u32::MAX;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Order in which a node tries its peers when forwarding a crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NeighborOrder {
    /// Whatever order the peer directory returns.
    #[default]
    Overlay,
    /// Lexicographic by node key. Fully reproducible.
    Sorted,
    /// Shuffled with a seed mixed with the crawl's start ledger.
    Seeded,
}

/// The `[relay_node]` section: this node's own relay identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayNodeConfig {
    pub domain: String,
    pub public_key: String,
    /// Hex-encoded signature of `domain` by `public_key`.
    pub signature: String,
}

/// Relay node crawl and voting configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrnConfig {
    /// Supermajority out of 256 required for a candidate to be paid.
    pub majority_fraction: u32,
    /// Ledgers between crawls and payout votes.
    pub reporting_period: LedgerIndex,
    /// Maximum acceptable latency for eligibility, milliseconds.
    pub max_latency_ms: u32,
    /// Minimum balance for an activated payout account.
    pub activation_reserve: u64,
    /// Total crawl budget, milliseconds.
    pub crawl_budget_ms: u64,
    /// Per-hop acknowledgement timeout, milliseconds.
    pub ack_timeout_ms: u64,
    /// Retention window for crawl instances, in reporting periods.
    pub retention_periods: u32,
    /// Ledgers before the next boundary at which a running crawl is
    /// force-concluded.
    pub force_conclude_margin: LedgerIndex,
    /// Peer ordering used for DFS forwarding.
    pub neighbor_order: NeighborOrder,
    /// Seed for [`NeighborOrder::Seeded`].
    pub neighbor_seed: u64,
    /// This node's proposed fee-distribution amount for the payout vote.
    pub fee_distribution: u64,
    /// Trusted relay node keys, one `"<pubkey> [comment]"` entry each.
    pub trusted_keys: Vec<String>,
    /// This node's relay identity, if it is a relay node.
    pub relay_node: Option<RelayNodeConfig>,
}

impl Default for CrnConfig {
    fn default() -> Self {
        Self {
            majority_fraction: DEFAULT_MAJORITY_FRACTION,
            reporting_period: DEFAULT_REPORTING_PERIOD,
            max_latency_ms: DEFAULT_MAX_LATENCY_MS,
            activation_reserve: DEFAULT_ACTIVATION_RESERVE,
            crawl_budget_ms: DEFAULT_CRAWL_BUDGET.as_millis() as u64,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT.as_millis() as u64,
            retention_periods: DEFAULT_RETENTION_PERIODS,
            force_conclude_margin: DEFAULT_FORCE_CONCLUDE_MARGIN,
            neighbor_order: NeighborOrder::Overlay,
            neighbor_seed: 0,
            fee_distribution: 0,
            trusted_keys: Vec::new(),
            relay_node: None,
        }
    }
}

impl CrnConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Range checks. Does not look at `trusted_keys`; the registry owns
    /// that grammar.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.majority_fraction == 0 || self.majority_fraction > MAJORITY_DENOMINATOR {
            return Err(ConfigError::Invalid {
                field: "majority_fraction",
                reason: format!("must be in 1..={}", MAJORITY_DENOMINATOR),
            });
        }
        if self.reporting_period == 0 {
            return Err(ConfigError::Invalid {
                field: "reporting_period",
                reason: "must be positive".into(),
            });
        }
        if self.force_conclude_margin >= self.reporting_period {
            return Err(ConfigError::Invalid {
                field: "force_conclude_margin",
                reason: "must be smaller than reporting_period".into(),
            });
        }
        if self.crawl_budget_ms == 0 || self.ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "crawl_budget_ms",
                reason: "crawl and ack timeouts must be positive".into(),
            });
        }
        if self.retention_periods == 0 {
            return Err(ConfigError::Invalid {
                field: "retention_periods",
                reason: "must keep at least one period".into(),
            });
        }
        Ok(())
    }

    pub fn crawl_budget(&self) -> Duration {
        Duration::from_millis(self.crawl_budget_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Retention window in ledgers.
    pub fn retention_ledgers(&self) -> LedgerIndex {
        self.reporting_period.saturating_mul(self.retention_periods)
    }
}
