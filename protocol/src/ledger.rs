//! # Ledger State Collaborator
//!
//! The crawl never touches the ledger directly except for two questions:
//! "what is the last validated ledger index?" and "how much does this
//! account hold there?". The [`LedgerState`] trait is that seam.
//!
//! [`InMemoryLedger`] backs the tests and the node simulation.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Ledger sequence number.
pub type LedgerIndex = u32;

/// Account identifier derived from a node key. 20 bytes, like most
/// account-based ledgers use.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId([u8; 20]);

impl AccountId {
    /// Wraps raw bytes.
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", hex::encode(self.0))
    }
}

/// Read access to validated ledger state.
pub trait LedgerState: Send + Sync {
    /// Index of the most recent validated ledger, if any.
    fn valid_ledger_index(&self) -> Option<LedgerIndex>;

    /// Balance of `account` in the most recent validated ledger. `None`
    /// when there is no validated ledger or the account does not exist.
    fn account_balance(&self, account: &AccountId) -> Option<u64>;
}

/// Simple in-memory ledger.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    inner: RwLock<LedgerInner>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    validated: Option<LedgerIndex>,
    balances: HashMap<AccountId, u64>,
}

impl InMemoryLedger {
    /// Empty ledger with no validated index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `index` as the latest validated ledger.
    pub fn set_validated(&self, index: LedgerIndex) {
        self.inner.write().validated = Some(index);
    }

    /// Sets an account balance.
    pub fn fund(&self, account: AccountId, balance: u64) {
        self.inner.write().balances.insert(account, balance);
    }
}

impl LedgerState for InMemoryLedger {
    fn valid_ledger_index(&self) -> Option<LedgerIndex> {
        self.inner.read().validated
    }

    fn account_balance(&self, account: &AccountId) -> Option<u64> {
        let inner = self.inner.read();
        inner.validated?;
        inner.balances.get(account).copied()
    }
}
