//! # Relay Node Identity
//!
//! A relay node is identified by three things that travel together:
//!
//! 1. Its node key (Ed25519 public key, textual form).
//! 2. The domain it operates under.
//! 3. A signature over that domain made with the node key.
//!
//! From the key we derive the ledger account that receives payouts. The
//! account's funded ("activated") status is *not* stored here. It is looked
//! up in the last validated ledger every time somebody asks, because
//! balances move and a cached answer would go stale.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::RelayNodeConfig;
use crate::crypto::keys::{KeyError, NodeKey, NodeKeypair};
use crate::crypto::signatures::{sign_domain, verify_domain, SignatureError};
use crate::ledger::{AccountId, LedgerState};

/// Errors raised while building an identity from configuration.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid relay node public key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("domain signature rejected: {0}")]
    BadSignature(#[from] SignatureError),
}

/// Immutable identity of a relay node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    public_key: NodeKey,
    domain: String,
    domain_signature: String,
    account_id: AccountId,
}

impl NodeIdentity {
    /// Creates a fresh identity by signing `domain` with `keypair`.
    pub fn create(keypair: &NodeKeypair, domain: &str) -> Self {
        let signature = sign_domain(keypair, domain);
        Self::from_parts(keypair.node_key(), domain.to_string(), signature.to_hex())
    }

    /// Assembles an identity from already-known parts without checking the
    /// signature. Use [`verify_domain_signature`](Self::verify_domain_signature)
    /// before trusting it.
    pub fn from_parts(public_key: NodeKey, domain: String, domain_signature: String) -> Self {
        let account_id = account_id_for(&public_key);
        Self {
            public_key,
            domain,
            domain_signature,
            account_id,
        }
    }

    /// Builds the local identity from the `[relay_node]` config section.
    /// The signature must verify, otherwise the node would advertise a
    /// report that every peer rejects.
    pub fn from_config(config: &RelayNodeConfig) -> Result<Self, IdentityError> {
        let key = NodeKey::parse(&config.public_key)?;
        verify_domain(&key, &config.domain, &config.signature)?;
        Ok(Self::from_parts(
            key,
            config.domain.clone(),
            config.signature.clone(),
        ))
    }

    pub fn public_key(&self) -> &NodeKey {
        &self.public_key
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Hex-encoded domain signature.
    pub fn domain_signature(&self) -> &str {
        &self.domain_signature
    }

    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    /// Checks the domain signature against the public key.
    pub fn verify_domain_signature(&self) -> bool {
        verify_domain(&self.public_key, &self.domain, &self.domain_signature).is_ok()
    }

    /// Whether the payout account holds at least `reserve` in the last
    /// validated ledger. False when there is no validated ledger yet.
    pub fn activated(&self, ledger: &dyn LedgerState, reserve: u64) -> bool {
        is_activated(&self.public_key, ledger, reserve)
    }
}

/// Derives the payout account of a node key: the first 20 bytes of the
/// BLAKE3 digest of the key's textual form.
pub fn account_id_for(key: &NodeKey) -> AccountId {
    let digest = blake3::hash(key.as_str().as_bytes());
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&digest.as_bytes()[..20]);
    AccountId::from_bytes(bytes)
}

/// Activation check for an arbitrary key, used when judging other nodes'
/// reports at crawl conclusion.
pub fn is_activated(key: &NodeKey, ledger: &dyn LedgerState, reserve: u64) -> bool {
    let account = account_id_for(key);
    match ledger.account_balance(&account) {
        Some(balance) => {
            debug!(node = %key, account = %account, balance, "relay node balance");
            balance >= reserve
        }
        None => false,
    }
}
