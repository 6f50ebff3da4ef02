//! # Eligibility Registry
//!
//! The set of node keys trusted as relay-node candidates. Loaded from the
//! `trusted_keys` config list, one `"<pubkey> [comment]"` entry per line.
//!
//! Loading is all-or-nothing: one malformed line and nothing is installed.
//! Duplicates are only a warning. Queries take a shared lock; loads take it
//! exclusively, which is fine since they happen at startup and on reload.

use std::collections::HashSet;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::keys::NodeKey;

/// Errors loading the trusted key list. Fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("malformed trusted key entry on line {line}: {entry:?}")]
    MalformedEntry { line: usize, entry: String },
}

/// Trusted relay-node keys.
#[derive(Debug, Default)]
pub struct EligibilityRegistry {
    keys: RwLock<HashSet<NodeKey>>,
}

impl EligibilityRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from config lines.
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Result<Self, RegistryError> {
        let registry = Self::new();
        registry.load(entries)?;
        Ok(registry)
    }

    /// Replaces the trusted set with `entries`. Returns the number of keys
    /// installed. On error the previous set stays in place.
    ///
    /// Grammar per entry: optional whitespace, an alphanumeric key, then
    /// optionally whitespace and a free-form comment. Blank entries are
    /// skipped.
    pub fn load<S: AsRef<str>>(&self, entries: &[S]) -> Result<usize, RegistryError> {
        let mut parsed = HashSet::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let entry = entry.as_ref();
            let Some(key) = parse_entry(entry).map_err(|_| RegistryError::MalformedEntry {
                line: i + 1,
                entry: entry.to_string(),
            })?
            else {
                continue;
            };
            if !parsed.insert(key.clone()) {
                warn!(key = %key, line = i + 1, "duplicate trusted key, skipping");
            }
        }

        let count = parsed.len();
        *self.keys.write() = parsed;
        info!(count, "trusted relay node keys loaded");
        Ok(count)
    }

    /// Whether `key` is a trusted candidate.
    pub fn listed(&self, key: &NodeKey) -> bool {
        let listed = self.keys.read().contains(key);
        if !listed {
            debug!(key = %key, "key not in trusted list");
        }
        listed
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    /// Sorted copy of the trusted keys.
    pub fn keys(&self) -> Vec<NodeKey> {
        let mut keys: Vec<NodeKey> = self.keys.read().iter().cloned().collect();
        keys.sort();
        keys
    }
}

/// `Ok(None)` for a blank entry, `Err(())` for anything malformed.
fn parse_entry(entry: &str) -> Result<Option<NodeKey>, ()> {
    let trimmed = entry.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let token = trimmed.split_whitespace().next().ok_or(())?;
    NodeKey::parse(token).map(Some).map_err(|_| ())
}
