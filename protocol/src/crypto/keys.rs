//! # Key Management
//!
//! Ed25519 keypairs and the string-form node keys that identify relay nodes
//! on the overlay.
//!
//! Two representations live here on purpose:
//!
//! - [`NodeKeypair`] holds the signing key. It never leaves the process.
//! - [`NodeKey`] is what peers see: the lowercase hex of the public key.
//!   Crawl messages, the trusted-key registry and the eligibility maps are
//!   all keyed by it.
//!
//! A `NodeKey` is only decoded back into an Ed25519 point when a signature
//! has to be checked. Anything that does not decode simply fails
//! verification, so a garbage key in a crawl report costs that node its
//! eligibility and nothing else.
//!
//! ## Security considerations
//!
//! - Private keys are zeroized on drop (thanks, ed25519-dalek).
//! - Key generation uses `OsRng`.
//! - Secret key bytes are never logged or formatted.

use ed25519_dalek::{
    Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur during key operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid secret key bytes: wrong length or not hex")]
    InvalidSecretKey,

    #[error("invalid public key: not a valid Ed25519 point")]
    InvalidPublicKey,

    #[error("invalid node key {0:?}: expected a non-empty alphanumeric token")]
    MalformedNodeKey(String),

    #[error("invalid signature encoding")]
    InvalidSignature,
}

// ---------------------------------------------------------------------------
// NodeKeypair
// ---------------------------------------------------------------------------

/// A relay node's Ed25519 keypair.
///
/// Deliberately not `Serialize`: exporting secret material goes through
/// [`to_bytes`](Self::to_bytes) / [`to_hex`](Self::to_hex) explicitly.
///
/// # Examples
///
/// ```
/// use crn_protocol::crypto::keys::NodeKeypair;
///
/// let kp = NodeKeypair::generate();
/// let sig = kp.sign(b"relay.example.com");
/// assert!(kp.node_key().verify(b"relay.example.com", &sig));
/// ```
pub struct NodeKeypair {
    signing_key: SigningKey,
}

impl NodeKeypair {
    /// Generate a fresh keypair using the OS cryptographic RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Constructs a keypair deterministically from a 32-byte seed.
    ///
    /// Tests and the simulation use this to get stable node keys.
    pub fn from_seed(seed: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Reconstruct a keypair from a hex-encoded secret key.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; SECRET_KEY_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// The overlay identity of this keypair.
    pub fn node_key(&self) -> NodeKey {
        NodeKey(hex::encode(self.signing_key.verifying_key().to_bytes()))
    }

    /// Sign a message. Ed25519 is deterministic, so the same message always
    /// yields the same signature.
    pub fn sign(&self, message: &[u8]) -> NodeSignature {
        NodeSignature {
            bytes: self.signing_key.sign(message).to_bytes().to_vec(),
        }
    }

    /// Exports the raw 32-byte secret key. Handle with care.
    pub fn to_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Hex form of the secret key, for writing key files.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

impl Clone for NodeKeypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.signing_key.to_bytes())
    }
}

impl fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print secret key material, not even partially.
        write!(f, "NodeKeypair(pub={})", self.node_key())
    }
}

// ---------------------------------------------------------------------------
// NodeKey
// ---------------------------------------------------------------------------

/// Overlay identity of a node: the public key in its textual form.
///
/// Ordered and hashable so it can key `BTreeMap`s (deterministic crawl
/// report order) and `HashSet`s (registry lookups).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeKey(String);

impl NodeKey {
    /// Parses a node key token.
    ///
    /// Accepts any non-empty ASCII alphanumeric token. Whether the token is
    /// an actual Ed25519 point is only checked when a signature is verified.
    pub fn parse(token: &str) -> Result<Self, KeyError> {
        if token.is_empty() || !token.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(KeyError::MalformedNodeKey(token.to_string()));
        }
        Ok(Self(token.to_string()))
    }

    /// Returns the textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decodes the key into an Ed25519 verifying key.
    pub fn verifying_key(&self) -> Result<VerifyingKey, KeyError> {
        let bytes = hex::decode(&self.0).map_err(|_| KeyError::InvalidPublicKey)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&arr).map_err(|_| KeyError::InvalidPublicKey)
    }

    /// Verify a signature made by this key.
    ///
    /// Returns `false` for keys that do not decode, malformed signatures and
    /// genuine mismatches alike.
    pub fn verify(&self, message: &[u8], signature: &NodeSignature) -> bool {
        let Ok(verifying_key) = self.verifying_key() else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(signature.bytes.as_slice()) else {
            return false;
        };
        verifying_key
            .verify(message, &DalekSignature::from_bytes(&sig_bytes))
            .is_ok()
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.0.get(..12).unwrap_or(&self.0);
        write!(f, "NodeKey({})", short)
    }
}

impl std::str::FromStr for NodeKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// NodeSignature
// ---------------------------------------------------------------------------

/// An Ed25519 signature. Always 64 bytes when produced locally; anything
/// else received from the wire just fails verification.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSignature {
    bytes: Vec<u8>,
}

impl NodeSignature {
    /// Raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Hex form, as carried in reports and config files.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Parses a hex-encoded signature. Length is not checked here.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidSignature)?;
        Ok(Self { bytes })
    }
}

impl fmt::Debug for NodeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "NodeSignature({}..)", hex.get(..16).unwrap_or(&hex))
    }
}
