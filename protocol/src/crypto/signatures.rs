//! # Domain Signatures
//!
//! A relay node proves that it controls the domain it advertises by signing
//! the domain name with its node key. The signature travels inside every
//! performance report and is re-checked by whoever concludes a crawl.
//!
//! The signed message is the raw UTF-8 domain string. Nothing else is
//! bound into it, so one signature stays valid for the lifetime of the
//! (key, domain) pair.

use thiserror::Error;

use super::keys::{NodeKey, NodeKeypair, NodeSignature};

/// Errors during signature operations.
///
/// Kept coarse: callers mostly need a yes/no, and the eligibility path
/// maps every variant to "ineligible".
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature verification failed")]
    VerificationFailed,

    #[error("signature is not valid hex")]
    MalformedSignature,

    #[error("empty domain")]
    EmptyDomain,
}

/// Sign a domain name with the node's keypair.
pub fn sign_domain(keypair: &NodeKeypair, domain: &str) -> NodeSignature {
    keypair.sign(domain.as_bytes())
}

/// Verify a hex-encoded domain signature as it appears in reports and
/// config files.
pub fn verify_domain(key: &NodeKey, domain: &str, signature_hex: &str) -> Result<(), SignatureError> {
    if domain.is_empty() {
        return Err(SignatureError::EmptyDomain);
    }
    let signature =
        NodeSignature::from_hex(signature_hex).map_err(|_| SignatureError::MalformedSignature)?;
    if key.verify(domain.as_bytes(), &signature) {
        Ok(())
    } else {
        Err(SignatureError::VerificationFailed)
    }
}
