//! # Cryptographic Primitives
//!
//! Thin wrappers over `ed25519-dalek`: node keypairs, the textual
//! [`NodeKey`] used as overlay identity, and domain signatures.
//!
//! Nothing here is clever. Every operation delegates to the audited crate
//! and failures collapse to booleans or small error enums.

pub mod keys;
pub mod signatures;

pub use keys::{KeyError, NodeKey, NodeKeypair, NodeSignature};
pub use signatures::{sign_domain, verify_domain, SignatureError};
