//! # Network Module
//!
//! The boundary between the CRN services and the surrounding relay node.
//!
//! ## Architecture
//!
//! ```text
//! overlay.rs  - peer directory trait and the CRN wire messages
//! node.rs     - RelayNode: owns the services, routes messages and timers
//! ```
//!
//! ## Design Decisions
//!
//! - The protocol crate never opens a socket. The host supplies a
//!   [`PeerDirectory`] and delivers inbound messages to
//!   [`RelayNode::on_message`]; that keeps crawls testable with a purely
//!   in-memory overlay.
//! - Timers are delivered the same way, through an unbounded channel the
//!   host drains into [`RelayNode::on_timer`].

pub mod node;
pub mod overlay;

pub use node::{NodeError, NodeEvent, RelayNode};
pub use overlay::{OverlayMessage, PeerDirectory, PeerInfo};
