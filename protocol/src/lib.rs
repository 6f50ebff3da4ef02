// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # CRN Protocol: Core Library
//!
//! Relay nodes (CRNs) earn a share of the network fees for staying online
//! and answering quickly. Nobody hands out that money centrally: every node
//! periodically crawls the live overlay depth-first, collects each relay
//! node's self-reported performance, decides who is eligible, and votes.
//!
//! ## Architecture
//!
//! Leaves first:
//!
//! - **crypto**: Ed25519 node keys and domain signatures.
//! - **identity**: A relay node's (key, domain, signature, account) tuple.
//! - **ledger**: The two questions we ask of validated ledger state.
//! - **performance**: Operating-mode time accounting and the report built
//!   from it.
//! - **registry**: The trusted relay-node key list.
//! - **crawl**: The DFS crawl: messages, per-instance lifecycle and timers,
//!   hop-by-hop traversal, and eligibility checks at conclusion.
//! - **tally**: Threshold vote over eligibility and the fee split.
//! - **network**: Peer directory seam, overlay envelope, and the
//!   [`RelayNode`](network::RelayNode) runtime that wires it all together.
//! - **config**: Protocol constants and [`CrnConfig`](config::CrnConfig).
//!
//! ## Design Philosophy
//!
//! 1. No central coordinator. Each node crawls and tallies on its own.
//! 2. A dead peer never blocks a crawl. Timeouts are data, not errors.
//! 3. No globals. Services are constructed once and shared by `Arc`.
//! 4. Nothing in here does I/O. Sends go through the peer directory seam.

pub mod config;
pub mod crawl;
pub mod crypto;
pub mod identity;
pub mod ledger;
pub mod network;
pub mod performance;
pub mod registry;
pub mod tally;
