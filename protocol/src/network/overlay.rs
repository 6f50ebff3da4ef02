//! # Overlay Seam
//!
//! The crawl does not own connections. It asks a [`PeerDirectory`] who is
//! reachable and hands it messages to deliver. Delivery is fire-and-forget:
//! a lost message is indistinguishable from a dead peer, and the crawl's
//! timers already handle that.
//!
//! Wire encoding is the transport's business. [`OverlayMessage`] is
//! serde-serializable so any codec can carry it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crawl::message::{CrawlAck, CrawlMessage};
use crate::crypto::keys::NodeKey;
use crate::performance::report::PerformanceReport;

// ---------------------------------------------------------------------------
// Peer Info
// ---------------------------------------------------------------------------

/// A connected peer as the directory sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// The peer's node key.
    pub key: NodeKey,
    /// Last measured round-trip latency, if any.
    pub latency: Option<Duration>,
}

impl PeerInfo {
    pub fn new(key: NodeKey) -> Self {
        Self { key, latency: None }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

// ---------------------------------------------------------------------------
// Overlay Messages
// ---------------------------------------------------------------------------

/// Everything this crate sends over the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverlayMessage {
    /// A crawl hop, request or response.
    Crawl(CrawlMessage),
    /// Receipt of a crawl request.
    CrawlAck(CrawlAck),
    /// Redacted performance report gossip.
    ReportState(PerformanceReport),
}

impl OverlayMessage {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Crawl(m) if m.is_request() => "crawl_request",
            Self::Crawl(_) => "crawl_response",
            Self::CrawlAck(_) => "crawl_ack",
            Self::ReportState(_) => "report_state",
        }
    }
}

// ---------------------------------------------------------------------------
// Peer Directory
// ---------------------------------------------------------------------------

/// Peer discovery and delivery, provided by the transport.
pub trait PeerDirectory: Send + Sync {
    /// Every currently connected peer.
    fn active_peers(&self) -> Vec<PeerInfo>;

    /// Connected peers considered healthy (in sync, not misbehaving).
    /// Latency for our own report is measured over these.
    fn sane_peers(&self) -> Vec<PeerInfo>;

    /// Queues `message` for `peer`. Never blocks, never reports failure.
    fn send(&self, peer: &NodeKey, message: OverlayMessage);
}
