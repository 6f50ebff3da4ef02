//! # Prometheus Metrics
//!
//! Crawl and eligibility counters for the node. All metrics live in a
//! dedicated [`prometheus::Registry`] under the `crn` prefix.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crn_protocol::crawl::CrawlOutcome;

/// Holds all Prometheus metric handles for the node.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    pub crawls_started: IntCounter,
    pub crawls_concluded: IntCounter,
    pub crawls_force_concluded: IntCounter,
    /// Hops given up on after an ack or response timeout.
    pub hop_timeouts: IntCounter,
    /// Crawl messages and timer fires dropped without effect.
    pub messages_dropped: IntCounter,
    /// Eligible nodes in the most recent position.
    pub eligible_nodes: IntGauge,
}

impl NodeMetrics {
    /// Creates and registers all metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("crn".into()), None)?;

        let crawls_started = IntCounter::new("crawls_started_total", "Crawls initiated by this node")?;
        registry.register(Box::new(crawls_started.clone()))?;

        let crawls_concluded =
            IntCounter::new("crawls_concluded_total", "Crawls that walked back to the initiator")?;
        registry.register(Box::new(crawls_concluded.clone()))?;

        let crawls_force_concluded = IntCounter::new(
            "crawls_force_concluded_total",
            "Crawls cut short before the next reporting boundary",
        )?;
        registry.register(Box::new(crawls_force_concluded.clone()))?;

        let hop_timeouts = IntCounter::new("hop_timeouts_total", "Crawl hops skipped after a timeout")?;
        registry.register(Box::new(hop_timeouts.clone()))?;

        let messages_dropped =
            IntCounter::new("messages_dropped_total", "Crawl events dropped without effect")?;
        registry.register(Box::new(messages_dropped.clone()))?;

        let eligible_nodes =
            IntGauge::new("eligible_nodes", "Eligible relay nodes in the last concluded crawl")?;
        registry.register(Box::new(eligible_nodes.clone()))?;

        Ok(Self {
            registry,
            crawls_started,
            crawls_concluded,
            crawls_force_concluded,
            hop_timeouts,
            messages_dropped,
            eligible_nodes,
        })
    }

    /// Records a crawl outcome.
    pub fn observe(&self, outcome: &CrawlOutcome) {
        match outcome {
            CrawlOutcome::Concluded {
                forced, eligibility, ..
            } => {
                if *forced {
                    self.crawls_force_concluded.inc();
                } else {
                    self.crawls_concluded.inc();
                }
                self.eligible_nodes
                    .set(eligibility.values().filter(|e| **e).count() as i64);
            }
            CrawlOutcome::Dropped(_) => self.messages_dropped.inc(),
            _ => {}
        }
    }

    /// Records the result of a timer fire.
    pub fn observe_timer(&self, outcome: &CrawlOutcome) {
        if !outcome.is_dropped() {
            self.hop_timeouts.inc();
        }
        self.observe(outcome);
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
