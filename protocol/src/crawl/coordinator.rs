//! # Crawl Coordinator
//!
//! Owns the lifecycle of every crawl instance this node has seen: whether
//! it is still running, the last message we sent for it and to whom, and
//! the two timers guarding that hop.
//!
//! ## Timers
//!
//! - **Ack timer**: short and fixed. Fires if the recipient did not even
//!   confirm receipt.
//! - **Response timer**: the crawl budget divided by the depth of the open
//!   call chain, so a deep walk cannot blow the overall budget.
//!
//! Every arm bumps the instance's hop counter and tags the timer with it. A
//! fire is only honoured if the slot it belongs to is still armed with the
//! same hop, so a timer that raced with a cancel is harmless.
//!
//! Timers are tokio tasks that report into an mpsc channel. Without a
//! channel or outside a runtime they are recorded but never fire on their
//! own, which is how the synchronous tests drive timeouts by hand.
//!
//! ## Locking
//!
//! One mutex covers the whole instance map. Traversal takes it through
//! [`CrawlCoordinator::lock`] for the full check-mutate-rearm sequence of a
//! hop, then releases it before sending anything.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::config::CrnConfig;
use crate::crypto::keys::NodeKey;
use crate::ledger::LedgerIndex;

use super::message::{CrawlInstanceKey, CrawlMessage};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Lifecycle of a crawl instance. Leaves `Running` exactly once: to
/// `Returned` on a participant, to one of the concluded states on the
/// initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrawlStatus {
    Running,
    /// This node handed the walk back to its parent and waits on nothing.
    Returned,
    Concluded,
    ForceConcluded,
}

impl CrawlStatus {
    /// Concluded or force-concluded. A `Returned` participant is not
    /// terminal; it still answers late requests for the instance.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Concluded | Self::ForceConcluded)
    }
}

/// Which of a hop's two timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerKind {
    Ack,
    Response,
}

/// A timer went off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub instance: CrawlInstanceKey,
    pub kind: TimerKind,
    pub hop: u64,
}

#[derive(Debug)]
struct ArmedTimer {
    hop: u64,
    task: Option<JoinHandle<()>>,
}

impl ArmedTimer {
    fn cancel(self) {
        if let Some(task) = self.task {
            task.abort();
        }
    }
}

/// Per-instance state.
#[derive(Debug)]
pub struct CrawlState {
    status: CrawlStatus,
    hop: u64,
    ack_timer: Option<ArmedTimer>,
    response_timer: Option<ArmedTimer>,
    last_message: Option<CrawlMessage>,
    last_recipient: Option<NodeKey>,
}

impl CrawlState {
    fn new() -> Self {
        Self {
            status: CrawlStatus::Running,
            hop: 0,
            ack_timer: None,
            response_timer: None,
            last_message: None,
            last_recipient: None,
        }
    }

    pub fn status(&self) -> CrawlStatus {
        self.status
    }

    pub fn is_concluded(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of hops armed so far.
    pub fn hop(&self) -> u64 {
        self.hop
    }

    /// The message we last sent for this instance and are waiting on.
    pub fn last_message(&self) -> Option<&CrawlMessage> {
        self.last_message.as_ref()
    }

    pub fn last_recipient(&self) -> Option<&NodeKey> {
        self.last_recipient.as_ref()
    }

    /// Hop tag of the armed timer of `kind`, if armed.
    pub fn armed_hop(&self, kind: TimerKind) -> Option<u64> {
        self.slot(kind).as_ref().map(|t| t.hop)
    }

    fn slot(&self, kind: TimerKind) -> &Option<ArmedTimer> {
        match kind {
            TimerKind::Ack => &self.ack_timer,
            TimerKind::Response => &self.response_timer,
        }
    }

    fn slot_mut(&mut self, kind: TimerKind) -> &mut Option<ArmedTimer> {
        match kind {
            TimerKind::Ack => &mut self.ack_timer,
            TimerKind::Response => &mut self.response_timer,
        }
    }

    fn cancel(&mut self, kind: TimerKind) {
        if let Some(timer) = self.slot_mut(kind).take() {
            timer.cancel();
        }
    }

    fn cancel_all(&mut self) {
        self.cancel(TimerKind::Ack);
        self.cancel(TimerKind::Response);
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Crawl instance registry and timer owner.
pub struct CrawlCoordinator {
    ack_timeout: Duration,
    crawl_budget: Duration,
    retention: LedgerIndex,
    instances: Mutex<HashMap<CrawlInstanceKey, CrawlState>>,
    timer_tx: Option<UnboundedSender<TimerFired>>,
}

impl CrawlCoordinator {
    pub fn new(config: &CrnConfig) -> Self {
        Self {
            ack_timeout: config.ack_timeout(),
            crawl_budget: config.crawl_budget(),
            retention: config.retention_ledgers(),
            instances: Mutex::new(HashMap::new()),
            timer_tx: None,
        }
    }

    /// Timer fires are delivered to `tx`.
    pub fn with_timer_channel(mut self, tx: UnboundedSender<TimerFired>) -> Self {
        self.timer_tx = Some(tx);
        self
    }

    /// Takes the instance-map lock for a multi-step update.
    pub fn lock(&self) -> CoordinatorGuard<'_> {
        CoordinatorGuard {
            coordinator: self,
            instances: self.instances.lock(),
        }
    }

    /// Registers `key` if new and prunes expired instances. Returns
    /// whether the instance was created.
    pub fn start_crawl(&self, key: &CrawlInstanceKey, current: LedgerIndex) -> bool {
        self.lock().start_crawl(key, current)
    }

    pub fn cancel_timer(&self, key: &CrawlInstanceKey, kind: TimerKind) {
        self.lock().cancel_timer(key, kind)
    }

    pub fn conclude(&self, key: &CrawlInstanceKey, force: bool) -> bool {
        self.lock().conclude(key, force)
    }

    pub fn is_concluded(&self, key: &CrawlInstanceKey) -> bool {
        self.lock().is_concluded(key)
    }

    pub fn status(&self, key: &CrawlInstanceKey) -> Option<CrawlStatus> {
        self.lock().state(key).map(|s| s.status())
    }

    /// Number of tracked instances, terminal ones included.
    pub fn instance_count(&self) -> usize {
        self.instances.lock().len()
    }

    /// Response-timer budget for a payload with `depth` open frames.
    pub fn response_budget(&self, depth: usize) -> Duration {
        self.crawl_budget / depth.max(1) as u32
    }

    fn arm(&self, key: &CrawlInstanceKey, kind: TimerKind, hop: u64, after: Duration) -> ArmedTimer {
        let task = match (&self.timer_tx, tokio::runtime::Handle::try_current()) {
            (Some(tx), Ok(handle)) => {
                let tx = tx.clone();
                let fired = TimerFired {
                    instance: key.clone(),
                    kind,
                    hop,
                };
                Some(handle.spawn(async move {
                    tokio::time::sleep(after).await;
                    // Receiver gone means the node is shutting down.
                    let _ = tx.send(fired);
                }))
            }
            _ => None,
        };
        ArmedTimer { hop, task }
    }
}

/// Exclusive access to the instance map.
pub struct CoordinatorGuard<'a> {
    coordinator: &'a CrawlCoordinator,
    instances: MutexGuard<'a, HashMap<CrawlInstanceKey, CrawlState>>,
}

impl CoordinatorGuard<'_> {
    /// See [`CrawlCoordinator::start_crawl`]. An instance already outside
    /// the retention window is not registered.
    pub fn start_crawl(&mut self, key: &CrawlInstanceKey, current: LedgerIndex) -> bool {
        self.prune(current);
        if self.instances.contains_key(key) || self.expired(key, current) {
            return false;
        }
        self.instances.insert(key.clone(), CrawlState::new());
        info!(instance = %key, "crawl instance registered");
        true
    }

    pub fn state(&self, key: &CrawlInstanceKey) -> Option<&CrawlState> {
        self.instances.get(key)
    }

    /// Terminal-state gate. Unknown instances are not concluded.
    pub fn is_concluded(&self, key: &CrawlInstanceKey) -> bool {
        self.instances.get(key).map_or(false, CrawlState::is_concluded)
    }

    /// Arms both timers for a hop to `recipient` and remembers `payload`
    /// for timeout replay. Returns the new hop tag.
    pub fn restart_timers(
        &mut self,
        key: &CrawlInstanceKey,
        recipient: &NodeKey,
        payload: &CrawlMessage,
    ) -> Option<u64> {
        let coordinator = self.coordinator;
        let state = self.instances.get_mut(key)?;
        if state.is_concluded() {
            return None;
        }
        state.cancel_all();
        state.hop += 1;
        let hop = state.hop;
        let response_after = coordinator.response_budget(payload.dfs.len());
        state.ack_timer = Some(coordinator.arm(key, TimerKind::Ack, hop, coordinator.ack_timeout));
        state.response_timer = Some(coordinator.arm(key, TimerKind::Response, hop, response_after));
        state.last_message = Some(payload.clone());
        state.last_recipient = Some(recipient.clone());
        trace!(
            instance = %key,
            peer = %recipient,
            hop,
            response_ms = response_after.as_millis() as u64,
            "crawl timers armed"
        );
        Some(hop)
    }

    /// Idempotent.
    pub fn cancel_timer(&mut self, key: &CrawlInstanceKey, kind: TimerKind) {
        if let Some(state) = self.instances.get_mut(key) {
            state.cancel(kind);
        }
    }

    /// Cancels both timers and forgets the pending hop. Used when this
    /// node hands the walk back to its parent.
    pub fn clear_pending(&mut self, key: &CrawlInstanceKey) {
        if let Some(state) = self.instances.get_mut(key) {
            state.cancel_all();
            state.last_message = None;
            state.last_recipient = None;
        }
    }

    /// Removes and returns the pending hop, cancelling its timers.
    pub fn take_pending(&mut self, key: &CrawlInstanceKey) -> Option<(NodeKey, CrawlMessage)> {
        let state = self.instances.get_mut(key)?;
        state.cancel_all();
        let recipient = state.last_recipient.take()?;
        let message = state.last_message.take()?;
        Some((recipient, message))
    }

    /// Whether `fired` still matches an armed timer of a running instance.
    pub fn timer_is_current(&self, fired: &TimerFired) -> bool {
        self.instances.get(&fired.instance).map_or(false, |s| {
            !s.is_concluded() && s.armed_hop(fired.kind) == Some(fired.hop)
        })
    }

    /// Marks a participant's instance as handed back. Only a running
    /// instance moves; returns whether it did.
    pub fn mark_returned(&mut self, key: &CrawlInstanceKey) -> bool {
        let Some(state) = self.instances.get_mut(key) else {
            return false;
        };
        if state.status != CrawlStatus::Running {
            return false;
        }
        state.cancel_all();
        state.last_message = None;
        state.last_recipient = None;
        state.status = CrawlStatus::Returned;
        debug!(instance = %key, "crawl handed back to parent");
        true
    }

    /// Moves `key` to a terminal state. Returns `false` if it already was
    /// terminal or is unknown.
    pub fn conclude(&mut self, key: &CrawlInstanceKey, force: bool) -> bool {
        let Some(state) = self.instances.get_mut(key) else {
            return false;
        };
        if state.is_concluded() {
            debug!(instance = %key, "crawl already concluded");
            return false;
        }
        state.cancel_all();
        state.last_recipient = None;
        state.status = if force {
            CrawlStatus::ForceConcluded
        } else {
            CrawlStatus::Concluded
        };
        info!(instance = %key, forced = force, "crawl concluded");
        true
    }

    fn expired(&self, key: &CrawlInstanceKey, current: LedgerIndex) -> bool {
        key.start_ledger.saturating_add(self.coordinator.retention) < current
    }

    fn prune(&mut self, current: LedgerIndex) {
        let retention = self.coordinator.retention;
        let before = self.instances.len();
        self.instances.retain(|key, state| {
            let keep = key.start_ledger.saturating_add(retention) >= current;
            if !keep {
                state.cancel_all();
            }
            keep
        });
        let pruned = before - self.instances.len();
        if pruned > 0 {
            debug!(pruned, current, "expired crawl instances pruned");
        }
    }
}
