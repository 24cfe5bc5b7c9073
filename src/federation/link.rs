// # Federation Links
//
// Per-link state for one established connection to a remote peer:
//
// ```text
// Disconnected -> Connecting -> Connected -> {Syncing, Paused}
//                                  |                |
//                                  +----------------+--> Disconnected | Error
// ```
//
// `Error` is terminal (protocol mismatch, or the reconnect budget ran
// out). Everything here is link-private; the shared log and indexes are
// only touched through the peer.

use crate::common::{now_millis, Timestamp};
use crate::delta::Delta;
use crate::federation::messages::{FederationMessage, WireFrame};
use crate::federation::trust::TrustPolicy;
use crate::query::DeltaFilter;
use crate::{Result, RhizomeError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Direction a link moves deltas in, from the local peer's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    /// Local deltas flow out; inbound deltas are refused.
    Push,
    /// Remote deltas flow in; nothing is pushed.
    Pull,
    Bidirectional,
}

impl LinkMode {
    pub fn accepts_inbound(&self) -> bool {
        matches!(self, LinkMode::Pull | LinkMode::Bidirectional)
    }

    pub fn pushes_outbound(&self) -> bool {
        matches!(self, LinkMode::Push | LinkMode::Bidirectional)
    }
}

/// What a client requests right after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialSyncPolicy {
    Full,
    FromTimestamp,
    None,
}

/// Exponential backoff settings for client reconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    pub enabled: bool,
    /// 0 means retry forever.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// `min(initial_delay * multiplier^attempt, max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// True when another attempt is allowed after `attempt` failures.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempt < self.max_attempts)
    }
}

/// Per-link configuration.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub mode: LinkMode,
    pub initial_sync: InitialSyncPolicy,
    pub sync_from_timestamp: Option<Timestamp>,
    pub push_filter: Option<DeltaFilter>,
    pub pull_filter: Option<DeltaFilter>,
    pub trust_policy: Option<TrustPolicy>,
    pub reconnect: ReconnectConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mode: LinkMode::Bidirectional,
            initial_sync: InitialSyncPolicy::None,
            sync_from_timestamp: None,
            push_filter: None,
            pull_filter: None,
            trust_policy: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl LinkConfig {
    pub fn with_mode(mut self, mode: LinkMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_initial_sync(mut self, policy: InitialSyncPolicy) -> Self {
        self.initial_sync = policy;
        self
    }

    pub fn with_sync_from(mut self, timestamp: Timestamp) -> Self {
        self.initial_sync = InitialSyncPolicy::FromTimestamp;
        self.sync_from_timestamp = Some(timestamp);
        self
    }

    pub fn with_push_filter(mut self, filter: DeltaFilter) -> Self {
        self.push_filter = Some(filter);
        self
    }

    pub fn with_pull_filter(mut self, filter: DeltaFilter) -> Self {
        self.pull_filter = Some(filter);
        self
    }

    pub fn with_trust_policy(mut self, policy: TrustPolicy) -> Self {
        self.trust_policy = Some(policy);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Link lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Syncing,
    Paused,
    Error,
}

/// Per-link traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub deltas_sent: u64,
    pub deltas_received: u64,
    pub acks_received: u64,
    pub nacks_received: u64,
    pub nacks_sent: u64,
    pub sync_deltas_sent: u64,
    pub sync_deltas_received: u64,
    pub reconnect_attempts: u64,
    pub last_activity: Timestamp,
}

/// Shared handle to one federation link.
///
/// The link's I/O loop owns the transport; this handle carries the state,
/// the outbound queue, and the pause buffer.
pub struct FederationLink {
    pub id: String,
    pub config: LinkConfig,
    remote_system: RwLock<Option<String>>,
    state: RwLock<LinkState>,
    outbound: mpsc::Sender<WireFrame>,
    /// Remote asked us to pause; outbound deltas buffer in `pending`.
    paused: AtomicBool,
    pending: Mutex<VecDeque<Delta>>,
    stats: Mutex<LinkStats>,
    closed: AtomicBool,
    close_signal: tokio::sync::Notify,
}

/// Capacity of the outbound frame queue feeding the link's writer.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

impl FederationLink {
    pub fn new(config: LinkConfig) -> (std::sync::Arc<Self>, mpsc::Receiver<WireFrame>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let link = std::sync::Arc::new(Self {
            id: format!("link-{}", Uuid::new_v4()),
            config,
            remote_system: RwLock::new(None),
            state: RwLock::new(LinkState::Disconnected),
            outbound,
            paused: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            stats: Mutex::new(LinkStats::default()),
            closed: AtomicBool::new(false),
            close_signal: tokio::sync::Notify::new(),
        });
        (link, outbound_rx)
    }

    pub fn state(&self) -> LinkState {
        *self.state.read()
    }

    pub fn set_state(&self, state: LinkState) {
        let mut current = self.state.write();
        if *current != state {
            debug!(link = %self.id, from = ?*current, to = ?state, "link state change");
            *current = state;
        }
    }

    pub fn remote_system(&self) -> Option<String> {
        self.remote_system.read().clone()
    }

    pub fn set_remote_system<S: Into<String>>(&self, system: S) {
        *self.remote_system.write() = Some(system.into());
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Remote sent `pause`: buffer outbound deltas until `resume`.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.set_state(LinkState::Paused);
    }

    /// Remote sent `resume`: drain the pause buffer back into the
    /// outbound queue.
    pub async fn resume(&self) -> Result<()> {
        self.paused.store(false, Ordering::SeqCst);
        self.set_state(LinkState::Connected);
        let pending: Vec<Delta> = self.pending.lock().drain(..).collect();
        for delta in pending {
            self.send_delta(delta).await?;
        }
        Ok(())
    }

    /// True when this link should carry `delta` outward: the mode pushes,
    /// the push filter matches, and the delta did not arrive from this
    /// link's own remote (origin suppression).
    pub fn should_push(&self, delta: &Delta) -> bool {
        if !self.config.mode.pushes_outbound() {
            return false;
        }
        if let Some(remote) = self.remote_system.read().as_deref() {
            if delta.system == remote {
                return false;
            }
        }
        if let Some(filter) = &self.config.push_filter {
            if !filter.matches(delta) {
                return false;
            }
        }
        true
    }

    /// Offer a locally persisted delta to this link.
    pub async fn offer(&self, delta: Delta) -> Result<()> {
        if !self.should_push(&delta) {
            return Ok(());
        }
        if self.is_paused() {
            self.pending.lock().push_back(delta);
            return Ok(());
        }
        self.send_delta(delta).await
    }

    async fn send_delta(&self, delta: Delta) -> Result<()> {
        self.send_frame(WireFrame::new(FederationMessage::Delta { delta }))
            .await?;
        self.stats.lock().deltas_sent += 1;
        Ok(())
    }

    /// Queue any frame for the link's writer task.
    pub async fn send_frame(&self, frame: WireFrame) -> Result<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| RhizomeError::ConnectionLost(format!("link {} writer gone", self.id)))
    }

    pub fn stats(&self) -> LinkStats {
        *self.stats.lock()
    }

    pub fn record<F: FnOnce(&mut LinkStats)>(&self, update: F) {
        let mut stats = self.stats.lock();
        update(&mut stats);
        stats.last_activity = now_millis();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Ask the link's I/O loop to stop. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_signal.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Completes once [`FederationLink::close`] has been called.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.close_signal.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::DeltaBuilder;

    #[test]
    fn test_backoff_schedule() {
        let reconnect = ReconnectConfig {
            enabled: true,
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(450),
            backoff_multiplier: 2.0,
        };

        assert_eq!(reconnect.delay_for(0), Duration::from_millis(100));
        assert_eq!(reconnect.delay_for(1), Duration::from_millis(200));
        assert_eq!(reconnect.delay_for(2), Duration::from_millis(400));
        // Capped at max_delay.
        assert_eq!(reconnect.delay_for(3), Duration::from_millis(450));
        assert_eq!(reconnect.delay_for(10), Duration::from_millis(450));
    }

    #[test]
    fn test_attempt_budget() {
        let mut reconnect = ReconnectConfig::default();
        reconnect.max_attempts = 2;
        assert!(reconnect.allows_attempt(0));
        assert!(reconnect.allows_attempt(1));
        assert!(!reconnect.allows_attempt(2));

        reconnect.max_attempts = 0;
        assert!(reconnect.allows_attempt(1_000_000));

        reconnect.enabled = false;
        assert!(!reconnect.allows_attempt(0));
    }

    #[test]
    fn test_mode_direction() {
        assert!(LinkMode::Push.pushes_outbound());
        assert!(!LinkMode::Push.accepts_inbound());
        assert!(LinkMode::Pull.accepts_inbound());
        assert!(!LinkMode::Pull.pushes_outbound());
        assert!(LinkMode::Bidirectional.accepts_inbound());
        assert!(LinkMode::Bidirectional.pushes_outbound());
    }

    #[tokio::test]
    async fn test_should_push_origin_suppression() {
        let (link, _rx) = FederationLink::new(LinkConfig::default());
        link.set_remote_system("sys-remote");

        let local = DeltaBuilder::new("alice", "sys-local").build();
        let echoed = DeltaBuilder::new("alice", "sys-remote").build();
        assert!(link.should_push(&local));
        assert!(!link.should_push(&echoed));
    }

    #[tokio::test]
    async fn test_should_push_respects_mode_and_filter() {
        let (pull_link, _rx) =
            FederationLink::new(LinkConfig::default().with_mode(LinkMode::Pull));
        let delta = DeltaBuilder::new("alice", "sys-a").build();
        assert!(!pull_link.should_push(&delta));

        let (filtered, _rx) = FederationLink::new(
            LinkConfig::default().with_push_filter(DeltaFilter::new().with_author("bob")),
        );
        assert!(!filtered.should_push(&delta));
    }

    #[tokio::test]
    async fn test_pause_buffers_and_resume_drains() {
        let (link, mut rx) = FederationLink::new(LinkConfig::default());
        link.pause();
        assert_eq!(link.state(), LinkState::Paused);

        let delta = DeltaBuilder::new("alice", "sys-a").with_id("d-1").build();
        link.offer(delta).await.unwrap();
        assert_eq!(link.pending_count(), 1);
        assert!(rx.try_recv().is_err());

        link.resume().await.unwrap();
        assert_eq!(link.pending_count(), 0);
        let frame = rx.try_recv().unwrap();
        assert!(matches!(frame.message, FederationMessage::Delta { .. }));
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (link, _rx) = FederationLink::new(LinkConfig::default());
        assert_eq!(link.state(), LinkState::Disconnected);
        link.set_state(LinkState::Connecting);
        link.set_state(LinkState::Connected);
        link.set_state(LinkState::Syncing);
        assert_eq!(link.state(), LinkState::Syncing);
    }
}
