// # Federation Peer
//
// Binds a database instance to a set of links. The peer forwards every
// locally persisted delta to its links (gated by per-link mode, push
// filter, and origin suppression), verifies inbound deltas against the
// link's trust policy before persisting them, streams initial sync in
// ascending-timestamp batches, answers the ping/pong heartbeat, and
// reconnects dropped client links with exponential backoff.
//
// Every link runs one I/O task that owns its transport. Protocol errors
// marked `fatal` terminate the link; everything else is link-local.

use crate::database::RhizomeDb;
use crate::delta::Delta;
use crate::federation::link::{
    FederationLink, InitialSyncPolicy, LinkConfig, LinkState,
};
use crate::federation::messages::{
    FederationMessage, PeerAnnouncement, WireFrame, PROTOCOL_VERSION,
};
use crate::federation::transport::{self, MessageTransport};
use crate::{Result, RhizomeError};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Deltas per `sync_batch` frame.
pub const SYNC_BATCH_SIZE: usize = 100;

/// Peer-wide timeout and heartbeat settings.
#[derive(Debug, Clone)]
pub struct PeerSettings {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// No inbound traffic for this long closes the link.
    pub heartbeat_timeout: Duration,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

/// Why a link's I/O loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkExit {
    /// Closed on purpose from this side.
    Clean,
    /// Transport failed or the remote went away; reconnect may apply.
    Lost,
    /// Fatal protocol error; never reconnect.
    Fatal,
}

enum FrameOutcome {
    Continue,
    Fatal,
}

/// One database's presence in the federation.
pub struct FederationPeer {
    db: RhizomeDb,
    settings: PeerSettings,
    links: DashMap<String, Arc<FederationLink>>,
}

impl FederationPeer {
    pub fn new(db: RhizomeDb) -> Arc<Self> {
        Self::with_settings(db, PeerSettings::default())
    }

    pub fn with_settings(db: RhizomeDb, settings: PeerSettings) -> Arc<Self> {
        let peer = Arc::new(Self {
            db,
            settings,
            links: DashMap::new(),
        });
        peer.spawn_outbound_forwarder();
        peer
    }

    pub fn system_id(&self) -> &str {
        self.db.system_id()
    }

    pub fn link(&self, id: &str) -> Option<Arc<FederationLink>> {
        self.links.get(id).map(|l| Arc::clone(&l))
    }

    pub fn links(&self) -> Vec<Arc<FederationLink>> {
        self.links.iter().map(|l| Arc::clone(&l)).collect()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Close a link and forget it.
    pub fn disconnect(&self, link_id: &str) -> bool {
        if let Some((_, link)) = self.links.remove(link_id) {
            link.close();
            link.set_state(LinkState::Disconnected);
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // Outbound fan-out
    // ------------------------------------------------------------------

    /// Forward every locally persisted delta to every link.
    fn spawn_outbound_forwarder(self: &Arc<Self>) {
        let peer = Arc::clone(self);
        let mut rx = self.db.subscribe_broadcast();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(delta) => peer.offer_to_links(delta).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "federation forwarder lagged; deltas not pushed");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn offer_to_links(&self, delta: Delta) {
        for entry in self.links.iter() {
            let link = Arc::clone(&entry);
            if let Err(e) = link.offer(delta.clone()).await {
                warn!(link = %link.id, error = %e, "failed to offer delta to link");
            }
        }
    }

    // ------------------------------------------------------------------
    // Client side
    // ------------------------------------------------------------------

    /// Establish a client link over an arbitrary transport. No reconnect:
    /// when the transport dies the link ends.
    pub async fn connect_with<T>(
        self: &Arc<Self>,
        mut transport: T,
        config: LinkConfig,
    ) -> Result<Arc<FederationLink>>
    where
        T: MessageTransport + 'static,
    {
        let (link, outbound_rx) = FederationLink::new(config);
        link.set_state(LinkState::Connecting);
        self.client_handshake(&link, &mut transport).await?;
        link.set_state(LinkState::Connected);
        self.request_initial_sync(&link).await?;

        self.links.insert(link.id.clone(), Arc::clone(&link));
        self.spawn_static_loop(Arc::clone(&link), transport, outbound_rx);
        Ok(link)
    }

    /// Dial a WebSocket federation endpoint and keep the link alive with
    /// the configured reconnect policy.
    pub async fn connect_ws(
        self: &Arc<Self>,
        url: &str,
        config: LinkConfig,
    ) -> Result<Arc<FederationLink>> {
        let mut transport = timeout(self.settings.connect_timeout, transport::connect_ws(url))
            .await
            .map_err(|_| RhizomeError::Timeout(format!("connecting to {url}")))??;

        let (link, outbound_rx) = FederationLink::new(config);
        link.set_state(LinkState::Connecting);
        self.client_handshake(&link, &mut transport).await?;
        link.set_state(LinkState::Connected);
        self.request_initial_sync(&link).await?;

        self.links.insert(link.id.clone(), Arc::clone(&link));
        let peer = Arc::clone(self);
        let supervised = Arc::clone(&link);
        let url = url.to_string();
        tokio::spawn(async move {
            peer.supervise_ws(supervised, transport, outbound_rx, url).await;
        });
        Ok(link)
    }

    async fn client_handshake<T: MessageTransport>(
        &self,
        link: &Arc<FederationLink>,
        transport: &mut T,
    ) -> Result<()> {
        transport
            .send(WireFrame::new(FederationMessage::Hello {
                system_id: self.db.system_id().to_string(),
                config: PeerAnnouncement {
                    mode: link.config.mode,
                    initial_sync: link.config.initial_sync,
                },
                protocol: PROTOCOL_VERSION.to_string(),
            }))
            .await?;

        let frame = timeout(self.settings.handshake_timeout, transport.recv())
            .await
            .map_err(|_| RhizomeError::Timeout("handshake".to_string()))??
            .ok_or_else(|| {
                RhizomeError::ConnectionLost("closed during handshake".to_string())
            })?;

        match frame.message {
            FederationMessage::HelloAck {
                system_id,
                protocol,
                link_id,
            } => {
                if protocol != PROTOCOL_VERSION {
                    return Err(RhizomeError::ProtocolMismatch {
                        local: PROTOCOL_VERSION.to_string(),
                        remote: protocol,
                    });
                }
                debug!(link = %link.id, remote_link = %link_id, remote = %system_id,
                    "handshake complete");
                link.set_remote_system(system_id);
                Ok(())
            }
            FederationMessage::Error { code, message, .. } if code == "PROTOCOL_MISMATCH" => {
                Err(RhizomeError::ProtocolMismatch {
                    local: PROTOCOL_VERSION.to_string(),
                    remote: message,
                })
            }
            other => Err(RhizomeError::Federation(format!(
                "expected hello_ack, got {}",
                other.kind()
            ))),
        }
    }

    async fn request_initial_sync(&self, link: &Arc<FederationLink>) -> Result<()> {
        let message = match link.config.initial_sync {
            InitialSyncPolicy::None => return Ok(()),
            InitialSyncPolicy::Full => FederationMessage::SyncRequest {
                filter: link.config.pull_filter.clone(),
                from_timestamp: None,
            },
            InitialSyncPolicy::FromTimestamp => FederationMessage::SyncRequest {
                filter: link.config.pull_filter.clone(),
                from_timestamp: link.config.sync_from_timestamp,
            },
        };
        link.set_state(LinkState::Syncing);
        link.send_frame(WireFrame::new(message)).await
    }

    // ------------------------------------------------------------------
    // Server side
    // ------------------------------------------------------------------

    /// Handle one inbound connection: wait for `hello`, answer
    /// `hello_ack`, then run the link.
    pub async fn accept_with<T>(
        self: &Arc<Self>,
        mut transport: T,
        config: LinkConfig,
    ) -> Result<Arc<FederationLink>>
    where
        T: MessageTransport + 'static,
    {
        let frame = timeout(self.settings.handshake_timeout, transport.recv())
            .await
            .map_err(|_| RhizomeError::Timeout("handshake".to_string()))??
            .ok_or_else(|| {
                RhizomeError::ConnectionLost("closed during handshake".to_string())
            })?;

        let (system_id, protocol) = match frame.message {
            FederationMessage::Hello {
                system_id, protocol, ..
            } => (system_id, protocol),
            other => {
                return Err(RhizomeError::Federation(format!(
                    "expected hello, got {}",
                    other.kind()
                )))
            }
        };

        if protocol != PROTOCOL_VERSION {
            let _ = transport
                .send(WireFrame::new(FederationMessage::Error {
                    code: "PROTOCOL_MISMATCH".to_string(),
                    message: format!("server speaks {PROTOCOL_VERSION}"),
                    fatal: true,
                }))
                .await;
            let _ = transport.close().await;
            return Err(RhizomeError::ProtocolMismatch {
                local: PROTOCOL_VERSION.to_string(),
                remote: protocol,
            });
        }

        let (link, outbound_rx) = FederationLink::new(config);
        link.set_remote_system(&system_id);
        transport
            .send(WireFrame::new(FederationMessage::HelloAck {
                system_id: self.db.system_id().to_string(),
                link_id: link.id.clone(),
                protocol,
            }))
            .await?;
        link.set_state(LinkState::Connected);
        info!(link = %link.id, remote = %system_id, "accepted federation link");

        self.links.insert(link.id.clone(), Arc::clone(&link));
        self.spawn_static_loop(Arc::clone(&link), transport, outbound_rx);
        Ok(link)
    }

    /// Accept loop for inbound WebSocket peers. Runs until the listener
    /// fails; callers usually spawn it.
    pub async fn serve_ws(
        self: &Arc<Self>,
        listener: TcpListener,
        config: LinkConfig,
    ) -> Result<()> {
        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| RhizomeError::ConnectionLost(format!("accept: {e}")))?;
            debug!(%addr, "inbound federation connection");

            let peer = Arc::clone(self);
            let link_config = config.clone();
            tokio::spawn(async move {
                match transport::accept_ws(stream).await {
                    Ok(ws) => {
                        if let Err(e) = peer.accept_with(ws, link_config).await {
                            warn!(%addr, error = %e, "federation handshake failed");
                        }
                    }
                    Err(e) => warn!(%addr, error = %e, "websocket upgrade failed"),
                }
            });
        }
    }

    // ------------------------------------------------------------------
    // Link I/O loop
    // ------------------------------------------------------------------

    /// Single run: the link ends when its transport does.
    fn spawn_static_loop<T>(
        self: &Arc<Self>,
        link: Arc<FederationLink>,
        mut transport: T,
        mut outbound_rx: mpsc::Receiver<WireFrame>,
    ) where
        T: MessageTransport + 'static,
    {
        let peer = Arc::clone(self);
        tokio::spawn(async move {
            let exit = peer.run_link(&link, &mut transport, &mut outbound_rx).await;
            let _ = transport.close().await;
            link.set_state(match exit {
                LinkExit::Fatal => LinkState::Error,
                LinkExit::Clean | LinkExit::Lost => LinkState::Disconnected,
            });
            peer.links.remove(&link.id);
        });
    }

    /// Client link over WebSocket with reconnect supervision.
    async fn supervise_ws(
        self: Arc<Self>,
        link: Arc<FederationLink>,
        mut transport: transport::WsClientTransport,
        mut outbound_rx: mpsc::Receiver<WireFrame>,
        url: String,
    ) {
        let mut attempt: u32 = 0;
        'link: loop {
            let exit = self.run_link(&link, &mut transport, &mut outbound_rx).await;
            let _ = transport.close().await;

            match exit {
                LinkExit::Clean => {
                    link.set_state(LinkState::Disconnected);
                    break;
                }
                LinkExit::Fatal => {
                    link.set_state(LinkState::Error);
                    break;
                }
                LinkExit::Lost => {
                    link.set_state(LinkState::Disconnected);

                    // Exponential backoff until a connection sticks or the
                    // attempt budget runs out.
                    loop {
                        if !link.config.reconnect.allows_attempt(attempt) {
                            warn!(link = %link.id, "reconnect budget exhausted");
                            link.set_state(LinkState::Error);
                            break 'link;
                        }
                        let delay = link.config.reconnect.delay_for(attempt);
                        attempt += 1;
                        link.record(|s| s.reconnect_attempts += 1);
                        debug!(link = %link.id, attempt, ?delay, "reconnecting");
                        tokio::time::sleep(delay).await;

                        match self.reestablish(&url, &link).await {
                            Ok(fresh) => {
                                transport = fresh;
                                // Counter resets on successful handshake.
                                attempt = 0;
                                continue 'link;
                            }
                            Err(e) => {
                                warn!(link = %link.id, error = %e, "reconnect failed");
                            }
                        }
                    }
                }
            }
        }
        self.links.remove(&link.id);
    }

    async fn reestablish(
        &self,
        url: &str,
        link: &Arc<FederationLink>,
    ) -> Result<transport::WsClientTransport> {
        link.set_state(LinkState::Connecting);
        let mut fresh = timeout(self.settings.connect_timeout, transport::connect_ws(url))
            .await
            .map_err(|_| RhizomeError::Timeout(format!("reconnecting to {url}")))??;
        self.client_handshake(link, &mut fresh).await?;
        link.set_state(LinkState::Connected);
        self.request_initial_sync(link).await?;
        Ok(fresh)
    }

    async fn run_link<T: MessageTransport>(
        &self,
        link: &Arc<FederationLink>,
        transport: &mut T,
        outbound_rx: &mut mpsc::Receiver<WireFrame>,
    ) -> LinkExit {
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; consume it.
        heartbeat.tick().await;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = link.wait_closed() => return LinkExit::Clean,

                maybe_frame = outbound_rx.recv() => match maybe_frame {
                    Some(frame) => {
                        if transport.send(frame).await.is_err() {
                            return LinkExit::Lost;
                        }
                    }
                    None => return LinkExit::Clean,
                },

                inbound = transport.recv() => match inbound {
                    Ok(Some(frame)) => {
                        last_seen = Instant::now();
                        match self.handle_frame(link, transport, frame).await {
                            Ok(FrameOutcome::Continue) => {}
                            Ok(FrameOutcome::Fatal) => return LinkExit::Fatal,
                            Err(e) => {
                                warn!(link = %link.id, error = %e, "frame handling failed");
                            }
                        }
                    }
                    Ok(None) => return LinkExit::Lost,
                    Err(e) => {
                        warn!(link = %link.id, error = %e, "transport error");
                        return LinkExit::Lost;
                    }
                },

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > self.settings.heartbeat_timeout {
                        warn!(link = %link.id, "heartbeat timeout; closing link");
                        return LinkExit::Lost;
                    }
                    if transport
                        .send(WireFrame::new(FederationMessage::Ping))
                        .await
                        .is_err()
                    {
                        return LinkExit::Lost;
                    }
                }
            }
        }
    }

    async fn handle_frame<T: MessageTransport>(
        &self,
        link: &Arc<FederationLink>,
        transport: &mut T,
        frame: WireFrame,
    ) -> Result<FrameOutcome> {
        match frame.message {
            FederationMessage::Delta { delta } => {
                self.handle_inbound_delta(link, transport, delta).await?;
            }
            FederationMessage::DeltaAck { delta_id } => {
                debug!(link = %link.id, delta = %delta_id, "delta acknowledged");
                link.record(|s| s.acks_received += 1);
            }
            FederationMessage::DeltaNack { delta_id, reason } => {
                warn!(link = %link.id, delta = %delta_id, %reason, "delta refused by peer");
                link.record(|s| s.nacks_received += 1);
            }
            FederationMessage::SyncRequest {
                filter,
                from_timestamp,
            } => {
                self.stream_sync(link, transport, filter, from_timestamp)
                    .await?;
            }
            FederationMessage::SyncStart {
                total_deltas,
                batch_size,
            } => {
                debug!(link = %link.id, total_deltas, batch_size, "initial sync started");
                link.set_state(LinkState::Syncing);
            }
            FederationMessage::SyncBatch { deltas, .. } => {
                self.handle_sync_batch(link, deltas).await;
            }
            FederationMessage::SyncComplete { deltas_processed } => {
                info!(link = %link.id, deltas_processed, "initial sync complete");
                link.set_state(LinkState::Connected);
            }
            FederationMessage::Pause => link.pause(),
            FederationMessage::Resume => link.resume().await?,
            FederationMessage::Ping => {
                transport
                    .send(WireFrame::new(FederationMessage::Pong))
                    .await?;
            }
            FederationMessage::Pong => {}
            FederationMessage::Error {
                code,
                message,
                fatal,
            } => {
                warn!(link = %link.id, %code, %message, fatal, "peer error");
                if fatal {
                    return Ok(FrameOutcome::Fatal);
                }
            }
            FederationMessage::Hello { .. } | FederationMessage::HelloAck { .. } => {
                warn!(link = %link.id, "unexpected handshake frame mid-stream");
            }
        }
        Ok(FrameOutcome::Continue)
    }

    async fn handle_inbound_delta<T: MessageTransport>(
        &self,
        link: &Arc<FederationLink>,
        transport: &mut T,
        delta: Delta,
    ) -> Result<()> {
        let delta_id = delta.id.clone();

        let rejection = if !link.config.mode.accepts_inbound() {
            Some("push-mode link does not accept inbound deltas".to_string())
        } else if link
            .config
            .pull_filter
            .as_ref()
            .is_some_and(|f| !f.matches(&delta))
        {
            Some("rejected by pull filter".to_string())
        } else if let Some(reason) = link
            .config
            .trust_policy
            .as_ref()
            .and_then(|p| p.verify(&delta).err())
        {
            Some(reason)
        } else {
            None
        };

        if let Some(reason) = rejection {
            link.record(|s| s.nacks_sent += 1);
            return transport
                .send(WireFrame::new(FederationMessage::DeltaNack {
                    delta_id,
                    reason,
                }))
                .await;
        }

        match self.db.persist_remote(delta).await {
            Ok(_) => {
                link.record(|s| s.deltas_received += 1);
                transport
                    .send(WireFrame::new(FederationMessage::DeltaAck { delta_id }))
                    .await
            }
            Err(e) => {
                link.record(|s| s.nacks_sent += 1);
                transport
                    .send(WireFrame::new(FederationMessage::DeltaNack {
                        delta_id,
                        reason: e.to_string(),
                    }))
                    .await
            }
        }
    }

    /// Serve a peer's `sync_request`: matching deltas, ascending by
    /// timestamp, in batches.
    async fn stream_sync<T: MessageTransport>(
        &self,
        link: &Arc<FederationLink>,
        transport: &mut T,
        filter: Option<crate::query::DeltaFilter>,
        from_timestamp: Option<u64>,
    ) -> Result<()> {
        link.set_state(LinkState::Syncing);

        let mut deltas = self.db.storage().scan_all(None).await?;
        if let Some(from) = from_timestamp {
            deltas.retain(|d| d.timestamp >= from);
        }
        if let Some(filter) = &filter {
            deltas.retain(|d| filter.matches(d));
        }
        deltas.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));

        let total = deltas.len();
        transport
            .send(WireFrame::new(FederationMessage::SyncStart {
                total_deltas: total,
                batch_size: SYNC_BATCH_SIZE,
            }))
            .await?;

        let batch_count = deltas.len().div_ceil(SYNC_BATCH_SIZE).max(1);
        for (batch_number, chunk) in deltas.chunks(SYNC_BATCH_SIZE).enumerate() {
            link.record(|s| s.sync_deltas_sent += chunk.len() as u64);
            transport
                .send(WireFrame::new(FederationMessage::SyncBatch {
                    batch_number,
                    is_last_batch: batch_number + 1 == batch_count,
                    deltas: chunk.to_vec(),
                }))
                .await?;
        }

        transport
            .send(WireFrame::new(FederationMessage::SyncComplete {
                deltas_processed: total,
            }))
            .await?;
        link.set_state(LinkState::Connected);
        info!(link = %link.id, total, "served initial sync");
        Ok(())
    }

    /// Apply one inbound sync batch: trust gate, then persist. Rejected
    /// deltas are dropped with a warning (sync has no per-delta acks).
    async fn handle_sync_batch(&self, link: &Arc<FederationLink>, deltas: Vec<Delta>) {
        for delta in deltas {
            if let Some(reason) = link
                .config
                .trust_policy
                .as_ref()
                .and_then(|p| p.verify(&delta).err())
            {
                warn!(link = %link.id, delta = %delta.id, %reason, "sync delta rejected");
                continue;
            }
            match self.db.persist_remote(delta).await {
                Ok(_) => link.record(|s| s.sync_deltas_received += 1),
                Err(e) => warn!(link = %link.id, error = %e, "sync delta failed to persist"),
            }
        }
    }
}

impl std::fmt::Debug for FederationPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederationPeer")
            .field("system_id", &self.db.system_id())
            .field("links", &self.links.len())
            .finish()
    }
}
