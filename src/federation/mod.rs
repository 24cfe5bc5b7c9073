// # Federation
//
// Peer-to-peer replication of the delta log over the
// `rhizomedb-federation-v1` protocol. Convergence is by commutative
// accumulation of immutable deltas: peers exchange raw deltas, trust
// policies gate what enters the local log, and timestamps plus negation
// give every replica the same effective state. No cross-peer ordering is
// guaranteed.
//
// ```text
//  local writes ─┐                               ┌─ remote writes
//                ▼                               ▼
//        ┌──────────────┐   delta/ack/nack   ┌──────────────┐
//        │ Federation   │◄──────────────────►│ Federation   │
//        │ Peer (A)     │   sync batches     │ Peer (B)     │
//        └──────┬───────┘   ping/pong        └──────┬───────┘
//               ▼                                   ▼
//         RhizomeDb (A)                       RhizomeDb (B)
// ```
//
// Handshake, initial sync batching, push/ack/nack, pause/resume flow
// control, heartbeat, and backoff reconnect live in [`peer`]; wire framing
// in [`messages`]; transports in [`transport`]; per-link state in
// [`link`]; inbound admission in [`trust`].

pub mod link;
pub mod messages;
pub mod peer;
pub mod transport;
pub mod trust;

pub use link::{
    FederationLink, InitialSyncPolicy, LinkConfig, LinkMode, LinkState, LinkStats,
    ReconnectConfig,
};
pub use messages::{FederationMessage, FrameCodec, PeerAnnouncement, WireFrame, PROTOCOL_VERSION};
pub use peer::{FederationPeer, PeerSettings, SYNC_BATCH_SIZE};
pub use transport::{accept_ws, connect_ws, DuplexTransport, MessageTransport, WsTransport};
pub use trust::{TrustPolicy, TrustPredicate};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        assert_eq!(PROTOCOL_VERSION, "rhizomedb-federation-v1");
        let config = LinkConfig::default();
        assert_eq!(config.mode, LinkMode::Bidirectional);
        assert_eq!(config.initial_sync, InitialSyncPolicy::None);
    }
}
