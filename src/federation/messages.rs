// # Federation Wire Protocol
//
// `rhizomedb-federation-v1`: JSON messages, one per frame. Every frame
// carries a `type` discriminator and a `timestamp`; the codec rejects
// frames missing either. Framing and TLS belong to the transport host.

use crate::common::Timestamp;
use crate::delta::Delta;
use crate::federation::link::{InitialSyncPolicy, LinkMode};
use crate::query::DeltaFilter;
use crate::{Result, RhizomeError};
use serde::{Deserialize, Serialize};

/// Protocol identifier exchanged during the handshake.
pub const PROTOCOL_VERSION: &str = "rhizomedb-federation-v1";

/// Link parameters a client announces in its `hello`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub mode: LinkMode,
    pub initial_sync: InitialSyncPolicy,
}

/// One protocol message. Serialized with a `type` tag in snake_case, so
/// e.g. `DeltaAck` travels as `{ "type": "delta_ack", ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FederationMessage {
    Hello {
        system_id: String,
        config: PeerAnnouncement,
        protocol: String,
    },
    HelloAck {
        system_id: String,
        link_id: String,
        protocol: String,
    },
    Delta {
        delta: Delta,
    },
    DeltaAck {
        delta_id: String,
    },
    DeltaNack {
        delta_id: String,
        reason: String,
    },
    SyncRequest {
        #[serde(skip_serializing_if = "Option::is_none")]
        filter: Option<DeltaFilter>,
        #[serde(skip_serializing_if = "Option::is_none")]
        from_timestamp: Option<Timestamp>,
    },
    SyncStart {
        total_deltas: usize,
        batch_size: usize,
    },
    SyncBatch {
        batch_number: usize,
        is_last_batch: bool,
        deltas: Vec<Delta>,
    },
    SyncComplete {
        deltas_processed: usize,
    },
    Pause,
    Resume,
    Ping,
    Pong,
    Error {
        code: String,
        message: String,
        #[serde(default)]
        fatal: bool,
    },
}

impl FederationMessage {
    /// The wire `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            FederationMessage::Hello { .. } => "hello",
            FederationMessage::HelloAck { .. } => "hello_ack",
            FederationMessage::Delta { .. } => "delta",
            FederationMessage::DeltaAck { .. } => "delta_ack",
            FederationMessage::DeltaNack { .. } => "delta_nack",
            FederationMessage::SyncRequest { .. } => "sync_request",
            FederationMessage::SyncStart { .. } => "sync_start",
            FederationMessage::SyncBatch { .. } => "sync_batch",
            FederationMessage::SyncComplete { .. } => "sync_complete",
            FederationMessage::Pause => "pause",
            FederationMessage::Resume => "resume",
            FederationMessage::Ping => "ping",
            FederationMessage::Pong => "pong",
            FederationMessage::Error { .. } => "error",
        }
    }
}

/// A message plus its frame timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub message: FederationMessage,
}

impl WireFrame {
    pub fn new(message: FederationMessage) -> Self {
        Self {
            timestamp: crate::common::now_millis(),
            message,
        }
    }
}

/// Frame codec. Rejects frames missing `type` or `timestamp`.
pub struct FrameCodec;

impl FrameCodec {
    pub fn encode(frame: &WireFrame) -> Result<String> {
        Ok(serde_json::to_string(frame)?)
    }

    pub fn decode(text: &str) -> Result<WireFrame> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let object = value
            .as_object()
            .ok_or_else(|| RhizomeError::Serialization("frame must be a JSON object".to_string()))?;
        if !object.contains_key("type") {
            return Err(RhizomeError::Serialization(
                "frame missing \"type\"".to_string(),
            ));
        }
        if !object.contains_key("timestamp") {
            return Err(RhizomeError::Serialization(
                "frame missing \"timestamp\"".to_string(),
            ));
        }
        Ok(serde_json::from_value(value)?)
    }
}
