// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Serialization of flow state and wire payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::io_request::{FlowId, IoRequest};
use crate::payload::Envelope;

/// Everything needed to bring a suspended flow back to life.
///
/// Transient runtime state (result channel, listener guards, the last delivered
/// payload) is not part of the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    /// Flow identity.
    pub flow_id: FlowId,
    /// Registered type name, used to find the restore function.
    pub flow_type: String,
    /// Logger name the flow runs under.
    pub logger_name: String,
    /// The flow's own serialized state value.
    pub state: Value,
    /// The request the flow is parked on.
    pub awaiting: Option<IoRequest>,
}

/// Turns flow snapshots and message envelopes into bytes and back.
pub trait FlowCodec: Send + Sync {
    /// Encode a flow snapshot.
    fn serialize(&self, snapshot: &FlowSnapshot) -> Result<Vec<u8>, CoreError>;

    /// Decode a flow snapshot.
    fn deserialize(&self, bytes: &[u8]) -> Result<FlowSnapshot, CoreError>;

    /// Encode an outbound payload.
    fn encode_message(&self, envelope: &Envelope) -> Result<Vec<u8>, CoreError>;

    /// Decode an inbound payload.
    fn decode_message(&self, bytes: &[u8]) -> Result<Envelope, CoreError>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl FlowCodec for JsonCodec {
    fn serialize(&self, snapshot: &FlowSnapshot) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec(snapshot).map_err(|e| CoreError::codec("flow snapshot", e))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<FlowSnapshot, CoreError> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::codec("flow snapshot", e))
    }

    fn encode_message(&self, envelope: &Envelope) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec(envelope).map_err(|e| CoreError::codec("message", e))
    }

    fn decode_message(&self, bytes: &[u8]) -> Result<Envelope, CoreError> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::codec("message", e))
    }
}
