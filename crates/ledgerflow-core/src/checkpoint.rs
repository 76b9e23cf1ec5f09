// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable record of a suspended flow.
//!
//! A checkpoint exists for a flow exactly while that flow is parked waiting for a
//! response. It pairs the encoded flow snapshot with the routing data needed to
//! re-attach the flow to its next inbound message after a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::io_request::{CallSite, FlowId, TopicSession};
use crate::payload::TypeTag;

/// Snapshot of a suspended flow plus what it is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Flow the checkpoint belongs to.
    pub flow_id: FlowId,
    /// Hex SHA-256 digest of `serialized_flow_state`.
    pub checkpoint_id: String,
    /// Registered type name of the flow.
    pub flow_type: String,
    /// Logger name the flow runs under.
    pub logger_name: String,
    /// Codec output for the flow snapshot.
    pub serialized_flow_state: Vec<u8>,
    /// Correlation key of the awaited message.
    pub awaiting_topic: TopicSession,
    /// Type the awaited message must carry.
    pub awaiting_type: TypeTag,
    /// Where the flow issued the request it is parked on.
    pub call_site: CallSite,
    /// When the checkpoint was taken.
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Build a checkpoint, deriving its id from the serialized state.
    pub fn new(
        flow_id: FlowId,
        flow_type: impl Into<String>,
        logger_name: impl Into<String>,
        serialized_flow_state: Vec<u8>,
        awaiting_topic: TopicSession,
        awaiting_type: TypeTag,
        call_site: CallSite,
    ) -> Self {
        Self {
            flow_id,
            checkpoint_id: digest(&serialized_flow_state),
            flow_type: flow_type.into(),
            logger_name: logger_name.into(),
            serialized_flow_state,
            awaiting_topic,
            awaiting_type,
            call_site,
            created_at: Utc::now(),
        }
    }

    /// Whether the stored id still matches the stored bytes.
    pub fn verify(&self) -> bool {
        self.checkpoint_id == digest(&self.serialized_flow_state)
    }
}

fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
