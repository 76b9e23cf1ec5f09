// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Network layer interface.
//!
//! The scheduler needs little from the transport: sending bytes to a peer under a
//! correlation key, and a single-use callback for the next message on a key that it can
//! withdraw again when the waiting flow goes away.
//! [`memory`] provides an in-process implementation that routes between nodes sharing
//! one hub.

pub mod memory;

pub use self::memory::{InMemoryEndpoint, InMemoryNetwork};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::io_request::{MessageId, TopicSession};

/// Address of a node on the network layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    /// Create an address from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The address as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bytes moving between nodes, addressed by correlation key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Correlation key on the receiving node.
    pub topic_session: TopicSession,
    /// Deduplication id assigned by the sender.
    pub message_id: MessageId,
    /// Encoded payload.
    pub data: Vec<u8>,
}

/// Callback invoked with an inbound message.
///
/// Implementations of [`MessagingService`] call a handler at most once; the scheduler's
/// handlers still guard against a second call.
pub type MessageHandler = Arc<dyn Fn(RawMessage) + Send + Sync>;

/// Transport used by the flow scheduler.
#[async_trait]
pub trait MessagingService: Send + Sync {
    /// Hand a message to the transport for delivery to `destination`.
    async fn send(&self, message: RawMessage, destination: &PeerAddress) -> Result<(), CoreError>;

    /// Register a handler for the next message that arrives on `topic_session`.
    ///
    /// If a matching message is already buffered, the handler fires immediately.
    fn run_on_next_message(&self, topic_session: TopicSession, handler: MessageHandler);

    /// Withdraw the handler waiting on `topic_session`, if any.
    ///
    /// Messages arriving afterwards are treated as if no handler had been registered, so a
    /// transport that buffers unclaimed traffic keeps them for the next registration.
    fn cancel_next_message(&self, topic_session: &TopicSession);

    /// Address of this node.
    fn local_address(&self) -> &PeerAddress;
}
