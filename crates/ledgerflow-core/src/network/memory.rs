// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process network layer.
//!
//! An [`InMemoryNetwork`] is a hub shared by every node of a test or demo; each node talks
//! to it through its own [`InMemoryEndpoint`]. Messages for an address that has no
//! matching handler yet are buffered, so a node that restarts picks up traffic that
//! arrived while it was down.
//!
//! Duplicate suppression only remembers the last [`DEDUP_WINDOW`] message ids per
//! address. A redelivery older than that is handed on like a new message.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::{MessageHandler, MessagingService, PeerAddress, RawMessage};
use crate::error::CoreError;
use crate::io_request::{MessageId, TopicSession};

/// Number of recent message ids each mailbox remembers for duplicate suppression.
pub const DEDUP_WINDOW: usize = 4096;

#[derive(Default)]
struct Mailbox {
    handlers: HashMap<TopicSession, MessageHandler>,
    buffered: HashMap<TopicSession, VecDeque<RawMessage>>,
    seen: HashSet<MessageId>,
    seen_order: VecDeque<MessageId>,
}

impl Mailbox {
    /// Record `message_id`; `false` if it is still inside the window.
    fn remember(&mut self, message_id: MessageId) -> bool {
        if !self.seen.insert(message_id) {
            return false;
        }
        self.seen_order.push_back(message_id);
        if self.seen_order.len() > DEDUP_WINDOW {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// Shared message hub routing between in-process nodes.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    mailboxes: Arc<Mutex<HashMap<PeerAddress, Mailbox>>>,
}

impl InMemoryNetwork {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node to the hub under `address`.
    ///
    /// Attaching the same address again returns an endpoint sharing the existing mailbox.
    pub fn endpoint(&self, address: PeerAddress) -> InMemoryEndpoint {
        self.lock().entry(address.clone()).or_default();
        InMemoryEndpoint {
            network: self.clone(),
            address,
        }
    }

    /// Drop every handler registered by `address`, keeping its buffered messages.
    ///
    /// Simulates the node's process going away while the network keeps its traffic.
    pub fn disconnect(&self, address: &PeerAddress) {
        if let Some(mailbox) = self.lock().get_mut(address) {
            let dropped = mailbox.handlers.len();
            mailbox.handlers.clear();
            debug!(address = %address, dropped, "Disconnected endpoint");
        }
    }

    /// Deliver a message to `destination` as if a remote party had sent it.
    ///
    /// Returns `false` if the message was dropped as a duplicate.
    pub fn inject(&self, destination: &PeerAddress, message: RawMessage) -> bool {
        self.deliver(destination, message)
    }

    /// Number of handlers currently registered by `address`.
    pub fn handler_count(&self, address: &PeerAddress) -> usize {
        self.lock()
            .get(address)
            .map_or(0, |mailbox| mailbox.handlers.len())
    }

    /// Whether `address` has a handler waiting on `topic_session`.
    pub fn has_handler(&self, address: &PeerAddress, topic_session: &TopicSession) -> bool {
        self.lock()
            .get(address)
            .is_some_and(|mailbox| mailbox.handlers.contains_key(topic_session))
    }

    /// Number of messages buffered for `address` with no handler to take them.
    pub fn buffered_count(&self, address: &PeerAddress) -> usize {
        self.lock().get(address).map_or(0, |mailbox| {
            mailbox.buffered.values().map(VecDeque::len).sum()
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerAddress, Mailbox>> {
        self.mailboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, destination: &PeerAddress, message: RawMessage) -> bool {
        let handler = {
            let mut mailboxes = self.lock();
            let mailbox = mailboxes.entry(destination.clone()).or_default();
            if !mailbox.remember(message.message_id) {
                debug!(
                    destination = %destination,
                    topic = %message.topic_session,
                    message_id = %message.message_id,
                    "Dropping duplicate message"
                );
                return false;
            }
            match mailbox.handlers.remove(&message.topic_session) {
                Some(handler) => handler,
                None => {
                    trace!(
                        destination = %destination,
                        topic = %message.topic_session,
                        "No handler registered, buffering message"
                    );
                    mailbox
                        .buffered
                        .entry(message.topic_session.clone())
                        .or_default()
                        .push_back(message);
                    return true;
                }
            }
        };

        // Handlers run outside the lock so they may register follow-up handlers.
        handler(message);
        true
    }

    fn unregister(&self, address: &PeerAddress, topic_session: &TopicSession) {
        if let Some(mailbox) = self.lock().get_mut(address) {
            if mailbox.handlers.remove(topic_session).is_some() {
                trace!(address = %address, topic = %topic_session, "Handler withdrawn");
            }
        }
    }

    fn register(&self, address: &PeerAddress, topic_session: TopicSession, handler: MessageHandler) {
        let ready = {
            let mut mailboxes = self.lock();
            let mailbox = mailboxes.entry(address.clone()).or_default();
            let buffered = mailbox
                .buffered
                .get_mut(&topic_session)
                .and_then(VecDeque::pop_front);
            match buffered {
                Some(message) => {
                    if mailbox
                        .buffered
                        .get(&topic_session)
                        .is_some_and(VecDeque::is_empty)
                    {
                        mailbox.buffered.remove(&topic_session);
                    }
                    Some(message)
                }
                None => {
                    if mailbox
                        .handlers
                        .insert(topic_session.clone(), handler.clone())
                        .is_some()
                    {
                        warn!(
                            address = %address,
                            topic = %topic_session,
                            "Replaced an existing handler"
                        );
                    }
                    None
                }
            }
        };

        if let Some(message) = ready {
            handler(message);
        }
    }
}

impl std::fmt::Debug for InMemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut addresses: Vec<_> = self.lock().keys().cloned().collect();
        addresses.sort();
        f.debug_struct("InMemoryNetwork")
            .field("addresses", &addresses)
            .finish()
    }
}

/// One node's view of an [`InMemoryNetwork`].
#[derive(Clone, Debug)]
pub struct InMemoryEndpoint {
    network: InMemoryNetwork,
    address: PeerAddress,
}

impl InMemoryEndpoint {
    /// The hub this endpoint is attached to.
    pub fn network(&self) -> &InMemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl MessagingService for InMemoryEndpoint {
    async fn send(&self, message: RawMessage, destination: &PeerAddress) -> Result<(), CoreError> {
        trace!(
            from = %self.address,
            to = %destination,
            topic = %message.topic_session,
            bytes = message.data.len(),
            "Routing message"
        );
        self.network.deliver(destination, message);
        Ok(())
    }

    fn run_on_next_message(&self, topic_session: TopicSession, handler: MessageHandler) {
        self.network.register(&self.address, topic_session, handler);
    }

    fn cancel_next_message(&self, topic_session: &TopicSession) {
        self.network.unregister(&self.address, topic_session);
    }

    fn local_address(&self) -> &PeerAddress {
        &self.address
    }
}
