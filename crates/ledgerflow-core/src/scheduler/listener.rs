// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One-shot message listeners.
//!
//! The network layer calls handlers on its own threads. A handler built here does
//! nothing but trip its guard and post the message into the scheduler's inbound queue,
//! so every state change still happens on the scheduler task.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::io_request::{CallSite, FlowId, TopicSession};
use crate::network::{MessageHandler, RawMessage};
use crate::payload::TypeTag;

const ARMED: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Scheduler-assigned id of a listener registration.
pub(crate) type ListenerId = u64;

/// Result of trying to fire a guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fire {
    First,
    Again,
    Cancelled,
}

/// At-most-once flag shared between a listener and its handler.
#[derive(Debug, Clone, Default)]
pub(crate) struct ListenerGuard(Arc<AtomicU8>);

impl ListenerGuard {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn try_fire(&self) -> Fire {
        match self
            .0
            .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Fire::First,
            Err(FIRED) => Fire::Again,
            Err(_) => Fire::Cancelled,
        }
    }

    /// Disarm an unfired guard. A fired guard stays fired so late duplicates are still
    /// reported.
    pub(crate) fn cancel(&self) {
        let _ = self
            .0
            .compare_exchange(ARMED, CANCELLED, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// What the scheduler remembers about a registered listener.
#[derive(Debug, Clone)]
pub(crate) struct Listener {
    pub(crate) flow_id: FlowId,
    pub(crate) topic_session: TopicSession,
    pub(crate) expected_type: TypeTag,
    pub(crate) call_site: CallSite,
    pub(crate) guard: ListenerGuard,
}

/// Events posted by listener handlers.
#[derive(Debug)]
pub(crate) enum Inbound {
    Message {
        listener_id: ListenerId,
        message: RawMessage,
    },
    Duplicate {
        listener_id: ListenerId,
        flow_id: FlowId,
        topic_session: TopicSession,
        call_site: CallSite,
    },
}

/// Build the network handler for a listener.
pub(crate) fn handler(
    listener_id: ListenerId,
    listener: &Listener,
    inbound: mpsc::UnboundedSender<Inbound>,
) -> MessageHandler {
    let guard = listener.guard.clone();
    let flow_id = listener.flow_id;
    let topic_session = listener.topic_session.clone();
    let call_site = listener.call_site.clone();

    Arc::new(move |message: RawMessage| {
        let event = match guard.try_fire() {
            Fire::First => Inbound::Message {
                listener_id,
                message,
            },
            Fire::Again => {
                error!(
                    flow_id = %flow_id,
                    topic = %topic_session,
                    message_id = %message.message_id,
                    call_site = %call_site,
                    "Message delivered to a listener that already fired"
                );
                Inbound::Duplicate {
                    listener_id,
                    flow_id,
                    topic_session: topic_session.clone(),
                    call_site: call_site.clone(),
                }
            }
            Fire::Cancelled => {
                debug!(
                    flow_id = %flow_id,
                    topic = %topic_session,
                    "Dropping message for a cancelled listener"
                );
                return;
            }
        };
        if inbound.send(event).is_err() {
            debug!(topic = %topic_session, "Scheduler stopped, dropping message");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_request::{MessageId, SessionId};

    fn listener() -> Listener {
        Listener {
            flow_id: FlowId::new(),
            topic_session: TopicSession::new("ping", SessionId(7)),
            expected_type: TypeTag::new("string"),
            call_site: CallSite::capture(),
            guard: ListenerGuard::new(),
        }
    }

    fn raw() -> RawMessage {
        RawMessage {
            topic_session: TopicSession::new("ping", SessionId(7)),
            message_id: MessageId::new(),
            data: b"{}".to_vec(),
        }
    }

    #[test]
    fn test_guard_fires_once() {
        let guard = ListenerGuard::new();
        assert_eq!(guard.try_fire(), Fire::First);
        assert_eq!(guard.try_fire(), Fire::Again);
        guard.cancel();
        assert_eq!(guard.try_fire(), Fire::Again);
    }

    #[test]
    fn test_cancelled_guard_never_fires() {
        let guard = ListenerGuard::new();
        guard.cancel();
        assert_eq!(guard.try_fire(), Fire::Cancelled);
    }

    #[test]
    fn test_handler_posts_message_then_duplicate() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = listener();
        let handler = handler(3, &listener, tx);

        handler(raw());
        handler(raw());

        assert!(matches!(
            rx.try_recv().unwrap(),
            Inbound::Message { listener_id: 3, .. }
        ));
        match rx.try_recv().unwrap() {
            Inbound::Duplicate {
                listener_id,
                flow_id,
                ..
            } => {
                assert_eq!(listener_id, 3);
                assert_eq!(flow_id, listener.flow_id);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cancelled_handler_posts_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = listener();
        let handler = handler(1, &listener, tx);
        listener.guard.cancel();

        handler(raw());
        assert!(rx.try_recv().is_err());
    }
}
