// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! I/O request model.
//!
//! An [`IoRequest`] describes the single interaction a suspended flow is waiting on.
//! Requests are plain values: they are compared structurally on topic, destination,
//! both session ids and payload, so a retried request compares equal to the original
//! even though its message id and call site differ.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::network::PeerAddress;
use crate::payload::{Envelope, TypeTag};

/// Opaque identifier of a flow instance, stable for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(Uuid);

impl FlowId {
    /// Allocate a fresh random flow id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FlowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for FlowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Conversation id scoped to one flow's exchange with one counterparty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub i64);

impl SessionId {
    /// Sentinel used by fire-and-forget sends, which have no receive session.
    pub const NONE: SessionId = SessionId(-1);

    /// Pick a random non-negative 63-bit session id.
    pub fn random() -> Self {
        let (high, _) = Uuid::new_v4().as_u64_pair();
        Self((high >> 1) as i64)
    }

    /// Whether this is the "no session" sentinel.
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl From<i64> for SessionId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Correlation key used to route inbound messages: `"{topic}.{session_id}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicSession {
    /// Logical message channel.
    pub topic: String,
    /// Conversation within the channel.
    pub session_id: SessionId,
}

impl TopicSession {
    /// Combine a topic with a session id.
    pub fn new(topic: impl Into<String>, session_id: SessionId) -> Self {
        Self {
            topic: topic.into(),
            session_id,
        }
    }
}

impl fmt::Display for TopicSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.topic, self.session_id)
    }
}

/// Wire-level deduplication id carried by every send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Allocate a fresh message id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Source location of the call that issued a request.
///
/// Only used in diagnostics: it tells operators which suspension point a flow was
/// parked on when something went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallSite {
    /// Source file.
    pub file: String,
    /// Line number.
    pub line: u32,
    /// Column number.
    pub column: u32,
}

impl CallSite {
    /// Capture the location of the caller.
    #[track_caller]
    pub fn capture() -> Self {
        Location::caller().into()
    }
}

impl From<&Location<'_>> for CallSite {
    fn from(location: &Location<'_>) -> Self {
        Self {
            file: location.file().to_string(),
            line: location.line(),
            column: location.column(),
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// A pending interaction issued by a flow at a suspension point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IoRequest {
    /// Fire-and-forget send; no response is expected.
    Send {
        /// Logical topic.
        topic: String,
        /// Recipient node.
        destination: PeerAddress,
        /// Session the message is addressed to on the recipient.
        session_for_send: SessionId,
        /// Outbound data.
        payload: Envelope,
        /// Deduplication id.
        message_id: MessageId,
        /// Where the request was issued.
        call_site: CallSite,
    },
    /// Wait for one inbound message.
    Receive {
        /// Logical topic.
        topic: String,
        /// Session the response arrives on.
        session_for_receive: SessionId,
        /// Type the response must carry.
        expected_type: TypeTag,
        /// Where the request was issued.
        call_site: CallSite,
    },
    /// Send, then wait for one inbound message.
    SendAndReceive {
        /// Logical topic.
        topic: String,
        /// Recipient node.
        destination: PeerAddress,
        /// Session the message is addressed to on the recipient.
        session_for_send: SessionId,
        /// Outbound data.
        payload: Envelope,
        /// Deduplication id.
        message_id: MessageId,
        /// Session the response arrives on.
        session_for_receive: SessionId,
        /// Type the response must carry.
        expected_type: TypeTag,
        /// Where the request was issued.
        call_site: CallSite,
    },
}

impl IoRequest {
    /// Build a fire-and-forget send.
    #[track_caller]
    pub fn send(
        topic: impl Into<String>,
        destination: PeerAddress,
        session_for_send: SessionId,
        payload: Envelope,
    ) -> Self {
        Self::Send {
            topic: topic.into(),
            destination,
            session_for_send,
            payload,
            message_id: MessageId::new(),
            call_site: CallSite::capture(),
        }
    }

    /// Build a receive.
    #[track_caller]
    pub fn receive(
        topic: impl Into<String>,
        session_for_receive: SessionId,
        expected_type: TypeTag,
    ) -> Self {
        Self::Receive {
            topic: topic.into(),
            session_for_receive,
            expected_type,
            call_site: CallSite::capture(),
        }
    }

    /// Build a send followed by a receive.
    #[track_caller]
    pub fn send_and_receive(
        topic: impl Into<String>,
        destination: PeerAddress,
        session_for_send: SessionId,
        session_for_receive: SessionId,
        payload: Envelope,
        expected_type: TypeTag,
    ) -> Self {
        Self::SendAndReceive {
            topic: topic.into(),
            destination,
            session_for_send,
            payload,
            message_id: MessageId::new(),
            session_for_receive,
            expected_type,
            call_site: CallSite::capture(),
        }
    }

    /// Logical topic of the request.
    pub fn topic(&self) -> &str {
        match self {
            Self::Send { topic, .. }
            | Self::Receive { topic, .. }
            | Self::SendAndReceive { topic, .. } => topic,
        }
    }

    /// Recipient, if the request sends anything.
    pub fn destination(&self) -> Option<&PeerAddress> {
        match self {
            Self::Send { destination, .. } | Self::SendAndReceive { destination, .. } => {
                Some(destination)
            }
            Self::Receive { .. } => None,
        }
    }

    /// Session used for the outbound message, [`SessionId::NONE`] for a pure receive.
    pub fn session_for_send(&self) -> SessionId {
        match self {
            Self::Send {
                session_for_send, ..
            }
            | Self::SendAndReceive {
                session_for_send, ..
            } => *session_for_send,
            Self::Receive { .. } => SessionId::NONE,
        }
    }

    /// Session the response arrives on, [`SessionId::NONE`] for a fire-and-forget send.
    pub fn session_for_receive(&self) -> SessionId {
        match self {
            Self::Receive {
                session_for_receive,
                ..
            }
            | Self::SendAndReceive {
                session_for_receive,
                ..
            } => *session_for_receive,
            Self::Send { .. } => SessionId::NONE,
        }
    }

    /// Outbound data, if any.
    pub fn payload(&self) -> Option<&Envelope> {
        match self {
            Self::Send { payload, .. } | Self::SendAndReceive { payload, .. } => Some(payload),
            Self::Receive { .. } => None,
        }
    }

    /// Deduplication id of the outbound message, if any.
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Self::Send { message_id, .. } | Self::SendAndReceive { message_id, .. } => {
                Some(*message_id)
            }
            Self::Receive { .. } => None,
        }
    }

    /// Type the response must carry, if a response is expected.
    pub fn expected_type(&self) -> Option<&TypeTag> {
        match self {
            Self::Receive { expected_type, .. } | Self::SendAndReceive { expected_type, .. } => {
                Some(expected_type)
            }
            Self::Send { .. } => None,
        }
    }

    /// Where the request was issued.
    pub fn call_site(&self) -> &CallSite {
        match self {
            Self::Send { call_site, .. }
            | Self::Receive { call_site, .. }
            | Self::SendAndReceive { call_site, .. } => call_site,
        }
    }

    /// Whether the flow stays parked until a message arrives.
    pub fn expects_response(&self) -> bool {
        !matches!(self, Self::Send { .. })
    }

    /// Correlation key the response is routed on.
    pub fn receive_topic_session(&self) -> Option<TopicSession> {
        self.expects_response()
            .then(|| TopicSession::new(self.topic(), self.session_for_receive()))
    }

    /// Correlation key the outbound message is addressed to.
    pub fn send_topic_session(&self) -> Option<TopicSession> {
        self.payload()
            .map(|_| TopicSession::new(self.topic(), self.session_for_send()))
    }
}

impl PartialEq for IoRequest {
    fn eq(&self, other: &Self) -> bool {
        self.topic() == other.topic()
            && self.destination() == other.destination()
            && self.session_for_send() == other.session_for_send()
            && self.session_for_receive() == other.session_for_receive()
            && self.payload() == other.payload()
    }
}

impl Eq for IoRequest {}

impl Hash for IoRequest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.topic().hash(state);
        self.destination().hash(state);
        self.session_for_send().hash(state);
        self.session_for_receive().hash(state);
        self.payload().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn peer() -> PeerAddress {
        PeerAddress::new("bank-b")
    }

    fn hello() -> Envelope {
        Envelope::wrap(&"hello".to_string()).unwrap()
    }

    #[test]
    fn test_topic_session_format() {
        let ts = TopicSession::new("ping", SessionId(7));
        assert_eq!(ts.to_string(), "ping.7");
        assert_eq!(
            TopicSession::new("platform.session", SessionId::NONE).to_string(),
            "platform.session.-1"
        );
    }

    #[test]
    fn test_send_has_no_receive_session() {
        let req = IoRequest::send("ping", peer(), SessionId(3), hello());
        assert_eq!(req.session_for_receive(), SessionId::NONE);
        assert!(!req.expects_response());
        assert!(req.receive_topic_session().is_none());
        assert_eq!(req.send_topic_session().unwrap().to_string(), "ping.3");
        assert!(req.message_id().is_some());
        assert!(req.expected_type().is_none());
    }

    #[test]
    fn test_receive_has_no_outbound_side() {
        let req = IoRequest::receive("ping", SessionId(7), TypeTag::new("string"));
        assert!(req.expects_response());
        assert!(req.payload().is_none());
        assert!(req.destination().is_none());
        assert!(req.send_topic_session().is_none());
        assert_eq!(req.session_for_send(), SessionId::NONE);
        assert_eq!(req.receive_topic_session().unwrap().to_string(), "ping.7");
    }

    #[test]
    fn test_retried_requests_compare_equal() {
        let first = IoRequest::send_and_receive(
            "ping",
            peer(),
            SessionId(7),
            SessionId(8),
            hello(),
            TypeTag::new("string"),
        );
        let retry = IoRequest::send_and_receive(
            "ping",
            peer(),
            SessionId(7),
            SessionId(8),
            hello(),
            TypeTag::new("i64"),
        );

        assert_ne!(first.message_id(), retry.message_id());
        assert_ne!(first.call_site(), retry.call_site());
        assert_eq!(first, retry);

        let mut set = HashSet::new();
        set.insert(first);
        assert!(!set.insert(retry));
    }

    #[test]
    fn test_requests_differing_in_session_are_distinct() {
        let a = IoRequest::receive("ping", SessionId(1), TypeTag::new("string"));
        let b = IoRequest::receive("ping", SessionId(2), TypeTag::new("string"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_call_site_points_at_caller() {
        let req = IoRequest::receive("ping", SessionId(1), TypeTag::new("string"));
        assert!(req.call_site().file.ends_with("io_request.rs"));
        assert!(req.call_site().line > 0);
    }

    #[test]
    fn test_random_session_is_non_negative() {
        for _ in 0..32 {
            let id = SessionId::random();
            assert!(id.0 >= 0);
            assert!(!id.is_none());
        }
    }

    #[test]
    fn test_flow_id_parses_back() {
        let id = FlowId::new();
        let parsed: FlowId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
