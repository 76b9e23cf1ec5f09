// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The suspension hook handed to a flow step.

use crate::error::FlowError;
use crate::io_request::{CallSite, FlowId, IoRequest, SessionId, TopicSession};
use crate::network::PeerAddress;
use crate::payload::{Envelope, FlowPayload, TypeTag, UntrustworthyData};

/// Per-step view of the scheduler given to [`FlowLogic::advance`](super::FlowLogic::advance).
///
/// A step may issue at most one request. Issuing a second one is a suspension protocol
/// violation: the call returns an error and the flow fails once the step returns, even if
/// the step swallowed the error.
#[derive(Debug)]
pub struct FlowContext {
    flow_id: FlowId,
    logger_name: String,
    request: Option<IoRequest>,
    delivered: Option<(TopicSession, Envelope)>,
    violation: Option<FlowError>,
}

impl FlowContext {
    pub(crate) fn new(flow_id: FlowId, logger_name: impl Into<String>) -> Self {
        Self {
            flow_id,
            logger_name: logger_name.into(),
            request: None,
            delivered: None,
            violation: None,
        }
    }

    /// Id of the running flow.
    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    /// Logger name the flow runs under.
    pub fn logger_name(&self) -> &str {
        &self.logger_name
    }

    /// Send a payload without waiting for an answer.
    ///
    /// The flow is resumed as soon as the scheduler has handed the message to the network.
    #[track_caller]
    pub fn send<P: FlowPayload>(
        &mut self,
        topic: impl Into<String>,
        destination: PeerAddress,
        session_for_send: SessionId,
        payload: &P,
    ) -> Result<(), FlowError> {
        let payload = wrap(payload)?;
        self.issue(IoRequest::send(topic, destination, session_for_send, payload))
    }

    /// Wait for one message of type `R` on `topic.session_for_receive`.
    #[track_caller]
    pub fn receive<R: FlowPayload>(
        &mut self,
        topic: impl Into<String>,
        session_for_receive: SessionId,
    ) -> Result<(), FlowError> {
        self.issue(IoRequest::receive(
            topic,
            session_for_receive,
            TypeTag::of::<R>(),
        ))
    }

    /// Send a payload, then wait for one message of type `R` on
    /// `topic.session_for_receive`.
    #[track_caller]
    pub fn send_and_receive<R: FlowPayload, P: FlowPayload>(
        &mut self,
        topic: impl Into<String>,
        destination: PeerAddress,
        session_for_send: SessionId,
        session_for_receive: SessionId,
        payload: &P,
    ) -> Result<(), FlowError> {
        let payload = wrap(payload)?;
        self.issue(IoRequest::send_and_receive(
            topic,
            destination,
            session_for_send,
            session_for_receive,
            payload,
            TypeTag::of::<R>(),
        ))
    }

    /// The payload this step was resumed with.
    ///
    /// Fails if the step was not resumed by a message, or if the message does not carry
    /// an `R`.
    #[track_caller]
    pub fn received<R: FlowPayload>(&self) -> Result<UntrustworthyData<R>, FlowError> {
        let (topic, envelope) = self
            .delivered
            .as_ref()
            .ok_or_else(|| FlowError::protocol("step was not resumed with a message"))?;
        if !envelope.is::<R>() {
            return Err(FlowError::TypeMismatch {
                expected: R::TYPE_TAG.to_string(),
                actual: envelope.type_tag.to_string(),
                topic: topic.to_string(),
                call_site: CallSite::capture(),
            });
        }
        envelope
            .decode_body::<R>()
            .map(UntrustworthyData::new)
            .map_err(|e| FlowError::Deserialization {
                subject: format!("message on {}", topic),
                details: e.to_string(),
            })
    }

    fn issue(&mut self, request: IoRequest) -> Result<(), FlowError> {
        if let Some(pending) = &self.request {
            let violation = FlowError::SuspensionProtocol {
                message: format!(
                    "request on '{}' issued while the request on '{}' from {} is still pending",
                    request.topic(),
                    pending.topic(),
                    pending.call_site()
                ),
                call_site: request.call_site().clone(),
            };
            self.violation.get_or_insert_with(|| violation.clone());
            return Err(violation);
        }
        self.request = Some(request);
        Ok(())
    }

    pub(crate) fn deliver(&mut self, topic: TopicSession, envelope: Envelope) {
        self.delivered = Some((topic, envelope));
    }

    /// Clear per-step state, returning what the step issued and any violation it made.
    pub(crate) fn finish_step(&mut self) -> (Option<IoRequest>, Option<FlowError>) {
        self.delivered = None;
        (self.request.take(), self.violation.take())
    }
}

fn wrap<P: FlowPayload>(payload: &P) -> Result<Envelope, FlowError> {
    Envelope::wrap(payload).map_err(|e| FlowError::Serialization {
        subject: format!("outbound {}", P::TYPE_TAG),
        details: e.to_string(),
    })
}
