// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime wrapper around one flow.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use serde::{Deserialize, Serialize};
use tracing::{Span, debug, info_span};

use super::context::FlowContext;
use super::result::{FlowResult, ResultSender};
use super::{ErasedFlow, FlowStep};
use crate::codec::FlowSnapshot;
use crate::error::FlowError;
use crate::io_request::{CallSite, FlowId, IoRequest, TopicSession};
use crate::payload::Envelope;

/// Lifecycle state of a flow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    /// Admitted but not started.
    Created,
    /// Executing a step.
    Running,
    /// Parked on a request.
    Suspended,
    /// Finished with a value.
    Completed,
    /// Finished with an error.
    Failed,
}

impl FlowState {
    /// Whether no further steps are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a flow is being stepped.
#[derive(Debug)]
pub(crate) enum Resume {
    /// First step after admission.
    Start,
    /// A fire-and-forget send was accepted.
    Continue,
    /// The awaited message arrived.
    Deliver {
        topic: TopicSession,
        envelope: Envelope,
    },
}

/// What a step ended with.
#[derive(Debug)]
pub(crate) enum StepOutcome {
    Suspended(IoRequest),
    Finished(Result<Envelope, FlowError>),
}

pub(crate) struct FlowInstance {
    id: FlowId,
    logger_name: String,
    logic: Box<dyn ErasedFlow>,
    ctx: FlowContext,
    state: FlowState,
    awaiting: Option<IoRequest>,
    last_call_site: Option<CallSite>,
    result: ResultSender,
    span: Span,
}

impl FlowInstance {
    pub(crate) fn new(id: FlowId, logger_name: String, logic: Box<dyn ErasedFlow>) -> Self {
        let span = info_span!("flow", flow_id = %id, logger = %logger_name);
        Self {
            id,
            ctx: FlowContext::new(id, logger_name.clone()),
            logger_name,
            logic,
            state: FlowState::Created,
            awaiting: None,
            last_call_site: None,
            result: ResultSender::new(id),
            span,
        }
    }

    /// Rebuild a parked instance from a checkpoint snapshot.
    pub(crate) fn restored(snapshot: FlowSnapshot, logic: Box<dyn ErasedFlow>) -> Self {
        let mut instance = Self::new(snapshot.flow_id, snapshot.logger_name, logic);
        instance.last_call_site = snapshot.awaiting.as_ref().map(|r| r.call_site().clone());
        instance.awaiting = snapshot.awaiting;
        instance.state = FlowState::Suspended;
        instance
    }

    pub(crate) fn id(&self) -> FlowId {
        self.id
    }

    pub(crate) fn flow_type(&self) -> &'static str {
        self.logic.flow_type()
    }

    pub(crate) fn logger_name(&self) -> &str {
        &self.logger_name
    }

    pub(crate) fn state(&self) -> FlowState {
        self.state
    }

    pub(crate) fn awaiting(&self) -> Option<&IoRequest> {
        self.awaiting.as_ref()
    }

    /// Call site of the most recent request, used to explain failures.
    pub(crate) fn last_call_site(&self) -> Option<&CallSite> {
        self.last_call_site.as_ref()
    }

    pub(crate) fn subscribe(&self) -> FlowResult {
        self.result.subscribe()
    }

    pub(crate) fn restorer(&self) -> super::RestoreFn {
        self.logic.restorer()
    }

    pub(crate) fn snapshot(&self) -> Result<FlowSnapshot, FlowError> {
        let state = self.logic.state().map_err(|e| FlowError::Serialization {
            subject: format!("{} state", self.flow_type()),
            details: e.to_string(),
        })?;
        Ok(FlowSnapshot {
            flow_id: self.id,
            flow_type: self.flow_type().to_string(),
            logger_name: self.logger_name.clone(),
            state,
            awaiting: self.awaiting.clone(),
        })
    }

    /// Run the flow until it parks or finishes.
    pub(crate) fn step(&mut self, resume: Resume) -> StepOutcome {
        let expected = match &resume {
            Resume::Start => FlowState::Created,
            Resume::Continue | Resume::Deliver { .. } => FlowState::Suspended,
        };
        if self.state != expected {
            return self.fail(FlowError::protocol(format!(
                "cannot resume a {} flow with {:?}",
                self.state, resume
            )));
        }

        if let Resume::Deliver { topic, envelope } = resume {
            self.ctx.deliver(topic, envelope);
        }
        self.state = FlowState::Running;
        self.awaiting = None;

        let outcome = {
            let _entered = self.span.enter();
            let logic = &mut self.logic;
            let ctx = &mut self.ctx;
            catch_unwind(AssertUnwindSafe(|| logic.advance(ctx)))
        };
        let (request, violation) = self.ctx.finish_step();

        if let Some(request) = &request {
            self.last_call_site = Some(request.call_site().clone());
        }

        let step = match (outcome, violation) {
            (Err(panic), _) => {
                return self.fail(FlowError::Panicked(panic_message(panic.as_ref())));
            }
            (Ok(_), Some(violation)) => return self.fail(violation),
            (Ok(Err(error)), None) => return self.fail(error),
            (Ok(Ok(step)), None) => step,
        };

        match (step, request) {
            (FlowStep::Suspend, Some(request)) => {
                self.span.in_scope(|| {
                    debug!(
                        topic = %request.topic(),
                        call_site = %request.call_site(),
                        "Flow suspended"
                    )
                });
                self.state = FlowState::Suspended;
                self.awaiting = Some(request.clone());
                StepOutcome::Suspended(request)
            }
            (FlowStep::Suspend, None) => {
                self.fail(FlowError::protocol("flow suspended without issuing a request"))
            }
            (FlowStep::Complete(_), Some(request)) => self.fail(FlowError::SuspensionProtocol {
                message: format!(
                    "flow completed while its request on '{}' was never resumed",
                    request.topic()
                ),
                call_site: request.call_site().clone(),
            }),
            (FlowStep::Complete(output), None) => {
                self.state = FlowState::Completed;
                StepOutcome::Finished(Ok(output))
            }
        }
    }

    /// Mark the instance failed.
    pub(crate) fn fail(&mut self, error: FlowError) -> StepOutcome {
        self.state = FlowState::Failed;
        self.awaiting = None;
        StepOutcome::Finished(Err(error))
    }

    /// Publish the result. Consumes the instance so this happens once.
    pub(crate) fn resolve(self, outcome: Result<Envelope, FlowError>) {
        self.result.publish(outcome);
    }
}

impl fmt::Debug for FlowInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowInstance")
            .field("id", &self.id)
            .field("flow_type", &self.flow_type())
            .field("logger_name", &self.logger_name)
            .field("state", &self.state)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowLogic, erase};
    use crate::io_request::SessionId;
    use crate::network::PeerAddress;

    #[derive(Serialize, Deserialize)]
    enum Echo {
        Start,
        Waiting,
    }

    impl FlowLogic for Echo {
        type Output = String;
        const FLOW_TYPE: &'static str = "test.echo";

        fn advance(&mut self, ctx: &mut FlowContext) -> Result<FlowStep<String>, FlowError> {
            match self {
                Echo::Start => {
                    ctx.receive::<String>("echo", SessionId(1))?;
                    *self = Echo::Waiting;
                    Ok(FlowStep::Suspend)
                }
                Echo::Waiting => {
                    let text = ctx.received::<String>()?.validate(Ok::<_, FlowError>)?;
                    Ok(FlowStep::Complete(text))
                }
            }
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Greedy;

    impl FlowLogic for Greedy {
        type Output = ();
        const FLOW_TYPE: &'static str = "test.greedy";

        fn advance(&mut self, ctx: &mut FlowContext) -> Result<FlowStep<()>, FlowError> {
            ctx.send("a", PeerAddress::new("b"), SessionId(1), &1u32)?;
            // Swallowing the violation must not save the flow.
            let _ = ctx.receive::<String>("b", SessionId(2));
            Ok(FlowStep::Suspend)
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Boom;

    impl FlowLogic for Boom {
        type Output = ();
        const FLOW_TYPE: &'static str = "test.boom";

        fn advance(&mut self, _ctx: &mut FlowContext) -> Result<FlowStep<()>, FlowError> {
            panic!("boom at step one");
        }
    }

    fn instance<F: FlowLogic>(logic: F) -> FlowInstance {
        FlowInstance::new(FlowId::new(), F::FLOW_TYPE.to_string(), erase(logic))
    }

    #[test]
    fn test_suspend_then_deliver() {
        let mut flow = instance(Echo::Start);
        assert_eq!(flow.state(), FlowState::Created);

        let request = match flow.step(Resume::Start) {
            StepOutcome::Suspended(request) => request,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(flow.state(), FlowState::Suspended);
        assert_eq!(flow.awaiting(), Some(&request));
        assert_eq!(flow.snapshot().unwrap().state, serde_json::json!("Waiting"));

        let outcome = flow.step(Resume::Deliver {
            topic: TopicSession::new("echo", SessionId(1)),
            envelope: Envelope::wrap(&"hi".to_string()).unwrap(),
        });
        match outcome {
            StepOutcome::Finished(Ok(env)) => assert_eq!(env.decode_body::<String>().unwrap(), "hi"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(flow.state(), FlowState::Completed);
    }

    #[test]
    fn test_cannot_start_twice() {
        let mut flow = instance(Echo::Start);
        flow.step(Resume::Start);
        match flow.step(Resume::Start) {
            StepOutcome::Finished(Err(FlowError::Protocol(message))) => {
                assert!(message.contains("suspended"))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(flow.state().is_terminal());
    }

    #[test]
    fn test_swallowed_violation_still_fails() {
        let mut flow = instance(Greedy);
        match flow.step(Resume::Start) {
            StepOutcome::Finished(Err(FlowError::SuspensionProtocol { call_site, .. })) => {
                assert!(call_site.file.ends_with("instance.rs"))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(flow.state(), FlowState::Failed);
    }

    #[test]
    fn test_panic_becomes_error() {
        let mut flow = instance(Boom);
        match flow.step(Resume::Start) {
            StepOutcome::Finished(Err(FlowError::Panicked(message))) => {
                assert_eq!(message, "boom at step one")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(flow.state(), FlowState::Failed);
    }

    #[tokio::test]
    async fn test_resolve_publishes_once() {
        let mut flow = instance(Boom);
        let handle = flow.subscribe();
        let outcome = match flow.step(Resume::Start) {
            StepOutcome::Finished(outcome) => outcome,
            other => panic!("unexpected {:?}", other),
        };
        flow.resolve(outcome);
        assert_eq!(handle.wait().await.unwrap_err().error_code(), "PANICKED");
    }
}
