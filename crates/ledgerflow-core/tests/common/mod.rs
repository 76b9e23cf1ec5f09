// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for ledgerflow-core integration tests.
//!
//! Provides a handful of small flows, store wrappers and helpers for starting nodes on
//! a shared in-memory network.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use ledgerflow_core::{
    Checkpoint, CheckpointStore, CoreError, Envelope, FlowContext, FlowCodec, FlowError, FlowId,
    FlowLogic, FlowPayload, FlowRuntime, FlowStep, InMemoryCheckpointStore, InMemoryNetwork,
    JsonCodec, MessageId, PeerAddress, RawMessage, SchedulerConfig, SchedulerSnapshot, SessionId,
    TopicSession,
};

/// How long a test waits for anything before giving up.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Install a test subscriber once. Set `RUST_LOG` to see scheduler logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ledgerflow_core=warn".into()),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Flows
// ============================================================================

/// Sends a greeting on `ping.7` and completes with the greeting plus the answer.
#[derive(Debug, Serialize, Deserialize)]
pub enum Ping {
    Start { peer: PeerAddress, greeting: String },
    AwaitingPong { greeting: String },
}

impl Ping {
    pub fn new(peer: &PeerAddress, greeting: &str) -> Self {
        Ping::Start {
            peer: peer.clone(),
            greeting: greeting.to_string(),
        }
    }
}

impl FlowLogic for Ping {
    type Output = String;
    const FLOW_TYPE: &'static str = "test.ping";

    fn advance(&mut self, ctx: &mut FlowContext) -> Result<FlowStep<String>, FlowError> {
        match self {
            Ping::Start { peer, greeting } => {
                let greeting = greeting.clone();
                ctx.send_and_receive::<String, _>(
                    "ping",
                    peer.clone(),
                    SessionId(7),
                    SessionId(7),
                    &greeting,
                )?;
                *self = Ping::AwaitingPong { greeting };
                Ok(FlowStep::Suspend)
            }
            Ping::AwaitingPong { greeting } => {
                let pong = ctx.received::<String>()?.validate(|pong| {
                    if pong.is_empty() {
                        Err(FlowError::protocol("empty pong"))
                    } else {
                        Ok(pong)
                    }
                })?;
                Ok(FlowStep::Complete(format!("{} {}", greeting, pong)))
            }
        }
    }
}

/// Waits for a greeting on `ping.7`, answers `world`, and completes with what it heard.
#[derive(Debug, Serialize, Deserialize)]
pub enum Pong {
    Start { peer: PeerAddress },
    Listening { peer: PeerAddress },
    Answered { heard: String },
}

impl Pong {
    pub fn new(peer: &PeerAddress) -> Self {
        Pong::Start { peer: peer.clone() }
    }
}

impl FlowLogic for Pong {
    type Output = String;
    const FLOW_TYPE: &'static str = "test.pong";

    fn advance(&mut self, ctx: &mut FlowContext) -> Result<FlowStep<String>, FlowError> {
        match self {
            Pong::Start { peer } => {
                let peer = peer.clone();
                ctx.receive::<String>("ping", SessionId(7))?;
                *self = Pong::Listening { peer };
                Ok(FlowStep::Suspend)
            }
            Pong::Listening { peer } => {
                let peer = peer.clone();
                let heard = ctx.received::<String>()?.validate(Ok::<_, FlowError>)?;
                ctx.send("ping", peer, SessionId(7), &"world".to_string())?;
                *self = Pong::Answered { heard };
                Ok(FlowStep::Suspend)
            }
            Pong::Answered { heard } => Ok(FlowStep::Complete(heard.clone())),
        }
    }
}

/// Waits for one string on a correlation key and completes with it.
#[derive(Debug, Serialize, Deserialize)]
pub struct Waiter {
    pub topic: String,
    pub session: i64,
    pub waiting: bool,
}

impl Waiter {
    pub fn on(topic: &str, session: i64) -> Self {
        Self {
            topic: topic.to_string(),
            session,
            waiting: false,
        }
    }
}

impl FlowLogic for Waiter {
    type Output = String;
    const FLOW_TYPE: &'static str = "test.waiter";

    fn advance(&mut self, ctx: &mut FlowContext) -> Result<FlowStep<String>, FlowError> {
        if !self.waiting {
            ctx.receive::<String>(self.topic.clone(), SessionId(self.session))?;
            self.waiting = true;
            return Ok(FlowStep::Suspend);
        }
        let value = ctx.received::<String>()?.validate(Ok::<_, FlowError>)?;
        Ok(FlowStep::Complete(value))
    }
}

/// Sends one note without waiting for an answer.
#[derive(Debug, Serialize, Deserialize)]
pub struct Notify {
    pub peer: PeerAddress,
    pub note: String,
    pub sent: bool,
}

impl Notify {
    pub fn new(peer: &PeerAddress, note: &str) -> Self {
        Self {
            peer: peer.clone(),
            note: note.to_string(),
            sent: false,
        }
    }
}

impl FlowLogic for Notify {
    type Output = ();
    const FLOW_TYPE: &'static str = "test.notify";

    fn advance(&mut self, ctx: &mut FlowContext) -> Result<FlowStep<()>, FlowError> {
        if self.sent {
            return Ok(FlowStep::Complete(()));
        }
        ctx.send("notify", self.peer.clone(), SessionId(1), &self.note)?;
        self.sent = true;
        Ok(FlowStep::Suspend)
    }
}

/// Waits for a question on `ask.3`, forwards it to `peer` without waiting, then waits
/// for an acknowledgement on `ack.3`.
#[derive(Debug, Serialize, Deserialize)]
pub enum Relay {
    Start { peer: PeerAddress },
    Asked { peer: PeerAddress },
    Forwarded { question: String },
    AwaitingAck { question: String },
}

impl Relay {
    pub fn new(peer: &PeerAddress) -> Self {
        Relay::Start { peer: peer.clone() }
    }
}

impl FlowLogic for Relay {
    type Output = String;
    const FLOW_TYPE: &'static str = "test.relay";

    fn advance(&mut self, ctx: &mut FlowContext) -> Result<FlowStep<String>, FlowError> {
        match self {
            Relay::Start { peer } => {
                let peer = peer.clone();
                ctx.receive::<String>("ask", SessionId(3))?;
                *self = Relay::Asked { peer };
                Ok(FlowStep::Suspend)
            }
            Relay::Asked { peer } => {
                let peer = peer.clone();
                let question = ctx.received::<String>()?.validate(Ok::<_, FlowError>)?;
                ctx.send("relay", peer, SessionId(3), &question)?;
                *self = Relay::Forwarded { question };
                Ok(FlowStep::Suspend)
            }
            Relay::Forwarded { question } => {
                let question = question.clone();
                ctx.receive::<String>("ack", SessionId(3))?;
                *self = Relay::AwaitingAck { question };
                Ok(FlowStep::Suspend)
            }
            Relay::AwaitingAck { question } => {
                let ack = ctx.received::<String>()?.validate(Ok::<_, FlowError>)?;
                Ok(FlowStep::Complete(format!("{}: {}", question, ack)))
            }
        }
    }
}

/// Completes in its first step.
#[derive(Debug, Serialize, Deserialize)]
pub struct Immediate {
    pub value: u64,
}

impl FlowLogic for Immediate {
    type Output = u64;
    const FLOW_TYPE: &'static str = "test.immediate";

    fn advance(&mut self, _ctx: &mut FlowContext) -> Result<FlowStep<u64>, FlowError> {
        Ok(FlowStep::Complete(self.value))
    }
}

/// Ways a flow body can break the rules.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Misbehaviour {
    ReturnError,
    Panic,
    DoubleRequest,
    SuspendWithoutRequest,
    CompleteWithPending,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Misbehave(pub Misbehaviour);

impl FlowLogic for Misbehave {
    type Output = ();
    const FLOW_TYPE: &'static str = "test.misbehave";

    fn advance(&mut self, ctx: &mut FlowContext) -> Result<FlowStep<()>, FlowError> {
        match self.0 {
            Misbehaviour::ReturnError => Err(FlowError::protocol("counterparty refused")),
            Misbehaviour::Panic => panic!("boom"),
            Misbehaviour::DoubleRequest => {
                ctx.receive::<String>("first", SessionId(1))?;
                // The error is swallowed on purpose; the flow must fail anyway.
                let _ = ctx.receive::<String>("second", SessionId(1));
                Ok(FlowStep::Suspend)
            }
            Misbehaviour::SuspendWithoutRequest => Ok(FlowStep::Suspend),
            Misbehaviour::CompleteWithPending => {
                ctx.receive::<String>("never", SessionId(1))?;
                Ok(FlowStep::Complete(()))
            }
        }
    }
}

// ============================================================================
// Stores
// ============================================================================

/// Store that records every write before passing it to an in-memory store.
#[derive(Clone, Default)]
pub struct RecordingStore {
    pub inner: InMemoryCheckpointStore,
    ops: Arc<Mutex<Vec<String>>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn record(&self, op: &str, flow_id: FlowId) {
        self.ops.lock().unwrap().push(format!("{} {}", op, flow_id));
    }
}

#[async_trait]
impl CheckpointStore for RecordingStore {
    async fn list_all(&self) -> Result<Vec<Checkpoint>, CoreError> {
        self.inner.list_all().await
    }

    async fn put(&self, flow_id: FlowId, checkpoint: Checkpoint) -> Result<(), CoreError> {
        self.record("put", flow_id);
        self.inner.put(flow_id, checkpoint).await
    }

    async fn remove(&self, flow_id: FlowId) -> Result<(), CoreError> {
        self.record("remove", flow_id);
        self.inner.remove(flow_id).await
    }

    async fn get(&self, flow_id: FlowId) -> Result<Option<Checkpoint>, CoreError> {
        self.inner.get(flow_id).await
    }
}

/// Store whose writes always fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingStore;

#[async_trait]
impl CheckpointStore for FailingStore {
    async fn list_all(&self) -> Result<Vec<Checkpoint>, CoreError> {
        Ok(Vec::new())
    }

    async fn put(&self, _flow_id: FlowId, _checkpoint: Checkpoint) -> Result<(), CoreError> {
        Err(CoreError::StoreError {
            operation: "put".to_string(),
            details: "disk full".to_string(),
        })
    }

    async fn remove(&self, _flow_id: FlowId) -> Result<(), CoreError> {
        Ok(())
    }

    async fn get(&self, _flow_id: FlowId) -> Result<Option<Checkpoint>, CoreError> {
        Ok(None)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Start a node on `network` that knows every test flow.
pub async fn start_node(
    network: &InMemoryNetwork,
    name: &str,
    store: Arc<dyn CheckpointStore>,
) -> FlowRuntime {
    start_node_with(network, name, store, SchedulerConfig::default()).await
}

pub async fn start_node_with(
    network: &InMemoryNetwork,
    name: &str,
    store: Arc<dyn CheckpointStore>,
    config: SchedulerConfig,
) -> FlowRuntime {
    init_tracing();
    FlowRuntime::builder()
        .network(Arc::new(network.endpoint(PeerAddress::new(name))))
        .store(store)
        .config(config)
        .flow::<Ping>()
        .flow::<Pong>()
        .flow::<Waiter>()
        .flow::<Notify>()
        .flow::<Relay>()
        .build()
        .expect("runtime config")
        .start()
        .await
        .expect("runtime start")
}

/// A wire message carrying `value` on `topic.session`.
pub fn raw<T: FlowPayload>(topic: &str, session: i64, value: &T) -> RawMessage {
    let envelope = Envelope::wrap(value).expect("wrap payload");
    RawMessage {
        topic_session: TopicSession::new(topic, SessionId(session)),
        message_id: MessageId::new(),
        data: JsonCodec.encode_message(&envelope).expect("encode payload"),
    }
}

/// Poll `check` until it returns `Some` or the timeout expires.
pub async fn wait_until<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    tokio::time::timeout(TIMEOUT, async {
        loop {
            if let Some(value) = check().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

/// Wait until the scheduler reports a snapshot matching `predicate`.
pub async fn wait_for_snapshot(
    runtime: &FlowRuntime,
    predicate: impl Fn(&SchedulerSnapshot) -> bool,
) -> SchedulerSnapshot {
    let manager = runtime.manager().clone();
    let predicate = &predicate;
    wait_until(move || {
        let manager = manager.clone();
        async move {
            let snapshot = manager.snapshot().await.expect("scheduler running");
            predicate(&snapshot).then_some(snapshot)
        }
    })
    .await
}

/// Wait until `flow_id` is parked with a persisted checkpoint.
pub async fn wait_for_checkpoint(runtime: &FlowRuntime, flow_id: FlowId) -> SchedulerSnapshot {
    wait_for_snapshot(runtime, |snapshot| {
        snapshot
            .flow(flow_id)
            .is_some_and(|flow| flow.awaiting.is_some() && flow.has_checkpoint)
    })
    .await
}

/// Wait for a future with the test timeout.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TIMEOUT, future)
        .await
        .expect("timed out")
}
