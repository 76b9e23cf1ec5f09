// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The flow scheduler.
//!
//! All scheduler state lives in one tokio task. A [`FlowManager`] is a
//! cheap handle that talks to that task over a command channel; network callbacks talk
//! to it over a separate inbound queue. Every mutation of the live-flow map, the
//! listener table and the checkpoint store therefore happens on one task, in one order.

mod actor;
mod listener;

pub(crate) use self::actor::Scheduler;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::instrument;

use crate::error::CoreError;
use crate::flow::{ErasedFlow, FlowHandle, FlowLogic, FlowResult, FlowState, erase};
use crate::io_request::{FlowId, TopicSession};
use crate::metrics::{FlowMetrics, MetricsSnapshot};
use crate::network::PeerAddress;
use crate::payload::FlowPayload;

/// Requests from handles to the scheduler task.
pub(crate) enum Command {
    AddFlow {
        logic: Box<dyn ErasedFlow>,
        logger_name: Option<String>,
        reply: oneshot::Sender<FlowResult>,
    },
    FindFlows {
        flow_type: String,
        reply: oneshot::Sender<Vec<FlowResult>>,
    },
    ResultOf {
        flow_id: FlowId,
        reply: oneshot::Sender<Option<FlowResult>>,
    },
    Snapshot {
        reply: oneshot::Sender<SchedulerSnapshot>,
    },
    Track {
        reply: oneshot::Sender<(SchedulerSnapshot, broadcast::Receiver<FlowChange>)>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Whether a flow joined or left the live set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Admitted or restored.
    Added,
    /// Finished, successfully or not.
    Removed,
}

/// Entry of the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowChange {
    /// The flow that changed.
    pub flow_id: FlowId,
    /// Its registered type.
    pub flow_type: String,
    /// What happened.
    pub kind: ChangeKind,
}

/// State of one live flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowSummary {
    /// Flow id.
    pub flow_id: FlowId,
    /// Registered type.
    pub flow_type: String,
    /// Logger name.
    pub logger_name: String,
    /// Lifecycle state.
    pub state: FlowState,
    /// Correlation key the flow waits on, if any.
    pub awaiting: Option<TopicSession>,
    /// Whether the scheduler holds a persisted checkpoint for the flow.
    pub has_checkpoint: bool,
}

/// Consistent view of the scheduler at one point in its command order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerSnapshot {
    /// Live flows ordered by id.
    pub flows: Vec<FlowSummary>,
    /// Registered one-shot listeners.
    pub listeners: usize,
    /// Flows queued to run.
    pub ready: usize,
}

impl SchedulerSnapshot {
    /// Summary of one flow, if it is live.
    pub fn flow(&self, flow_id: FlowId) -> Option<&FlowSummary> {
        self.flows.iter().find(|f| f.flow_id == flow_id)
    }

    /// Number of flows holding a checkpoint.
    pub fn checkpointed(&self) -> usize {
        self.flows.iter().filter(|f| f.has_checkpoint).count()
    }
}

/// Outcome of restoring flows from the checkpoint store at startup.
#[derive(Debug, Default)]
pub struct RestoreReport {
    /// Flows that are live again.
    pub restored: Vec<FlowId>,
    /// Checkpoints that could not be restored. They stay in the store.
    pub failed: Vec<(FlowId, CoreError)>,
}

impl RestoreReport {
    /// Whether every checkpoint was restored.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Handle to a running scheduler.
///
/// Cloning is cheap. The scheduler task stops once every handle is dropped or
/// [`shutdown`](Self::shutdown) is called; flows still live at that point keep their
/// checkpoints and their result handles resolve to
/// [`FlowError::SchedulerStopped`](crate::FlowError::SchedulerStopped).
#[derive(Clone)]
pub struct FlowManager {
    commands: mpsc::Sender<Command>,
    changes: broadcast::Sender<FlowChange>,
    metrics: Arc<FlowMetrics>,
    node: PeerAddress,
}

impl FlowManager {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        changes: broadcast::Sender<FlowChange>,
        metrics: Arc<FlowMetrics>,
        node: PeerAddress,
    ) -> Self {
        Self {
            commands,
            changes,
            metrics,
            node,
        }
    }

    /// Address of the node this scheduler runs on.
    pub fn node(&self) -> &PeerAddress {
        &self.node
    }

    /// Admit a flow and schedule its first step.
    ///
    /// The flow is registered before it runs, so even a flow that completes in its
    /// first step is observed through the returned handle.
    #[instrument(skip(self, logic), fields(flow_type = F::FLOW_TYPE))]
    pub async fn add_flow<F: FlowLogic>(&self, logic: F) -> Result<FlowHandle<F::Output>, CoreError> {
        self.admit(erase(logic), None).await
    }

    /// Admit a flow that logs under `logger_name` instead of its flow type.
    #[instrument(skip(self, logger_name, logic), fields(flow_type = F::FLOW_TYPE))]
    pub async fn add_flow_named<F: FlowLogic>(
        &self,
        logger_name: impl Into<String>,
        logic: F,
    ) -> Result<FlowHandle<F::Output>, CoreError> {
        self.admit(erase(logic), Some(logger_name.into())).await
    }

    async fn admit<T: FlowPayload>(
        &self,
        logic: Box<dyn ErasedFlow>,
        logger_name: Option<String>,
    ) -> Result<FlowHandle<T>, CoreError> {
        let result = self
            .request(|reply| Command::AddFlow {
                logic,
                logger_name,
                reply,
            })
            .await?;
        Ok(result.typed())
    }

    /// Result handles of every live flow of a type.
    pub async fn find_flows(&self, flow_type: &str) -> Result<Vec<FlowResult>, CoreError> {
        let flow_type = flow_type.to_string();
        self.request(|reply| Command::FindFlows { flow_type, reply })
            .await
    }

    /// Result handle of a live flow, including flows restored from checkpoints.
    pub async fn result_of(&self, flow_id: FlowId) -> Result<Option<FlowResult>, CoreError> {
        self.request(|reply| Command::ResultOf { flow_id, reply })
            .await
    }

    /// Typed result handle of a live flow.
    pub async fn handle<T: FlowPayload>(
        &self,
        flow_id: FlowId,
    ) -> Result<Option<FlowHandle<T>>, CoreError> {
        Ok(self.result_of(flow_id).await?.map(FlowResult::typed))
    }

    /// Current state of every live flow.
    pub async fn snapshot(&self) -> Result<SchedulerSnapshot, CoreError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Subscribe to flows being added and removed.
    pub fn changes(&self) -> broadcast::Receiver<FlowChange> {
        self.changes.subscribe()
    }

    /// A snapshot plus a change subscription taken at the same point, so no change is
    /// missed or seen twice.
    pub async fn track(
        &self,
    ) -> Result<(SchedulerSnapshot, broadcast::Receiver<FlowChange>), CoreError> {
        self.request(|reply| Command::Track { reply }).await
    }

    /// Scheduler counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop the scheduler task. Checkpoints of live flows stay in the store.
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| CoreError::SchedulerStopped)?;
        rx.await.map_err(|_| CoreError::SchedulerStopped)
    }
}

impl std::fmt::Debug for FlowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowManager")
            .field("node", &self.node)
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}
