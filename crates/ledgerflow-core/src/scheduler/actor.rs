// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The scheduler task.
//!
//! [`Scheduler`] owns every live flow, the listener table and the record of which flows
//! hold a checkpoint. It runs on a single tokio task and processes, one at a time:
//! commands from [`FlowManager`](super::FlowManager) handles, events posted by listener
//! handlers, and flows queued to continue after a fire-and-forget send.
//!
//! Suspension follows a fixed order: check the correlation key is free, persist the
//! checkpoint, register the listener, and only then hand outbound data to the network.
//! If the process dies after the checkpoint is written but before the send, the flow is
//! restored waiting for a response that was never requested; the reverse order could
//! lose the checkpoint for a message that is already on its way.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, instrument, trace, warn};

use super::listener::{self, Inbound, Listener, ListenerGuard, ListenerId};
use super::{ChangeKind, Command, FlowChange, FlowSummary, RestoreReport, SchedulerSnapshot};
use crate::checkpoint::Checkpoint;
use crate::codec::FlowCodec;
use crate::config::SchedulerConfig;
use crate::error::{CoreError, FlowError};
use crate::flow::instance::{FlowInstance, Resume, StepOutcome};
use crate::flow::{ErasedFlow, FlowRegistry, FlowResult};
use crate::io_request::{CallSite, FlowId, IoRequest, TopicSession};
use crate::metrics::FlowMetrics;
use crate::network::{MessagingService, PeerAddress, RawMessage};
use crate::payload::{Envelope, PayloadRegistry, TypeTag};
use crate::persistence::CheckpointStore;

pub(crate) struct Scheduler {
    node: PeerAddress,
    config: SchedulerConfig,
    store: Arc<dyn CheckpointStore>,
    network: Arc<dyn MessagingService>,
    codec: Arc<dyn FlowCodec>,
    flows: FlowRegistry,
    payloads: PayloadRegistry,
    metrics: Arc<FlowMetrics>,
    live: HashMap<FlowId, FlowInstance>,
    /// Checkpoint id currently persisted for each flow.
    checkpoints: HashMap<FlowId, String>,
    awaiting: HashMap<TopicSession, ListenerId>,
    listeners: HashMap<ListenerId, Listener>,
    next_listener: ListenerId,
    ready: VecDeque<(FlowId, Resume)>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    changes: broadcast::Sender<FlowChange>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: SchedulerConfig,
        store: Arc<dyn CheckpointStore>,
        network: Arc<dyn MessagingService>,
        codec: Arc<dyn FlowCodec>,
        flows: FlowRegistry,
        payloads: PayloadRegistry,
        metrics: Arc<FlowMetrics>,
        inbound_tx: mpsc::UnboundedSender<Inbound>,
        changes: broadcast::Sender<FlowChange>,
    ) -> Self {
        Self {
            node: network.local_address().clone(),
            config,
            store,
            network,
            codec,
            flows,
            payloads,
            metrics,
            live: HashMap::new(),
            checkpoints: HashMap::new(),
            awaiting: HashMap::new(),
            listeners: HashMap::new(),
            next_listener: 0,
            ready: VecDeque::new(),
            inbound_tx,
            changes,
        }
    }

    /// Bring back every checkpointed flow. Runs once, before the loop starts.
    ///
    /// A checkpoint that cannot be restored only affects its own flow; it is reported
    /// and left in the store.
    #[instrument(skip(self), fields(node = %self.node))]
    pub(crate) async fn restore_from_checkpoints(&mut self) -> Result<RestoreReport, CoreError> {
        let checkpoints = self.store.list_all().await?;
        let mut report = RestoreReport::default();

        for checkpoint in checkpoints {
            let flow_id = checkpoint.flow_id;
            match self.restore_one(checkpoint) {
                Ok(()) => report.restored.push(flow_id),
                Err(e) => {
                    error!(flow_id = %flow_id, error = %e, "Failed to restore flow from checkpoint");
                    self.metrics.restore_failed();
                    report.failed.push((flow_id, e));
                }
            }
        }

        info!(
            restored = report.restored.len(),
            failed = report.failed.len(),
            "Restored flows from checkpoints"
        );
        Ok(report)
    }

    fn restore_one(&mut self, checkpoint: Checkpoint) -> Result<(), CoreError> {
        let flow_id = checkpoint.flow_id;
        if self.live.contains_key(&flow_id) {
            return Err(CoreError::restore(flow_id, "flow is already live"));
        }
        if !checkpoint.verify() {
            return Err(CoreError::restore(
                flow_id,
                "checkpoint id does not match its state",
            ));
        }

        let snapshot = self
            .codec
            .deserialize(&checkpoint.serialized_flow_state)
            .map_err(|e| CoreError::restore(flow_id, e))?;
        if snapshot.flow_id != flow_id {
            return Err(CoreError::restore(
                flow_id,
                format!("snapshot belongs to flow {}", snapshot.flow_id),
            ));
        }
        let Some(awaiting) = snapshot.awaiting.as_ref() else {
            return Err(CoreError::restore(flow_id, "snapshot is not awaiting a message"));
        };
        if awaiting.receive_topic_session().as_ref() != Some(&checkpoint.awaiting_topic)
            || awaiting.expected_type() != Some(&checkpoint.awaiting_type)
        {
            return Err(CoreError::restore(
                flow_id,
                format!(
                    "checkpoint waits for '{}' on {} but the flow is parked on {}",
                    checkpoint.awaiting_type,
                    checkpoint.awaiting_topic,
                    awaiting.topic()
                ),
            ));
        }
        if !self.payloads.resolve(&checkpoint.awaiting_type) {
            return Err(CoreError::restore(
                flow_id,
                format!(
                    "expected type '{}' is not a registered payload",
                    checkpoint.awaiting_type
                ),
            ));
        }
        if let Some(other) = self
            .awaiting
            .get(&checkpoint.awaiting_topic)
            .and_then(|id| self.listeners.get(id))
        {
            return Err(CoreError::restore(
                flow_id,
                format!(
                    "flow {} is already waiting on {}",
                    other.flow_id, checkpoint.awaiting_topic
                ),
            ));
        }

        let logic = self
            .flows
            .restore(&snapshot.flow_type, snapshot.state.clone())
            .map_err(|e| CoreError::restore(flow_id, e))?;
        let instance = FlowInstance::restored(snapshot, logic);
        let flow_type = instance.flow_type();

        self.live.insert(flow_id, instance);
        self.checkpoints.insert(flow_id, checkpoint.checkpoint_id);
        self.register_listener(
            flow_id,
            checkpoint.awaiting_topic.clone(),
            checkpoint.awaiting_type,
            checkpoint.call_site,
        );
        self.metrics.flow_restored();
        self.publish_change(flow_id, flow_type, ChangeKind::Added);

        debug!(
            flow_id = %flow_id,
            flow_type,
            topic = %checkpoint.awaiting_topic,
            "Restored flow"
        );
        Ok(())
    }

    /// Process commands and inbound events until shutdown or until every handle is gone.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
    ) {
        info!(node = %self.node, live = self.live.len(), "Flow scheduler started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop();
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = inbound.recv() => self.handle_inbound(event).await,
                () = async {}, if !self.ready.is_empty() => {
                    if let Some((flow_id, resume)) = self.ready.pop_front() {
                        self.drive(flow_id, resume).await;
                    }
                }
            }
        }

        self.stop();
    }

    /// Withdraw every listener still held. Checkpoints stay, and the transport keeps any
    /// later traffic for whichever scheduler restores these flows.
    fn stop(&mut self) {
        for listener in self.listeners.values() {
            self.withdraw(listener);
        }
        info!(
            node = %self.node,
            live = self.live.len(),
            "Flow scheduler stopped"
        );
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddFlow {
                logic,
                logger_name,
                reply,
            } => {
                let result = self.add_flow(logic, logger_name);
                let _ = reply.send(result);
            }
            Command::FindFlows { flow_type, reply } => {
                let found = self
                    .live
                    .values()
                    .filter(|instance| instance.flow_type() == flow_type)
                    .map(FlowInstance::subscribe)
                    .collect();
                let _ = reply.send(found);
            }
            Command::ResultOf { flow_id, reply } => {
                let _ = reply.send(self.live.get(&flow_id).map(FlowInstance::subscribe));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Track { reply } => {
                let _ = reply.send((self.snapshot(), self.changes.subscribe()));
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn add_flow(
        &mut self,
        logic: Box<dyn ErasedFlow>,
        logger_name: Option<String>,
    ) -> FlowResult {
        let flow_id = FlowId::new();
        let flow_type = logic.flow_type();
        let logger_name = logger_name.unwrap_or_else(|| flow_type.to_string());
        self.flows.learn(flow_type, logic.restorer());

        let instance = FlowInstance::new(flow_id, logger_name, logic);
        let result = instance.subscribe();
        self.live.insert(flow_id, instance);
        self.metrics.flow_started();
        self.publish_change(flow_id, flow_type, ChangeKind::Added);
        self.ready.push_back((flow_id, Resume::Start));

        debug!(flow_id = %flow_id, flow_type, "Admitted flow");
        result
    }

    async fn handle_inbound(&mut self, event: Inbound) {
        match event {
            Inbound::Message {
                listener_id,
                message,
            } => self.on_message(listener_id, message).await,
            Inbound::Duplicate {
                listener_id,
                flow_id,
                topic_session,
                call_site,
            } => {
                self.on_duplicate(listener_id, flow_id, topic_session, call_site)
                    .await
            }
        }
    }

    /// Step a flow and act on what it did.
    async fn drive(&mut self, flow_id: FlowId, resume: Resume) {
        let Some(instance) = self.live.get_mut(&flow_id) else {
            debug!(flow_id = %flow_id, "Flow is no longer live, skipping resume");
            return;
        };

        match instance.step(resume) {
            StepOutcome::Suspended(request) => {
                if let Err(e) = self.on_suspend(flow_id, request).await {
                    self.finish(flow_id, Err(e)).await;
                }
            }
            StepOutcome::Finished(outcome) => self.finish(flow_id, outcome).await,
        }
    }

    #[instrument(skip(self, request), fields(flow_id = %flow_id, topic = %request.topic()))]
    async fn on_suspend(&mut self, flow_id: FlowId, request: IoRequest) -> Result<(), FlowError> {
        let call_site = request.call_site().clone();

        if let (Some(key), Some(expected)) =
            (request.receive_topic_session(), request.expected_type())
        {
            if let Some(holder) = self
                .awaiting
                .get(&key)
                .and_then(|id| self.listeners.get(id))
            {
                warn!(
                    flow_id = %flow_id,
                    holder = %holder.flow_id,
                    topic = %key,
                    "Rejecting second wait on a correlation key"
                );
                return Err(FlowError::DuplicateWait {
                    topic: key.to_string(),
                    call_site,
                });
            }
            if !self.payloads.resolve(expected) {
                return Err(FlowError::Deserialization {
                    subject: format!("expected type '{}'", expected),
                    details: "type is not a registered payload".to_string(),
                });
            }

            self.replace_checkpoint(flow_id, &key, expected, &call_site)
                .await?;
            self.register_listener(flow_id, key, expected.clone(), call_site.clone());
        }

        if let (Some(destination), Some(payload), Some(key), Some(message_id)) = (
            request.destination(),
            request.payload(),
            request.send_topic_session(),
            request.message_id(),
        ) {
            let data = self
                .codec
                .encode_message(payload)
                .map_err(|e| FlowError::Serialization {
                    subject: format!("message on {}", key),
                    details: e.to_string(),
                })?;
            trace!("-> {}/{}", destination, key);
            self.network
                .send(
                    RawMessage {
                        topic_session: key,
                        message_id,
                        data,
                    },
                    destination,
                )
                .await
                .map_err(|e| FlowError::Network(e.to_string()))?;
        }

        if !request.expects_response() {
            // Nothing to wait for: the flow no longer needs a checkpoint.
            self.remove_checkpoint(flow_id).await;
            self.ready.push_back((flow_id, Resume::Continue));
        }
        Ok(())
    }

    /// Persist the flow's current state, superseding any earlier checkpoint.
    async fn replace_checkpoint(
        &mut self,
        flow_id: FlowId,
        key: &TopicSession,
        expected: &TypeTag,
        call_site: &CallSite,
    ) -> Result<(), FlowError> {
        if !self.config.checkpointing {
            return Ok(());
        }
        let Some(instance) = self.live.get(&flow_id) else {
            return Ok(());
        };

        let snapshot = instance.snapshot()?;
        let bytes = self
            .codec
            .serialize(&snapshot)
            .map_err(|e| FlowError::Checkpoint(e.to_string()))?;
        let checkpoint = Checkpoint::new(
            flow_id,
            snapshot.flow_type,
            snapshot.logger_name,
            bytes,
            key.clone(),
            expected.clone(),
            call_site.clone(),
        );
        let checkpoint_id = checkpoint.checkpoint_id.clone();

        self.store
            .put(flow_id, checkpoint)
            .await
            .map_err(|e| FlowError::Checkpoint(e.to_string()))?;
        self.metrics.checkpoint_written();
        debug!(
            flow_id = %flow_id,
            checkpoint_id = %checkpoint_id,
            topic = %key,
            "Checkpoint written"
        );
        self.checkpoints.insert(flow_id, checkpoint_id);
        Ok(())
    }

    /// Delete the flow's checkpoint if it holds one. Store errors are logged.
    async fn remove_checkpoint(&mut self, flow_id: FlowId) {
        let Some(checkpoint_id) = self.checkpoints.remove(&flow_id) else {
            return;
        };
        match self.store.remove(flow_id).await {
            Ok(()) => {
                self.metrics.checkpoint_removed();
                debug!(flow_id = %flow_id, checkpoint_id = %checkpoint_id, "Checkpoint removed");
            }
            Err(e) => {
                error!(flow_id = %flow_id, error = %e, "Failed to remove checkpoint");
            }
        }
    }

    /// Take the handler back from the network before disarming it, so a message racing
    /// the withdrawal is either resumed normally or left with the transport.
    fn withdraw(&self, listener: &Listener) {
        self.network.cancel_next_message(&listener.topic_session);
        listener.guard.cancel();
    }

    fn register_listener(
        &mut self,
        flow_id: FlowId,
        topic_session: TopicSession,
        expected_type: TypeTag,
        call_site: CallSite,
    ) {
        let listener_id = self.next_listener;
        self.next_listener += 1;

        let listener = Listener {
            flow_id,
            topic_session: topic_session.clone(),
            expected_type,
            call_site,
            guard: ListenerGuard::new(),
        };
        let handler = listener::handler(listener_id, &listener, self.inbound_tx.clone());

        self.awaiting.insert(topic_session.clone(), listener_id);
        self.listeners.insert(listener_id, listener);
        self.network.run_on_next_message(topic_session, handler);
    }

    #[instrument(skip(self, message), fields(topic = %message.topic_session))]
    async fn on_message(&mut self, listener_id: ListenerId, message: RawMessage) {
        let Some(listener) = self.listeners.remove(&listener_id) else {
            debug!("Message for a retired listener");
            return;
        };
        self.awaiting.remove(&listener.topic_session);
        let flow_id = listener.flow_id;
        if !self.live.contains_key(&flow_id) {
            return;
        }

        let envelope = match self.accept(&listener, &message) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.finish(flow_id, Err(e)).await;
                return;
            }
        };

        trace!(
            "<- {}: message of type {}",
            listener.topic_session, envelope.type_tag
        );
        self.drive(
            flow_id,
            Resume::Deliver {
                topic: listener.topic_session,
                envelope,
            },
        )
        .await;
    }

    /// Decode an inbound message and check it carries the awaited type.
    fn accept(&self, listener: &Listener, message: &RawMessage) -> Result<Envelope, FlowError> {
        let envelope = self
            .codec
            .decode_message(&message.data)
            .map_err(|e| FlowError::Deserialization {
                subject: format!("message on {}", listener.topic_session),
                details: e.to_string(),
            })?;

        if envelope.type_tag != listener.expected_type {
            return Err(FlowError::TypeMismatch {
                expected: listener.expected_type.to_string(),
                actual: envelope.type_tag.to_string(),
                topic: listener.topic_session.to_string(),
                call_site: listener.call_site.clone(),
            });
        }

        match self.payloads.validate(&envelope) {
            Ok(true) => Ok(envelope),
            Ok(false) => Err(FlowError::Deserialization {
                subject: format!("message on {}", listener.topic_session),
                details: format!("type '{}' is not a registered payload", envelope.type_tag),
            }),
            Err(e) => Err(FlowError::Deserialization {
                subject: format!("{} on {}", envelope.type_tag, listener.topic_session),
                details: e.to_string(),
            }),
        }
    }

    async fn on_duplicate(
        &mut self,
        listener_id: ListenerId,
        flow_id: FlowId,
        topic_session: TopicSession,
        call_site: CallSite,
    ) {
        self.metrics.delivery_anomaly();
        error!(
            flow_id = %flow_id,
            listener_id,
            topic = %topic_session,
            call_site = %call_site,
            "Duplicate delivery on a one-shot listener"
        );
        if self.live.contains_key(&flow_id) {
            self.finish(
                flow_id,
                Err(FlowError::DuplicateDelivery {
                    topic: topic_session.to_string(),
                    call_site,
                }),
            )
            .await;
        }
    }

    /// Completion bookkeeping. Runs once per flow: removal from the live map makes any
    /// later call a no-op.
    async fn finish(&mut self, flow_id: FlowId, outcome: Result<Envelope, FlowError>) {
        let Some(instance) = self.live.remove(&flow_id) else {
            return;
        };

        let owned: Vec<ListenerId> = self
            .listeners
            .iter()
            .filter(|(_, listener)| listener.flow_id == flow_id)
            .map(|(id, _)| *id)
            .collect();
        for listener_id in owned {
            if let Some(listener) = self.listeners.remove(&listener_id) {
                self.withdraw(&listener);
                self.awaiting.remove(&listener.topic_session);
            }
        }
        self.ready.retain(|(id, _)| *id != flow_id);
        self.remove_checkpoint(flow_id).await;

        let flow_type = instance.flow_type();
        match &outcome {
            Ok(_) => {
                self.metrics.flow_finished(false);
                info!(flow_id = %flow_id, flow_type, logger = instance.logger_name(), "Flow completed");
            }
            Err(e) => {
                self.metrics.flow_finished(true);
                let call_site = instance
                    .last_call_site()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "<not suspended>".to_string());
                error!(
                    flow_id = %flow_id,
                    flow_type,
                    logger = instance.logger_name(),
                    error_code = e.error_code(),
                    call_site = %call_site,
                    "Flow failed: {}",
                    e
                );
            }
        }
        self.publish_change(flow_id, flow_type, ChangeKind::Removed);
        instance.resolve(outcome);
    }

    fn publish_change(&self, flow_id: FlowId, flow_type: &str, kind: ChangeKind) {
        // No subscribers is fine.
        let _ = self.changes.send(FlowChange {
            flow_id,
            flow_type: flow_type.to_string(),
            kind,
        });
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        let mut flows: Vec<FlowSummary> = self
            .live
            .values()
            .map(|instance| FlowSummary {
                flow_id: instance.id(),
                flow_type: instance.flow_type().to_string(),
                logger_name: instance.logger_name().to_string(),
                state: instance.state(),
                awaiting: instance.awaiting().and_then(IoRequest::receive_topic_session),
                has_checkpoint: self.checkpoints.contains_key(&instance.id()),
            })
            .collect();
        flows.sort_by_key(|summary| summary.flow_id);

        SchedulerSnapshot {
            flows,
            listeners: self.listeners.len(),
            ready: self.ready.len(),
        }
    }
}
