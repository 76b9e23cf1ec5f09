// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for ledgerflow-core.
//!
//! [`FlowRuntime`] wires a checkpoint store, a network layer and the flow and payload
//! registries into a running scheduler.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ledgerflow_core::{FlowRuntime, InMemoryNetwork, PeerAddress, SqliteCheckpointStore};
//!
//! let network = InMemoryNetwork::new();
//! let store = SqliteCheckpointStore::from_path(".data/bank-a.db").await?;
//!
//! let runtime = FlowRuntime::builder()
//!     .network(Arc::new(network.endpoint(PeerAddress::new("bank-a"))))
//!     .store(Arc::new(store))
//!     .flow::<PingFlow>()
//!     .build()?
//!     .start()
//!     .await?;
//!
//! let handle = runtime.manager().add_flow(PingFlow::new(bank_b)).await?;
//! println!("{}", handle.result().await?);
//!
//! runtime.shutdown().await?;
//! ```

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::codec::{FlowCodec, JsonCodec};
use crate::config::SchedulerConfig;
use crate::error::CoreError;
use crate::flow::{FlowLogic, FlowRegistry};
use crate::metrics::FlowMetrics;
use crate::network::MessagingService;
use crate::payload::{FlowPayload, PayloadRegistry};
use crate::persistence::{CheckpointStore, InMemoryCheckpointStore};
use crate::scheduler::{FlowManager, RestoreReport, Scheduler};

const CHANGE_FEED_CAPACITY: usize = 256;

/// Builder for creating a [`FlowRuntime`].
pub struct FlowRuntimeBuilder {
    network: Option<Arc<dyn MessagingService>>,
    store: Option<Arc<dyn CheckpointStore>>,
    codec: Arc<dyn FlowCodec>,
    flows: FlowRegistry,
    payloads: PayloadRegistry,
    config: SchedulerConfig,
}

impl std::fmt::Debug for FlowRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRuntimeBuilder")
            .field("network", &self.network.as_ref().map(|n| n.local_address().clone()))
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("flows", &self.flows)
            .field("payloads", &self.payloads)
            .field("config", &self.config)
            .finish()
    }
}

impl Default for FlowRuntimeBuilder {
    fn default() -> Self {
        Self {
            network: None,
            store: None,
            codec: Arc::new(JsonCodec),
            flows: FlowRegistry::new(),
            payloads: PayloadRegistry::new(),
            config: SchedulerConfig::default(),
        }
    }
}

impl FlowRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the network layer (required).
    pub fn network(mut self, network: Arc<dyn MessagingService>) -> Self {
        self.network = Some(network);
        self
    }

    /// Set the checkpoint store.
    ///
    /// Default: a fresh [`InMemoryCheckpointStore`].
    pub fn store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the codec for flow snapshots and messages.
    ///
    /// Default: [`JsonCodec`].
    pub fn codec(mut self, codec: Arc<dyn FlowCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Register a flow type so its checkpoints can be restored.
    pub fn flow<F: FlowLogic>(mut self) -> Self {
        self.flows.register::<F>();
        self
    }

    /// Register a payload type flows may send or wait for.
    ///
    /// Built-in scalars, strings and byte vectors are always registered.
    pub fn payload<P: FlowPayload>(mut self) -> Self {
        self.payloads.register::<P>();
        self
    }

    /// Set scheduler settings.
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<FlowRuntimeConfig, CoreError> {
        let network = self
            .network
            .ok_or_else(|| CoreError::ConfigurationError {
                field: "network".to_string(),
                message: "network is required".to_string(),
            })?;
        if self.config.command_queue == 0 {
            return Err(CoreError::ConfigurationError {
                field: "command_queue".to_string(),
                message: "must be a positive integer".to_string(),
            });
        }

        Ok(FlowRuntimeConfig {
            network,
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new())),
            codec: self.codec,
            flows: self.flows,
            payloads: self.payloads,
            config: self.config,
        })
    }
}

/// Configuration for a [`FlowRuntime`].
pub struct FlowRuntimeConfig {
    network: Arc<dyn MessagingService>,
    store: Arc<dyn CheckpointStore>,
    codec: Arc<dyn FlowCodec>,
    flows: FlowRegistry,
    payloads: PayloadRegistry,
    config: SchedulerConfig,
}

impl std::fmt::Debug for FlowRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRuntimeConfig")
            .field("node", self.network.local_address())
            .field("store", &"...")
            .field("flows", &self.flows)
            .field("config", &self.config)
            .finish()
    }
}

impl FlowRuntimeConfig {
    /// Restore checkpointed flows, then spawn the scheduler task.
    ///
    /// Restore completes before the scheduler accepts any command, so new flows never
    /// race with restored ones. Only a failure to read the store fails startup; a
    /// checkpoint that cannot be restored is listed in the [`RestoreReport`].
    pub async fn start(self) -> Result<FlowRuntime, CoreError> {
        let node = self.network.local_address().clone();
        let metrics = Arc::new(FlowMetrics::new());
        let (command_tx, command_rx) = mpsc::channel(self.config.command_queue);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);

        let mut scheduler = Scheduler::new(
            self.config,
            self.store,
            self.network,
            self.codec,
            self.flows,
            self.payloads,
            metrics.clone(),
            inbound_tx,
            changes.clone(),
        );
        let restore_report = scheduler.restore_from_checkpoints().await?;
        let task = tokio::spawn(scheduler.run(command_rx, inbound_rx));

        info!(node = %node, restored = restore_report.restored.len(), "FlowRuntime started");

        Ok(FlowRuntime {
            manager: FlowManager::new(command_tx, changes, metrics, node),
            restore_report,
            task,
        })
    }
}

/// A running scheduler.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct FlowRuntime {
    manager: FlowManager,
    restore_report: RestoreReport,
    task: JoinHandle<()>,
}

impl FlowRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> FlowRuntimeBuilder {
        FlowRuntimeBuilder::new()
    }

    /// Handle used to start and observe flows.
    pub fn manager(&self) -> &FlowManager {
        &self.manager
    }

    /// What happened to the checkpoints found at startup.
    pub fn restore_report(&self) -> &RestoreReport {
        &self.restore_report
    }

    /// Stop the scheduler and wait for its task to finish.
    ///
    /// Checkpoints of flows that are still waiting stay in the store.
    pub async fn shutdown(self) -> Result<(), CoreError> {
        info!(node = %self.manager.node(), "FlowRuntime shutting down...");

        // The task may already be gone if every other handle was dropped.
        let _ = self.manager.shutdown().await;
        drop(self.manager);

        match self.task.await {
            Ok(()) => {
                info!("FlowRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Flow scheduler task failed: {}", e);
                Err(CoreError::SchedulerStopped)
            }
        }
    }
}

impl std::fmt::Debug for FlowRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRuntime")
            .field("manager", &self.manager)
            .field("restore_report", &self.restore_report)
            .finish()
    }
}
