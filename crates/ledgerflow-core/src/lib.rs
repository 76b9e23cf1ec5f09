// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ledgerflow Core - Flow Scheduler with Durable Checkpoints
//!
//! This crate runs message-driven protocols ("flows") between ledger nodes. A flow is a
//! serializable state machine that advances one step at a time; every step ends by
//! issuing a single I/O request (send, receive, or send-and-receive) or by completing.
//! While a flow waits for a message it exists only as a checkpoint, so a node restart
//! brings it back exactly where it stopped.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Application code                          │
//! │        FlowManager::add_flow / find_flows / track / snapshot     │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ commands (bounded mpsc)
//!                                 ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Scheduler task                             │
//! │  ┌────────────────┐  ┌─────────────────┐  ┌───────────────────┐  │
//! │  │ live flows     │  │ listener table  │  │ ready queue       │  │
//! │  │ FlowId →       │  │ topic.session → │  │ (flow, resume)    │  │
//! │  │ FlowInstance   │  │ one-shot guard  │  │                   │  │
//! │  └────────────────┘  └────────┬────────┘  └───────────────────┘  │
//! └─────────┬─────────────────────┼──────────────────────▲───────────┘
//!           │ put / remove        │ run_on_next_message  │ inbound events
//!           ▼                     ▼                      │ (unbounded mpsc)
//! ┌───────────────────┐  ┌──────────────────────────────┴───────────┐
//! │  CheckpointStore  │  │            MessagingService              │
//! │  (SQLite/memory)  │  │       (in-memory hub or transport)       │
//! └───────────────────┘  └──────────────────────────────────────────┘
//! ```
//!
//! # Scheduler Operations
//!
//! | Operation | Trigger | Effect |
//! |-----------|---------|--------|
//! | `add_flow` | [`FlowManager`] | Registers the flow, then queues its first step |
//! | `on_suspend` | step issued a request | Checkpoint, listener, then network send |
//! | `on_message` | listener fired | Type check, then resume the waiting flow |
//! | `replace_checkpoint` | suspension with a receive | Supersedes the flow's previous checkpoint |
//! | `remove_checkpoint` | fire-and-forget or completion | Deletes the flow's checkpoint |
//! | `restore` | startup | Re-registers every checkpointed flow before new work |
//!
//! # Flow State Machine
//!
//! ```text
//!     ┌─────────┐  step   ┌─────────┐  request  ┌───────────┐
//!     │ CREATED │────────►│ RUNNING │──────────►│ SUSPENDED │
//!     └─────────┘         └────┬────┘◄──────────└─────┬─────┘
//!                              │       message /      │
//!                 complete     │       send done      │ restore
//!                 or error     │                      │ (after restart)
//!                   ┌──────────┴─────┐                │
//!                   ▼                ▼                ▼
//!             ┌───────────┐    ┌────────┐       ┌───────────┐
//!             │ COMPLETED │    │ FAILED │       │ SUSPENDED │
//!             └───────────┘    └────────┘       └───────────┘
//! ```
//!
//! A flow that fails never takes the scheduler down with it: errors, panics and protocol
//! violations become the flow's [`FlowError`] result and the scheduler moves on.
//!
//! # Configuration
//!
//! [`Config::from_env`] reads:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `LEDGERFLOW_NODE_NAME` | No | `node` | Address of this node |
//! | `LEDGERFLOW_CHECKPOINT_DB` | No | in-memory | SQLite checkpoint file |
//! | `LEDGERFLOW_CHECKPOINTING` | No | `true` | Persist checkpoints at all |
//! | `LEDGERFLOW_COMMAND_QUEUE` | No | `1024` | Scheduler command queue capacity |
//!
//! # Modules
//!
//! - [`io_request`]: Request model and correlation keys
//! - [`payload`]: Payload types, tags and the payload registry
//! - [`flow`]: Flow logic, the suspension hook and result handles
//! - [`scheduler`]: The scheduler task and its [`FlowManager`] handle
//! - [`checkpoint`]: Checkpoint record
//! - [`codec`]: Flow snapshot and wire encoding
//! - [`persistence`]: Checkpoint stores
//! - [`network`]: Messaging abstraction and an in-memory network
//! - [`runtime`]: Builder that wires everything together

#![deny(missing_docs)]

/// Checkpoint record of a suspended flow.
pub mod checkpoint;

/// Encoding of flow snapshots and wire messages.
pub mod codec;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for engine and flow failures.
pub mod error;

/// Flow logic, the suspension hook and result handles.
pub mod flow;

/// I/O requests and correlation keys.
pub mod io_request;

/// Scheduler counters.
pub mod metrics;

/// Messaging abstraction and the in-memory network.
pub mod network;

/// Payload types and the payload registry.
pub mod payload;

/// Checkpoint stores (SQLite and in-memory).
pub mod persistence;

/// Embeddable runtime builder.
pub mod runtime;

/// The flow scheduler and its handle.
pub mod scheduler;

pub use checkpoint::Checkpoint;
pub use codec::{FlowCodec, FlowSnapshot, JsonCodec};
pub use config::{Config, ConfigError, SchedulerConfig};
pub use error::{CoreError, FlowError, Result};
pub use flow::{FlowContext, FlowHandle, FlowLogic, FlowRegistry, FlowResult, FlowState, FlowStep};
pub use io_request::{CallSite, FlowId, IoRequest, MessageId, SessionId, TopicSession};
pub use metrics::{FlowMetrics, MetricsSnapshot};
pub use network::{
    InMemoryEndpoint, InMemoryNetwork, MessageHandler, MessagingService, PeerAddress, RawMessage,
};
pub use payload::{Envelope, FlowPayload, PayloadRegistry, TypeTag, UntrustworthyData};
pub use persistence::{
    CheckpointStore, InMemoryCheckpointStore, SqliteCheckpointStore, open_store,
};
pub use runtime::{FlowRuntime, FlowRuntimeBuilder, FlowRuntimeConfig};
pub use scheduler::{
    ChangeKind, FlowChange, FlowManager, FlowSummary, RestoreReport, SchedulerSnapshot,
};
