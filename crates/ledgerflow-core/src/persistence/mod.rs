// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpoint storage interfaces and backends.
//!
//! The scheduler is the only writer. It needs atomic single-key `put` and `remove`; no
//! cross-key transactions are required.

pub mod memory;
pub mod sqlite;

pub use self::memory::InMemoryCheckpointStore;
pub use self::sqlite::SqliteCheckpointStore;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::error::CoreError;
use crate::io_request::FlowId;

/// Durable storage for flow checkpoints, keyed by flow id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Every stored checkpoint. Only used at startup.
    async fn list_all(&self) -> Result<Vec<Checkpoint>, CoreError>;

    /// Store a checkpoint, replacing any earlier one for the same flow.
    async fn put(&self, flow_id: FlowId, checkpoint: Checkpoint) -> Result<(), CoreError>;

    /// Delete the checkpoint of a flow. Removing a missing checkpoint is not an error.
    async fn remove(&self, flow_id: FlowId) -> Result<(), CoreError>;

    /// The checkpoint of a flow, if any.
    async fn get(&self, flow_id: FlowId) -> Result<Option<Checkpoint>, CoreError>;
}

/// Open the checkpoint store a [`Config`] asks for.
///
/// A configured database path gives a [`SqliteCheckpointStore`]; otherwise checkpoints
/// are kept in memory.
pub async fn open_store(config: &Config) -> Result<Arc<dyn CheckpointStore>, CoreError> {
    match &config.checkpoint_db {
        Some(path) => {
            info!(path = ?path, "Using SQLite checkpoint store");
            Ok(Arc::new(SqliteCheckpointStore::from_path(path).await?))
        }
        None => {
            info!("Using in-memory checkpoint store");
            Ok(Arc::new(InMemoryCheckpointStore::new()))
        }
    }
}
