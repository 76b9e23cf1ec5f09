// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory checkpoint store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::CheckpointStore;
use crate::checkpoint::Checkpoint;
use crate::error::CoreError;
use crate::io_request::FlowId;

/// Checkpoint store kept in process memory.
///
/// Clones share the same map, so a scheduler started again with a clone sees what the
/// previous one left behind.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<FlowId, Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints.
    pub async fn len(&self) -> usize {
        self.checkpoints.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.checkpoints.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn list_all(&self) -> Result<Vec<Checkpoint>, CoreError> {
        let mut all: Vec<_> = self.checkpoints.read().await.values().cloned().collect();
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.flow_id.cmp(&b.flow_id))
        });
        Ok(all)
    }

    async fn put(&self, flow_id: FlowId, checkpoint: Checkpoint) -> Result<(), CoreError> {
        self.checkpoints.write().await.insert(flow_id, checkpoint);
        Ok(())
    }

    async fn remove(&self, flow_id: FlowId) -> Result<(), CoreError> {
        self.checkpoints.write().await.remove(&flow_id);
        Ok(())
    }

    async fn get(&self, flow_id: FlowId) -> Result<Option<Checkpoint>, CoreError> {
        Ok(self.checkpoints.read().await.get(&flow_id).cloned())
    }
}
