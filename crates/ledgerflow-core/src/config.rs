// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;

/// Default capacity of the scheduler command queue.
pub const DEFAULT_COMMAND_QUEUE: usize = 1024;

/// Ledgerflow node configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address of this node on the network layer
    pub node_name: String,
    /// SQLite file for checkpoints; `None` keeps checkpoints in memory
    pub checkpoint_db: Option<PathBuf>,
    /// Whether checkpoints are persisted at all
    pub checkpointing: bool,
    /// Capacity of the scheduler command queue
    pub command_queue: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `LEDGERFLOW_NODE_NAME`: node address (default: node)
    /// - `LEDGERFLOW_CHECKPOINT_DB`: SQLite checkpoint file (default: in-memory store)
    /// - `LEDGERFLOW_CHECKPOINTING`: persist checkpoints (default: true)
    /// - `LEDGERFLOW_COMMAND_QUEUE`: scheduler queue capacity (default: 1024)
    pub fn from_env() -> Result<Self, ConfigError> {
        let node_name = std::env::var("LEDGERFLOW_NODE_NAME").unwrap_or_else(|_| "node".to_string());
        if node_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "LEDGERFLOW_NODE_NAME",
                "must not be empty",
            ));
        }

        let checkpoint_db = std::env::var("LEDGERFLOW_CHECKPOINT_DB")
            .ok()
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);

        let checkpointing = match std::env::var("LEDGERFLOW_CHECKPOINTING") {
            Ok(value) => parse_bool(&value).ok_or(ConfigError::Invalid(
                "LEDGERFLOW_CHECKPOINTING",
                "must be true or false",
            ))?,
            Err(_) => true,
        };

        let command_queue: usize = std::env::var("LEDGERFLOW_COMMAND_QUEUE")
            .unwrap_or_else(|_| DEFAULT_COMMAND_QUEUE.to_string())
            .parse()
            .ok()
            .filter(|capacity| *capacity > 0)
            .ok_or(ConfigError::Invalid(
                "LEDGERFLOW_COMMAND_QUEUE",
                "must be a positive integer",
            ))?;

        Ok(Self {
            node_name,
            checkpoint_db,
            checkpointing,
            command_queue,
        })
    }

    /// Scheduler settings derived from this configuration.
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            checkpointing: self.checkpointing,
            command_queue: self.command_queue,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Settings of the flow scheduler itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Whether checkpoints are written to the store.
    ///
    /// With checkpointing off, listeners and resumption work as usual but nothing
    /// survives a restart.
    pub checkpointing: bool,
    /// Capacity of the command queue between handles and the scheduler task.
    pub command_queue: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            checkpointing: true,
            command_queue: DEFAULT_COMMAND_QUEUE,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
