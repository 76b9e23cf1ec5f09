// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for ledgerflow-core.
//!
//! [`CoreError`] covers the engine's own infrastructure (storage, network, codec,
//! restore). [`FlowError`] is the terminal error of a single flow and is what
//! observers of a flow's result handle receive.

use std::fmt;

use thiserror::Error;

use crate::io_request::CallSite;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Engine errors that can occur outside of a single flow's protocol body.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// The checkpoint store rejected an operation.
    StoreError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// The network layer rejected an operation.
    NetworkError {
        /// The destination or topic involved.
        target: String,
        /// Error details.
        details: String,
    },

    /// Flow state or a wire payload could not be encoded or decoded.
    CodecError {
        /// What was being encoded or decoded.
        subject: String,
        /// Error details.
        details: String,
    },

    /// A persisted checkpoint could not be turned back into a live flow.
    RestoreError {
        /// The flow the checkpoint belongs to.
        flow_id: String,
        /// The reason restore failed.
        reason: String,
    },

    /// The scheduler task is no longer running.
    SchedulerStopped,

    /// The runtime was misconfigured.
    ConfigurationError {
        /// The setting at fault.
        field: String,
        /// The validation error message.
        message: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::StoreError { .. } => "STORE_ERROR",
            Self::NetworkError { .. } => "NETWORK_ERROR",
            Self::CodecError { .. } => "CODEC_ERROR",
            Self::RestoreError { .. } => "RESTORE_ERROR",
            Self::SchedulerStopped => "SCHEDULER_STOPPED",
            Self::ConfigurationError { .. } => "CONFIGURATION_ERROR",
        }
    }

    pub(crate) fn store(operation: &str, details: impl fmt::Display) -> Self {
        Self::StoreError {
            operation: operation.to_string(),
            details: details.to_string(),
        }
    }

    pub(crate) fn codec(subject: &str, details: impl fmt::Display) -> Self {
        Self::CodecError {
            subject: subject.to_string(),
            details: details.to_string(),
        }
    }

    pub(crate) fn restore(flow_id: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::RestoreError {
            flow_id: flow_id.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StoreError { operation, details } => {
                write!(f, "Checkpoint store error during '{}': {}", operation, details)
            }
            Self::NetworkError { target, details } => {
                write!(f, "Network error for '{}': {}", target, details)
            }
            Self::CodecError { subject, details } => {
                write!(f, "Failed to encode or decode {}: {}", subject, details)
            }
            Self::RestoreError { flow_id, reason } => {
                write!(f, "Failed to restore flow '{}': {}", flow_id, reason)
            }
            Self::SchedulerStopped => write!(f, "Flow scheduler is not running"),
            Self::ConfigurationError { field, message } => {
                write!(f, "Configuration error for '{}': {}", field, message)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::StoreError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::CodecError {
            subject: "json".to_string(),
            details: err.to_string(),
        }
    }
}

/// Terminal error of a single flow.
///
/// Every variant is fatal to the flow it is raised for and to that flow only; the
/// scheduler converts it into the flow's result and keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    /// The flow broke the one-request-per-suspension rule.
    #[error("suspension protocol violated at {call_site}: {message}")]
    SuspensionProtocol {
        /// What went wrong.
        message: String,
        /// Where the offending request was issued.
        call_site: CallSite,
    },

    /// A one-shot listener fired a second time.
    #[error("duplicate delivery on {topic} (flow was waiting at {call_site})")]
    DuplicateDelivery {
        /// The correlation key the listener was registered on.
        topic: String,
        /// Where the flow issued the receive.
        call_site: CallSite,
    },

    /// Another wait is already registered on the same correlation key.
    #[error("another flow is already waiting on {topic} (requested at {call_site})")]
    DuplicateWait {
        /// The contested correlation key.
        topic: String,
        /// Where the rejected request was issued.
        call_site: CallSite,
    },

    /// The inbound payload was not of the type the flow was waiting for.
    #[error("expected {expected} on {topic} but received {actual} (flow was waiting at {call_site})")]
    TypeMismatch {
        /// Declared expected type tag.
        expected: String,
        /// Type tag carried by the message.
        actual: String,
        /// The correlation key the message arrived on.
        topic: String,
        /// Where the flow issued the receive.
        call_site: CallSite,
    },

    /// A payload could not be decoded into its declared type.
    #[error("failed to deserialize {subject}: {details}")]
    Deserialization {
        /// What was being decoded.
        subject: String,
        /// Error details.
        details: String,
    },

    /// A value could not be encoded for the wire or a checkpoint.
    #[error("failed to serialize {subject}: {details}")]
    Serialization {
        /// What was being encoded.
        subject: String,
        /// Error details.
        details: String,
    },

    /// The flow's checkpoint could not be written.
    #[error("checkpoint failed: {0}")]
    Checkpoint(String),

    /// Outbound data could not be handed to the network layer.
    #[error("send failed: {0}")]
    Network(String),

    /// The protocol body returned an error of its own.
    #[error("{0}")]
    Protocol(String),

    /// The protocol body panicked.
    #[error("flow panicked: {0}")]
    Panicked(String),

    /// The scheduler stopped before the flow finished.
    #[error("flow scheduler stopped before the flow finished")]
    SchedulerStopped,
}

impl FlowError {
    /// Build a protocol error from any displayable message.
    pub fn protocol(message: impl fmt::Display) -> Self {
        Self::Protocol(message.to_string())
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::SuspensionProtocol { .. } => "SUSPENSION_PROTOCOL",
            Self::DuplicateDelivery { .. } => "DUPLICATE_DELIVERY",
            Self::DuplicateWait { .. } => "DUPLICATE_WAIT",
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
            Self::Deserialization { .. } => "DESERIALIZATION",
            Self::Serialization { .. } => "SERIALIZATION",
            Self::Checkpoint(_) => "CHECKPOINT_FAILED",
            Self::Network(_) => "NETWORK",
            Self::Protocol(_) => "PROTOCOL",
            Self::Panicked(_) => "PANICKED",
            Self::SchedulerStopped => "SCHEDULER_STOPPED",
        }
    }
}
