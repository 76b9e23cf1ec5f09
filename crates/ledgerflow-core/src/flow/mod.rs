// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow definitions.
//!
//! A flow is a serializable state value that the scheduler drives one step at a time.
//! Each call to [`FlowLogic::advance`] either issues exactly one I/O request through the
//! [`FlowContext`] and returns [`FlowStep::Suspend`], or finishes with
//! [`FlowStep::Complete`]. Because the state value is all there is, a checkpoint of a
//! parked flow is just that value plus the request it is parked on.
//!
//! # Example
//!
//! ```rust,ignore
//! #[derive(Serialize, Deserialize)]
//! enum Ping {
//!     Start { peer: PeerAddress },
//!     AwaitingPong,
//! }
//!
//! impl FlowLogic for Ping {
//!     type Output = String;
//!     const FLOW_TYPE: &'static str = "demo.ping";
//!
//!     fn advance(&mut self, ctx: &mut FlowContext) -> Result<FlowStep<String>, FlowError> {
//!         match self {
//!             Ping::Start { peer } => {
//!                 ctx.send_and_receive::<String, _>(
//!                     "ping", peer.clone(), SessionId(7), SessionId(7), &"hello".to_string(),
//!                 )?;
//!                 *self = Ping::AwaitingPong;
//!                 Ok(FlowStep::Suspend)
//!             }
//!             Ping::AwaitingPong => {
//!                 let pong = ctx.received::<String>()?.validate(Ok::<_, FlowError>)?;
//!                 Ok(FlowStep::Complete(format!("hello {}", pong)))
//!             }
//!         }
//!     }
//! }
//! ```

mod context;
pub(crate) mod instance;
mod result;

pub use self::context::FlowContext;
pub use self::instance::FlowState;
pub use self::result::{FlowHandle, FlowResult};

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{CoreError, FlowError};
use crate::payload::{Envelope, FlowPayload};

/// What a flow step ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowStep<T> {
    /// The flow issued a request and wants to be resumed when it is satisfied.
    Suspend,
    /// The flow finished with a value.
    Complete(T),
}

/// A protocol run by the scheduler.
pub trait FlowLogic: Serialize + DeserializeOwned + Send + 'static {
    /// Value the flow completes with.
    type Output: FlowPayload;

    /// Stable name used to find the flow again when restoring a checkpoint.
    const FLOW_TYPE: &'static str;

    /// Run the flow up to its next suspension point or to completion.
    fn advance(&mut self, ctx: &mut FlowContext) -> Result<FlowStep<Self::Output>, FlowError>;
}

pub(crate) type RestoreFn = fn(Value) -> Result<Box<dyn ErasedFlow>, serde_json::Error>;

/// Object-safe view of a [`FlowLogic`] used by the scheduler.
pub(crate) trait ErasedFlow: Send {
    fn flow_type(&self) -> &'static str;

    fn advance(&mut self, ctx: &mut FlowContext) -> Result<FlowStep<Envelope>, FlowError>;

    fn state(&self) -> Result<Value, serde_json::Error>;

    fn restorer(&self) -> RestoreFn;
}

struct Erased<F>(F);

impl<F: FlowLogic> ErasedFlow for Erased<F> {
    fn flow_type(&self) -> &'static str {
        F::FLOW_TYPE
    }

    fn advance(&mut self, ctx: &mut FlowContext) -> Result<FlowStep<Envelope>, FlowError> {
        match self.0.advance(ctx)? {
            FlowStep::Suspend => Ok(FlowStep::Suspend),
            FlowStep::Complete(output) => Envelope::wrap(&output)
                .map(FlowStep::Complete)
                .map_err(|e| FlowError::Serialization {
                    subject: format!("{} result", F::FLOW_TYPE),
                    details: e.to_string(),
                }),
        }
    }

    fn state(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(&self.0)
    }

    fn restorer(&self) -> RestoreFn {
        restore::<F>
    }
}

fn restore<F: FlowLogic>(state: Value) -> Result<Box<dyn ErasedFlow>, serde_json::Error> {
    Ok(Box::new(Erased(F::deserialize(state)?)))
}

pub(crate) fn erase<F: FlowLogic>(logic: F) -> Box<dyn ErasedFlow> {
    Box::new(Erased(logic))
}

/// Closed set of flow types a node can restore from checkpoints.
///
/// Flows started in this process are learned automatically; flows that may be sitting
/// in the checkpoint store from an earlier run must be registered up front.
#[derive(Clone, Default)]
pub struct FlowRegistry {
    restorers: HashMap<&'static str, RestoreFn>,
}

impl FlowRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a flow type.
    pub fn register<F: FlowLogic>(&mut self) -> &mut Self {
        self.restorers.insert(F::FLOW_TYPE, restore::<F> as RestoreFn);
        self
    }

    /// Whether a flow type is known.
    pub fn contains(&self, flow_type: &str) -> bool {
        self.restorers.contains_key(flow_type)
    }

    pub(crate) fn learn(&mut self, flow_type: &'static str, restorer: RestoreFn) {
        self.restorers.entry(flow_type).or_insert(restorer);
    }

    pub(crate) fn restore(
        &self,
        flow_type: &str,
        state: Value,
    ) -> Result<Box<dyn ErasedFlow>, CoreError> {
        let restorer = self.restorers.get(flow_type).ok_or_else(|| CoreError::CodecError {
            subject: "flow state".to_string(),
            details: format!("unknown flow type '{}'", flow_type),
        })?;
        restorer(state).map_err(|e| CoreError::codec("flow state", e))
    }
}

impl fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.restorers.keys().copied().collect();
        types.sort_unstable();
        f.debug_struct("FlowRegistry").field("types", &types).finish()
    }
}
