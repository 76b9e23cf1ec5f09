// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-assignment result handles.

use std::fmt;
use std::marker::PhantomData;

use tokio::sync::watch;

use crate::error::FlowError;
use crate::io_request::FlowId;
use crate::payload::{Envelope, FlowPayload};

type Slot = Option<Result<Envelope, FlowError>>;

/// Write side of a flow's result, owned by the flow instance.
///
/// Publishing consumes the sender, so a result can only be set once.
pub(crate) struct ResultSender {
    flow_id: FlowId,
    tx: watch::Sender<Slot>,
}

impl ResultSender {
    pub(crate) fn new(flow_id: FlowId) -> Self {
        let (tx, _) = watch::channel(None);
        Self { flow_id, tx }
    }

    pub(crate) fn subscribe(&self) -> FlowResult {
        FlowResult {
            flow_id: self.flow_id,
            rx: self.tx.subscribe(),
        }
    }

    pub(crate) fn publish(self, outcome: Result<Envelope, FlowError>) {
        self.tx.send_replace(Some(outcome));
    }
}

/// Untyped handle to a flow's eventual result.
///
/// Any number of clones may observe the same result.
#[derive(Clone)]
pub struct FlowResult {
    flow_id: FlowId,
    rx: watch::Receiver<Slot>,
}

impl FlowResult {
    /// Id of the flow.
    pub fn id(&self) -> FlowId {
        self.flow_id
    }

    /// Wait for the flow to finish.
    ///
    /// Resolves to [`FlowError::SchedulerStopped`] if the scheduler goes away first.
    pub async fn wait(&self) -> Result<Envelope, FlowError> {
        let mut rx = self.rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone().unwrap_or(Err(FlowError::SchedulerStopped)),
            Err(_) => Err(FlowError::SchedulerStopped),
        }
    }

    /// The result, if the flow has finished.
    pub fn try_get(&self) -> Option<Result<Envelope, FlowError>> {
        self.rx.borrow().clone()
    }

    /// Whether the flow has finished.
    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// View the result as a `T`.
    pub fn typed<T: FlowPayload>(self) -> FlowHandle<T> {
        FlowHandle {
            inner: self,
            _output: PhantomData,
        }
    }
}

impl fmt::Debug for FlowResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowResult")
            .field("flow_id", &self.flow_id)
            .field("done", &self.is_done())
            .finish()
    }
}

/// Typed handle to a flow's eventual result.
pub struct FlowHandle<T> {
    inner: FlowResult,
    _output: PhantomData<fn() -> T>,
}

impl<T: FlowPayload> FlowHandle<T> {
    /// Id of the flow.
    pub fn id(&self) -> FlowId {
        self.inner.flow_id
    }

    /// Wait for the flow to finish and decode its output.
    pub async fn result(&self) -> Result<T, FlowError> {
        decode(self.inner.wait().await?)
    }

    /// The decoded output, if the flow has finished.
    pub fn try_result(&self) -> Option<Result<T, FlowError>> {
        self.inner.try_get().map(|outcome| outcome.and_then(decode))
    }

    /// The untyped handle.
    pub fn untyped(&self) -> &FlowResult {
        &self.inner
    }
}

fn decode<T: FlowPayload>(envelope: Envelope) -> Result<T, FlowError> {
    if !envelope.is::<T>() {
        return Err(FlowError::Deserialization {
            subject: "flow result".to_string(),
            details: format!(
                "result carries {} but {} was requested",
                envelope.type_tag,
                T::TYPE_TAG
            ),
        });
    }
    envelope
        .decode_body()
        .map_err(|e| FlowError::Deserialization {
            subject: "flow result".to_string(),
            details: e.to_string(),
        })
}

impl<T> Clone for FlowHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _output: PhantomData,
        }
    }
}

impl<T> fmt::Debug for FlowHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowHandle")
            .field("flow_id", &self.inner.flow_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_observer_sees_the_result() {
        let sender = ResultSender::new(FlowId::new());
        let first = sender.subscribe().typed::<String>();
        let second = first.clone();
        assert!(first.try_result().is_none());

        let waiter = tokio::spawn(async move { second.result().await });
        sender.publish(Ok(Envelope::wrap(&"done".to_string()).unwrap()));

        assert_eq!(waiter.await.unwrap().unwrap(), "done");
        assert_eq!(first.result().await.unwrap(), "done");
        assert_eq!(first.try_result().unwrap().unwrap(), "done");
    }

    #[tokio::test]
    async fn test_error_result() {
        let sender = ResultSender::new(FlowId::new());
        let handle = sender.subscribe();
        sender.publish(Err(FlowError::protocol("refused")));
        assert_eq!(handle.wait().await, Err(FlowError::protocol("refused")));
    }

    #[tokio::test]
    async fn test_dropped_sender_reports_stopped_scheduler() {
        let sender = ResultSender::new(FlowId::new());
        let handle = sender.subscribe();
        drop(sender);
        assert_eq!(handle.wait().await, Err(FlowError::SchedulerStopped));
    }

    #[tokio::test]
    async fn test_wrong_output_type() {
        let sender = ResultSender::new(FlowId::new());
        let handle = sender.subscribe().typed::<i64>();
        sender.publish(Ok(Envelope::wrap(&"text".to_string()).unwrap()));
        let err = handle.result().await.unwrap_err();
        assert_eq!(err.error_code(), "DESERIALIZATION");
    }
}
