// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Listener guarantees against a misbehaving transport: handlers that fire twice,
//! handlers that fire after their flow is gone, and sends that fail.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use ledgerflow_core::{
    CoreError, FlowError, FlowRuntime, InMemoryCheckpointStore, MessageHandler, MessagingService,
    PeerAddress, RawMessage, SessionId, TopicSession,
};

/// Transport that hands every registered handler to the test instead of routing.
struct CapturingService {
    address: PeerAddress,
    fail_sends: bool,
    handlers: Mutex<Vec<(TopicSession, MessageHandler)>>,
    cancelled: Mutex<Vec<TopicSession>>,
    sent: Mutex<Vec<(PeerAddress, RawMessage)>>,
}

impl CapturingService {
    fn new(fail_sends: bool) -> Arc<Self> {
        Arc::new(Self {
            address: PeerAddress::new("bank-a"),
            fail_sends,
            handlers: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn was_cancelled(&self, topic_session: &TopicSession) -> bool {
        self.cancelled.lock().unwrap().contains(topic_session)
    }

    fn handler(&self, index: usize) -> Option<MessageHandler> {
        self.handlers
            .lock()
            .unwrap()
            .get(index)
            .map(|(_, handler)| handler.clone())
    }
}

#[async_trait]
impl MessagingService for CapturingService {
    async fn send(&self, message: RawMessage, destination: &PeerAddress) -> Result<(), CoreError> {
        if self.fail_sends {
            return Err(CoreError::NetworkError {
                target: destination.to_string(),
                details: "connection refused".to_string(),
            });
        }
        self.sent.lock().unwrap().push((destination.clone(), message));
        Ok(())
    }

    fn run_on_next_message(&self, topic_session: TopicSession, handler: MessageHandler) {
        self.handlers.lock().unwrap().push((topic_session, handler));
    }

    fn cancel_next_message(&self, topic_session: &TopicSession) {
        self.cancelled.lock().unwrap().push(topic_session.clone());
    }

    fn local_address(&self) -> &PeerAddress {
        &self.address
    }
}

async fn start(service: Arc<CapturingService>) -> FlowRuntime {
    start_with_store(service, InMemoryCheckpointStore::new()).await
}

async fn start_with_store(
    service: Arc<CapturingService>,
    store: InMemoryCheckpointStore,
) -> FlowRuntime {
    init_tracing();
    FlowRuntime::builder()
        .network(service)
        .store(Arc::new(store))
        .flow::<Waiter>()
        .flow::<Ping>()
        .flow::<Relay>()
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
}

async fn nth_handler(service: &Arc<CapturingService>, index: usize) -> MessageHandler {
    wait_until(|| {
        let service = service.clone();
        async move { service.handler(index) }
    })
    .await
}

async fn first_handler(service: &Arc<CapturingService>) -> MessageHandler {
    nth_handler(service, 0).await
}

#[tokio::test]
async fn test_second_delivery_on_one_shot_listener_is_reported() {
    let service = CapturingService::new(false);
    let node = start(service.clone()).await;

    let handle = node.manager().add_flow(Waiter::on("offer", 5)).await.unwrap();
    let handler = first_handler(&service).await;

    handler(raw("offer", 5, &"first".to_string()));
    handler(raw("offer", 5, &"second".to_string()));

    assert_eq!(within(handle.result()).await.unwrap(), "first");
    let manager = node.manager().clone();
    wait_until(|| {
        let manager = manager.clone();
        async move { (manager.metrics().delivery_anomalies == 1).then_some(()) }
    })
    .await;

    let metrics = node.manager().metrics();
    assert_eq!(metrics.finished, 1);
    assert_eq!(metrics.failed, 0);
    assert_eq!(service.handlers.lock().unwrap().len(), 1);

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_send_failure_fails_flow_and_disarms_its_listener() {
    let service = CapturingService::new(true);
    let node = start(service.clone()).await;

    let handle = node
        .manager()
        .add_flow(Ping::new(&PeerAddress::new("bank-b"), "hello"))
        .await
        .unwrap();

    match within(handle.result()).await {
        Err(FlowError::Network(details)) => assert!(details.contains("connection refused")),
        other => panic!("expected a network failure, got {:?}", other),
    }

    // The listener was registered before the send; once the flow is gone it is withdrawn
    // and must not resume anything.
    let handler = first_handler(&service).await;
    assert!(service.was_cancelled(&TopicSession::new("ping", SessionId(7))));
    handler(raw("ping", 7, &"world".to_string()));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let metrics = node.manager().metrics();
    assert_eq!(metrics.delivery_anomalies, 0);
    assert_eq!(metrics.finished, 1);
    assert_eq!(metrics.checkpoints_written, 1);
    assert_eq!(metrics.checkpoints_removed, 1);
    assert!(node.manager().snapshot().await.unwrap().flows.is_empty());

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_delivery_fails_flow_parked_on_another_key() {
    let service = CapturingService::new(false);
    let store = InMemoryCheckpointStore::new();
    let node = start_with_store(service.clone(), store.clone()).await;

    let relay = node
        .manager()
        .add_flow(Relay::new(&PeerAddress::new("bank-b")))
        .await
        .unwrap();
    let ask = first_handler(&service).await;
    ask(raw("ask", 3, &"rate?".to_string()));

    // The flow forwards the question and parks again on ack.3.
    nth_handler(&service, 1).await;
    assert_eq!(store.len().await, 1);

    ask(raw("ask", 3, &"rate again?".to_string()));
    match within(relay.result()).await {
        Err(FlowError::DuplicateDelivery { topic, .. }) => assert_eq!(topic, "ask.3"),
        other => panic!("expected a duplicate delivery, got {:?}", other),
    }

    assert!(store.is_empty().await);
    assert!(service.was_cancelled(&TopicSession::new("ack", SessionId(3))));
    assert_eq!(service.sent.lock().unwrap().len(), 1);

    let metrics = node.manager().metrics();
    assert_eq!(metrics.delivery_anomalies, 1);
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.checkpoints_written, 2);
    assert_eq!(metrics.checkpoints_removed, 2);

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_outbound_message_carries_payload_and_session() {
    let service = CapturingService::new(false);
    let node = start(service.clone()).await;

    let handle = node
        .manager()
        .add_flow(Ping::new(&PeerAddress::new("bank-b"), "hello"))
        .await
        .unwrap();
    wait_for_checkpoint(&node, handle.id()).await;

    let sent = service.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    let (destination, message) = &sent[0];
    assert_eq!(destination, &PeerAddress::new("bank-b"));
    assert_eq!(message.topic_session.to_string(), "ping.7");
    let expected = raw("ping", 7, &"hello".to_string());
    assert_eq!(message.data, expected.data);

    node.shutdown().await.unwrap();
}
