// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Subscription recovery against the simulated server: resumption through
//! Republish, transfer to a new session, recreation, and gap reporting.

mod common;

use std::sync::Arc;
use std::time::Duration;

use trap_ua_client::{
    ClientEvent, MaxRetry, MonitoredItem, NodeId, RecoveryOutcome, StatusCode, SubscriptionHandle,
    SubscriptionNotification, SubscriptionParameters, SubscriptionState, SubscriptionStream,
    UaClient,
};

use common::*;

const WAIT: Duration = Duration::from_secs(5);

fn client(server: &Arc<SimServer>) -> UaClient {
    UaClient::new(config(strategy(MaxRetry::Unbounded, 20, 60)), server.transport()).unwrap()
}

fn parameters(client: &UaClient) -> SubscriptionParameters {
    SubscriptionParameters::from_defaults(&client.config().subscription_defaults)
}

async fn subscribe(client: &UaClient, nodes: &[NodeId]) -> SubscriptionStream {
    let stream = client.create_subscription(parameters(client)).await.unwrap();
    let items = nodes.iter().cloned().map(MonitoredItem::new).collect();
    client.add_monitored_items(stream.handle(), items).await.unwrap();
    stream
}

async fn next_notification(stream: &mut SubscriptionStream) -> SubscriptionNotification {
    tokio::time::timeout(WAIT, stream.recv())
        .await
        .expect("notification within timeout")
        .expect("stream open")
}

async fn next_change(stream: &mut SubscriptionStream) -> (u32, i64) {
    match next_notification(stream).await {
        SubscriptionNotification::DataChange {
            sequence_number,
            changes,
            ..
        } => (sequence_number, changes[0].value.value.as_i64().unwrap()),
        other => panic!("expected a data change, got {other:?}"),
    }
}

fn recovered(events: &[ClientEvent], handle: SubscriptionHandle) -> Option<&RecoveryOutcome> {
    events.iter().find_map(|event| match event {
        ClientEvent::SubscriptionRecovered { handle: h, outcome } if *h == handle => Some(outcome),
        _ => None,
    })
}

// =============================================================================
// Creation
// =============================================================================

#[tokio::test]
async fn test_subscription_created_while_disconnected_is_created_on_connect() {
    let server = SimServer::new();
    let client = client(&server);
    let mut events = client.events();
    let node = NodeId::string(2, "Flow");

    let mut stream = client.create_subscription(parameters(&client)).await.unwrap();
    client
        .add_monitored_items(stream.handle(), vec![MonitoredItem::new(node.clone())])
        .await
        .unwrap();
    assert_eq!(
        client.subscription(stream.handle()).unwrap().state,
        SubscriptionState::Pending
    );
    assert!(server.subscription_ids().is_empty());

    client.connect().await.unwrap();
    let seen = collect_for(&mut events, Duration::from_millis(50)).await;
    assert!(matches!(
        recovered(&seen, stream.handle()),
        Some(RecoveryOutcome::Created { .. })
    ));
    assert_eq!(server.subscription_ids().len(), 1);

    server.publish_value(&node, 10_i64);
    assert_eq!(next_change(&mut stream).await, (1, 10));

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_rejected_monitored_item_stays_defined() {
    let server = SimServer::new();
    let client = client(&server);
    client.connect().await.unwrap();

    let stream = client.create_subscription(parameters(&client)).await.unwrap();
    let added = client
        .add_monitored_items(
            stream.handle(),
            vec![
                MonitoredItem::new(NodeId::string(2, "Level")),
                MonitoredItem::new(NodeId::string(0, "Invalid")),
            ],
        )
        .await
        .unwrap();

    assert_eq!(added.len(), 2);
    assert_ne!(added[0].client_handle, added[1].client_handle);
    let id = server.subscription_ids()[0];
    assert_eq!(server.monitored_items(id).len(), 1);
    assert_eq!(client.subscription(stream.handle()).unwrap().items.len(), 2);

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_rejected_subscription_is_not_kept() {
    let server = SimServer::new();
    let client = client(&server);
    client.connect().await.unwrap();

    server.inject_fault("CreateSubscription", StatusCode::BAD_TOO_MANY_SUBSCRIPTIONS);
    let error = client.create_subscription(parameters(&client)).await.unwrap_err();
    assert_eq!(error.status_code(), Some(StatusCode::BAD_TOO_MANY_SUBSCRIPTIONS));
    assert!(client.subscriptions().is_empty());
    assert!(client.is_connected());

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_delete_subscription_removes_it_from_server() {
    let server = SimServer::new();
    let client = client(&server);
    client.connect().await.unwrap();
    let stream = subscribe(&client, &[NodeId::string(2, "Speed")]).await;
    assert_eq!(server.subscription_ids().len(), 1);

    client.delete_subscription(stream.handle()).await.unwrap();
    assert!(server.subscription_ids().is_empty());
    assert!(client.subscription(stream.handle()).is_none());
    assert!(client.delete_subscription(stream.handle()).await.is_err());

    client.disconnect().await.unwrap();
}

// =============================================================================
// Recovery
// =============================================================================

#[tokio::test]
async fn test_outage_beyond_subscription_lifetime_recreates_subscription() {
    let server = SimServer::new();
    let client = client(&server);
    let mut events = client.events();
    client.connect().await.unwrap();
    let session_id = client.session_id();

    let nodes = [NodeId::string(2, "Temperature"), NodeId::numeric(2, 1001)];
    let mut stream = subscribe(&client, &nodes).await;
    server.publish_value(&nodes[0], 1_i64);
    assert_eq!(next_change(&mut stream).await, (1, 1));
    let previous = server.subscription_ids()[0];

    // Subscriptions live 500 ms without Publish; sessions 3 s.
    server.go_offline();
    collect_until(&mut events, "start_reconnection", WAIT).await;
    tokio::time::sleep(Duration::from_millis(800)).await;
    server.go_online();

    let seen = collect_until(&mut events, "after_reconnection", WAIT).await;
    assert_eq!(count(&seen, "close"), 0);
    assert_eq!(count(&seen, "session_recreated"), 0);
    let subscription_id = match recovered(&seen, stream.handle()) {
        Some(RecoveryOutcome::Recreated {
            previous: p,
            subscription_id,
        }) => {
            assert_eq!(*p, previous);
            *subscription_id
        }
        other => panic!("expected recreation, got {other:?}"),
    };
    assert_eq!(client.session_id(), session_id);
    assert_eq!(server.subscription_ids(), vec![subscription_id]);

    let items: Vec<NodeId> = server
        .monitored_items(subscription_id)
        .into_iter()
        .map(|item| item.node_id)
        .collect();
    assert_eq!(items, nodes.to_vec());

    assert_eq!(
        next_notification(&mut stream).await,
        SubscriptionNotification::Recreated
    );
    server.publish_value(&nodes[0], 2_i64);
    server.publish_value(&nodes[1], 3_i64);
    assert_eq!(next_change(&mut stream).await, (1, 2));
    assert_eq!(next_change(&mut stream).await, (2, 3));

    let rest = collect_for(&mut events, Duration::from_millis(200)).await;
    assert_eq!(count(&rest, "notification_gap"), 0);
    assert_eq!(count(&rest, "start_reconnection"), 0);
    assert_eq!(client.subscription(stream.handle()).unwrap().gaps, 0);

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_expired_session_transfers_subscriptions() {
    let server = SimServer::new();
    let client = client(&server);
    let mut events = client.events();
    client.connect().await.unwrap();
    let first_session = client.session_id().unwrap();

    let node = NodeId::string(2, "Vibration");
    let mut stream = subscribe(&client, std::slice::from_ref(&node)).await;
    server.publish_value(&node, 1_i64);
    assert_eq!(next_change(&mut stream).await, (1, 1));
    let subscription_ids = server.subscription_ids();

    server.go_offline();
    collect_until(&mut events, "start_reconnection", WAIT).await;
    server.expire_sessions();
    server.publish_value_lost(&node, 2_i64);
    server.go_online();

    let seen = collect_until(&mut events, "after_reconnection", WAIT).await;
    assert!(seen.iter().any(|event| matches!(
        event,
        ClientEvent::SessionRecreated { previous: Some(previous), .. } if *previous == first_session
    )));
    assert!(matches!(
        recovered(&seen, stream.handle()),
        Some(RecoveryOutcome::Resumed { republished: 1 })
    ));
    assert_ne!(client.session_id(), Some(first_session));
    assert_eq!(server.subscription_ids(), subscription_ids);
    assert_eq!(server.calls("TransferSubscriptions"), 1);

    server.publish_value(&node, 3_i64);
    assert_eq!(next_change(&mut stream).await, (2, 2));
    assert_eq!(next_change(&mut stream).await, (3, 3));

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_server_restart_recreates_session_and_subscriptions() {
    let server = SimServer::new();
    let client = client(&server);
    let mut events = client.events();
    client.connect().await.unwrap();

    let node = NodeId::string(2, "Current");
    let mut stream = subscribe(&client, std::slice::from_ref(&node)).await;
    server.publish_value(&node, 1_i64);
    assert_eq!(next_change(&mut stream).await, (1, 1));

    server.restart();

    let seen = collect_until(&mut events, "after_reconnection", WAIT).await;
    assert_eq!(count(&seen, "session_recreated"), 1);
    assert!(matches!(
        recovered(&seen, stream.handle()),
        Some(RecoveryOutcome::Recreated { .. })
    ));
    assert_eq!(server.session_count(), 1);
    assert_eq!(server.subscription_ids().len(), 1);

    assert_eq!(
        next_notification(&mut stream).await,
        SubscriptionNotification::Recreated
    );
    server.publish_value(&node, 2_i64);
    assert_eq!(next_change(&mut stream).await, (1, 2));

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_unrecoverable_messages_are_reported_as_gap() {
    let server = SimServer::new();
    let client = client(&server);
    let mut events = client.events();
    client.connect().await.unwrap();

    let node = NodeId::string(2, "Torque");
    let mut stream = subscribe(&client, std::slice::from_ref(&node)).await;
    server.publish_value(&node, 1_i64);
    assert_eq!(next_change(&mut stream).await, (1, 1));

    server.go_offline();
    collect_until(&mut events, "start_reconnection", WAIT).await;
    server.publish_value_lost(&node, 2_i64);
    server.discard_retransmissions();
    server.go_online();
    collect_until(&mut events, "after_reconnection", WAIT).await;

    server.publish_value(&node, 3_i64);
    assert_eq!(
        next_notification(&mut stream).await,
        SubscriptionNotification::Gap { missing: 2..=2 }
    );
    assert_eq!(next_change(&mut stream).await, (3, 3));

    let seen = collect_for(&mut events, Duration::from_millis(100)).await;
    let gaps: Vec<_> = seen
        .iter()
        .filter_map(|event| match event {
            ClientEvent::NotificationGap { missing, .. } => Some(missing.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(gaps, vec![2..=2]);
    assert_eq!(client.subscription(stream.handle()).unwrap().gaps, 1);

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_subscriptions_survive_disconnect_and_connect() {
    let server = SimServer::new();
    let client = client(&server);
    client.connect().await.unwrap();

    let nodes = [NodeId::string(2, "A"), NodeId::string(2, "B")];
    let mut stream = subscribe(&client, &nodes).await;
    let defined = client.subscription(stream.handle()).unwrap().items;

    client.disconnect().await.unwrap();
    assert!(server.subscription_ids().is_empty());
    assert_eq!(
        client.subscription(stream.handle()).unwrap().state,
        SubscriptionState::Pending
    );

    client.connect().await.unwrap();
    let id = server.subscription_ids()[0];
    assert_eq!(server.monitored_items(id), defined);

    server.publish_value(&nodes[1], 5_i64);
    assert_eq!(next_change(&mut stream).await, (1, 5));

    client.disconnect().await.unwrap();
}
