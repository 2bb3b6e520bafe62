mod common;

use nimbus_protocol::{ClientFrame, ServerFrame};
use nimbus_realtime::{
    AnalyticsTarget, AnalyticsUpdate, ChangeType, DatabaseChange, LogicEvent, RealtimeError,
    TableSubscription, WorkflowEvent,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

fn insert(table: &str, id: u64) -> ServerFrame {
    ServerFrame::DatabaseChange(DatabaseChange {
        change_type: ChangeType::Insert,
        table: table.to_string(),
        record: json!({ "id": id }),
        old_record: None,
    })
}

fn error_collector(client: &nimbus_realtime::RealtimeClient) -> mpsc::UnboundedReceiver<RealtimeError> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.on_error(move |err| {
        let _ = tx.send(err.clone());
    });
    rx
}

#[tokio::test]
async fn test_orders_insert_delivered_once_invoices_ignored() {
    let (client, mut listener) = common::client();
    let mut peer = common::connect(&client, &mut listener).await;

    let (callback, mut changes) = common::collector::<DatabaseChange>();
    client
        .subscribe_to_table(
            TableSubscription::new("orders").with_events([ChangeType::Insert]),
            callback,
        )
        .unwrap();

    let sent = common::frames(&mut peer, 1).await;
    assert_eq!(
        sent,
        vec![ClientFrame::SubscribeTable(TableSubscription {
            table: "orders".into(),
            events: vec![ChangeType::Insert],
            filter: None,
        })]
    );

    peer.send(insert("invoices", 1));
    peer.send(insert("orders", 2));
    peer.send(insert("orders", 3));

    let first = changes.recv().await.unwrap();
    assert_eq!(first.table, "orders");
    assert_eq!(first.record, json!({ "id": 2 }));

    let second = changes.recv().await.unwrap();
    assert_eq!(second.record, json!({ "id": 3 }));
    assert!(changes.try_recv().is_err());
}

#[tokio::test]
async fn test_subscribing_twice_keeps_one_subscription() {
    let (client, mut listener) = common::client();
    let mut peer = common::connect(&client, &mut listener).await;

    let (first_cb, mut first) = common::collector::<DatabaseChange>();
    let (second_cb, mut second) = common::collector::<DatabaseChange>();
    let _first = client.subscribe_to_table("orders", first_cb).unwrap();
    let _second = client.subscribe_to_table("orders", second_cb).unwrap();

    let sent = common::frames(&mut peer, 3).await;
    assert_eq!(
        sent,
        vec![
            ClientFrame::subscribe_table(TableSubscription::new("orders")),
            ClientFrame::UnsubscribeTable {
                table: "orders".into()
            },
            ClientFrame::subscribe_table(TableSubscription::new("orders")),
        ]
    );
    assert_eq!(client.get_active_subscriptions(), vec!["database:orders"]);

    peer.send(insert("orders", 1));
    assert_eq!(second.recv().await.unwrap().record, json!({ "id": 1 }));
    assert!(first.try_recv().is_err());
}

#[tokio::test]
async fn test_stale_handle_does_not_remove_replacement() {
    let (client, mut listener) = common::client();
    let mut peer = common::connect(&client, &mut listener).await;

    let stale = client.subscribe_to_table("orders", |_| {}).unwrap();
    let current = client.subscribe_to_table("orders", |_| {}).unwrap();
    assert_ne!(stale.id(), current.id());
    assert_eq!(stale.key(), "database:orders");
    assert!(!stale.is_active());
    assert!(current.is_active());

    assert!(!stale.unsubscribe());
    assert_eq!(client.get_active_subscriptions(), vec!["database:orders"]);

    assert!(client.unsubscribe(current));
    assert!(client.get_active_subscriptions().is_empty());

    let sent = common::frames(&mut peer, 4).await;
    assert_eq!(
        sent[3],
        ClientFrame::UnsubscribeTable {
            table: "orders".into()
        }
    );
}

#[tokio::test]
async fn test_dropping_handle_keeps_subscription() {
    let (client, mut listener) = common::client();
    let _peer = common::connect(&client, &mut listener).await;

    drop(client.subscribe_to_channel("news", |_| {}).unwrap());
    assert_eq!(client.get_active_channels(), vec!["news"]);

    assert!(client.unsubscribe_from_channel("news"));
    assert!(!client.unsubscribe_from_channel("news"));
    assert!(client.get_active_channels().is_empty());
}

#[tokio::test]
async fn test_channel_messages_and_publish() {
    let (client, mut listener) = common::client();
    let mut peer = common::connect(&client, &mut listener).await;

    let (callback, mut messages) = common::collector::<Value>();
    let subscription = client.subscribe_to_channel("news", callback).unwrap();
    assert_eq!(subscription.key(), "channel:news");

    client.publish("news", &json!({ "headline": "hi" })).unwrap();
    let sent = common::frames(&mut peer, 2).await;
    assert_eq!(
        sent,
        vec![
            ClientFrame::subscribe_channel("news"),
            ClientFrame::publish("news", json!({ "headline": "hi" })),
        ]
    );

    peer.send(ServerFrame::channel_message("sports", json!("ignored")));
    peer.send(ServerFrame::channel_message("news", json!({ "headline": "hi" })));
    assert_eq!(messages.recv().await.unwrap(), json!({ "headline": "hi" }));

    assert!(subscription.unsubscribe());
    assert_eq!(
        peer.recv().await,
        Some(ClientFrame::UnsubscribeChannel {
            channel: "news".into()
        })
    );
}

#[tokio::test]
async fn test_channel_subscriber_count_from_confirmation() {
    let (client, mut listener) = common::client();
    let peer = common::connect(&client, &mut listener).await;

    let (callback, mut messages) = common::collector::<Value>();
    client.subscribe_to_channel("news", callback).unwrap();
    assert_eq!(client.channel_subscribers("news"), None);

    peer.send(ServerFrame::SubscriptionConfirmed {
        kind: "channel".into(),
        target: "news".into(),
        subscribers: Some(3),
    });
    peer.send(ServerFrame::channel_message("news", json!(1)));
    messages.recv().await.unwrap();

    assert_eq!(client.channel_subscribers("news"), Some(3));
}

#[tokio::test]
async fn test_panicking_callback_is_isolated() {
    let (client, mut listener) = common::client();
    let peer = common::connect(&client, &mut listener).await;
    let mut errors = error_collector(&client);

    client
        .subscribe_to_table("orders", |_| panic!("handler exploded"))
        .unwrap();
    let (callback, mut messages) = common::collector::<Value>();
    client.subscribe_to_channel("news", callback).unwrap();

    peer.send(insert("orders", 1));
    peer.send(ServerFrame::channel_message("news", json!("still here")));
    peer.send(insert("orders", 2));

    match errors.recv().await.unwrap() {
        RealtimeError::Callback { key, message } => {
            assert_eq!(key, "database:orders");
            assert_eq!(message, "handler exploded");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(messages.recv().await.unwrap(), json!("still here"));
    assert!(matches!(
        errors.recv().await.unwrap(),
        RealtimeError::Callback { .. }
    ));
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_workflow_logic_and_analytics_routing() {
    let (client, mut listener) = common::client();
    let mut peer = common::connect(&client, &mut listener).await;

    let (workflow_cb, mut workflows) = common::collector::<WorkflowEvent>();
    let (logic_cb, mut logic) = common::collector::<LogicEvent>();
    let (analytics_cb, mut analytics) = common::collector::<AnalyticsUpdate>();

    client.subscribe_to_workflow("wf-1", workflow_cb).unwrap();
    client.subscribe_to_logic("score", logic_cb).unwrap();
    let target = AnalyticsTarget::new("dashboard", "main");
    client
        .subscribe_to_analytics(target.clone(), analytics_cb)
        .unwrap();

    let sent = common::frames(&mut peer, 3).await;
    assert_eq!(sent[2], ClientFrame::SubscribeAnalytics(target.clone()));
    assert_eq!(
        client.get_active_subscriptions(),
        vec!["workflow:wf-1", "logic:score", "analytics:dashboard:main"]
    );

    peer.send(ServerFrame::WorkflowEvent(WorkflowEvent {
        workflow_id: "wf-2".into(),
        event_type: "started".into(),
        data: Value::Null,
        timestamp: None,
    }));
    peer.send(ServerFrame::WorkflowEvent(WorkflowEvent {
        workflow_id: "wf-1".into(),
        event_type: "completed".into(),
        data: json!({ "ok": true }),
        timestamp: Some(10),
    }));
    peer.send(ServerFrame::LogicEvent(LogicEvent {
        logic_name: "score".into(),
        event_type: "result".into(),
        data: json!(42),
        timestamp: None,
    }));
    peer.send(ServerFrame::AnalyticsUpdate(AnalyticsUpdate {
        target_type: "dashboard".into(),
        target_id: "main".into(),
        data: json!({ "visitors": 7 }),
        timestamp: None,
    }));

    assert_eq!(workflows.recv().await.unwrap().event_type, "completed");
    assert_eq!(logic.recv().await.unwrap().data, json!(42));
    assert_eq!(
        analytics.recv().await.unwrap().data,
        json!({ "visitors": 7 })
    );

    assert!(client.unsubscribe_from_workflow("wf-1"));
    assert!(client.unsubscribe_from_logic("score"));
    assert!(client.unsubscribe_from_analytics(&target));
    assert_eq!(
        common::frames(&mut peer, 3).await,
        vec![
            ClientFrame::UnsubscribeWorkflow {
                workflow_id: "wf-1".into()
            },
            ClientFrame::UnsubscribeLogic {
                logic_name: "score".into()
            },
            ClientFrame::UnsubscribeAnalytics(target),
        ]
    );
}

#[tokio::test]
async fn test_server_errors_reach_error_listeners() {
    let (client, mut listener) = common::client();
    let peer = common::connect(&client, &mut listener).await;
    let mut errors = error_collector(&client);

    let secret = client.subscribe_to_table("secret", |_| {}).unwrap();
    assert!(secret.is_active());

    peer.send(ServerFrame::SubscriptionError {
        kind: "database".into(),
        target: "secret".into(),
        message: "permission denied".into(),
    });
    peer.send(ServerFrame::Error {
        code: Some("RATE_LIMITED".into()),
        message: "slow down".into(),
    });

    match errors.recv().await.unwrap() {
        RealtimeError::Subscription { target, message } => {
            assert_eq!(target, "database:secret");
            assert_eq!(message, "permission denied");
        }
        other => panic!("unexpected error: {other}"),
    }
    match errors.recv().await.unwrap() {
        RealtimeError::Server { code, message } => {
            assert_eq!(code.as_deref(), Some("RATE_LIMITED"));
            assert_eq!(message, "slow down");
        }
        other => panic!("unexpected error: {other}"),
    }

    // A refused subscription is no longer active.
    assert!(client.get_active_subscriptions().is_empty());
    assert!(!secret.is_active());
}

#[tokio::test]
async fn test_invalid_targets_are_rejected() {
    let (client, mut listener) = common::client();
    let _peer = common::connect(&client, &mut listener).await;

    assert!(matches!(
        client.subscribe_to_table("", |_| {}),
        Err(RealtimeError::InvalidTarget(_))
    ));
    assert!(matches!(
        client.subscribe_to_workflow(&"w".repeat(512), |_| {}),
        Err(RealtimeError::InvalidTarget(_))
    ));
    assert!(client.get_active_subscriptions().is_empty());
}
