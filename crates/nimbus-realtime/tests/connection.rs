mod common;

use nimbus_protocol::{ClientFrame, ServerFrame};
use nimbus_realtime::{
    ConnectionState, ConnectionStatus, PresenceUser, RealtimeError, RealtimeOptions,
};
use std::time::Duration;
use tokio::sync::mpsc;

fn state_collector(
    client: &nimbus_realtime::RealtimeClient,
) -> mpsc::UnboundedReceiver<ConnectionStatus> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.on_connection_state_change(move |status| {
        let _ = tx.send(status.clone());
    });
    rx
}

#[tokio::test]
async fn test_connect_reports_states_and_credentials() {
    let (client, mut listener) = common::client();
    let mut states = state_collector(&client);

    let peer = common::connect(&client, &mut listener).await;
    assert_eq!(peer.url(), "memory://test?apiKey=test-key&protocol=1.0");

    assert_eq!(states.recv().await.unwrap().state, ConnectionState::Connecting);
    let connected = states.recv().await.unwrap();
    assert_eq!(connected.state, ConnectionState::Connected);
    assert_eq!(connected.connection_id.as_deref(), Some("conn-1"));

    assert!(client.is_connected());
    assert_eq!(client.get_connection_status(), connected);
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let (client, mut listener) = common::client();
    let _peer = common::connect(&client, &mut listener).await;

    client.connect().await.unwrap();
    client.connect().await.unwrap();

    assert_eq!(listener.attempts(), 1);
    assert!(listener.try_accept().is_none());
}

#[tokio::test]
async fn test_concurrent_connects_share_one_attempt() {
    let (client, mut listener) = common::client();

    let (first, second, _peer) = tokio::join!(
        client.connect(),
        client.connect(),
        common::accept(&mut listener, "conn-1")
    );
    first.unwrap();
    second.unwrap();
    assert_eq!(listener.attempts(), 1);
}

#[tokio::test]
async fn test_auth_error_fails_connect() {
    let (client, mut listener) = common::client();

    let (result, _peer) = tokio::join!(client.connect(), async {
        let peer = listener.accept().await.unwrap();
        peer.send(ServerFrame::AuthError {
            message: "invalid api key".into(),
        });
        peer
    });

    match result {
        Err(RealtimeError::Authentication(message)) => assert_eq!(message, "invalid api key"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(!client.is_connected());
    assert_eq!(
        client.get_connection_status().state,
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn test_incompatible_server_version_fails_connect() {
    let (client, mut listener) = common::client();

    let (result, _peer) = tokio::join!(client.connect(), async {
        let peer = listener.accept().await.unwrap();
        peer.send(ServerFrame::Connected {
            connection_id: None,
            version: Some("2.0".into()),
        });
        peer
    });

    assert!(matches!(
        result,
        Err(RealtimeError::IncompatibleProtocol { .. })
    ));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_compatible_minor_version_connects() {
    let (client, mut listener) = common::client();

    let (result, _peer) = tokio::join!(client.connect(), async {
        let peer = listener.accept().await.unwrap();
        peer.send(ServerFrame::Connected {
            connection_id: Some("c".into()),
            version: Some("1.4".into()),
        });
        peer
    });
    result.unwrap();
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout() {
    let options = RealtimeOptions {
        timeout_ms: 2_000,
        ..Default::default()
    };
    let (client, mut listener) = common::client_with(options);

    let start = tokio::time::Instant::now();
    let (result, _peer) = tokio::join!(client.connect(), listener.accept());

    match result {
        Err(RealtimeError::Timeout { operation, after }) => {
            assert_eq!(operation, "connect");
            assert_eq!(after, Duration::from_secs(2));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_refused_transport_fails_connect() {
    let (client, listener) = common::client();
    listener.refuse_connections(true);

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, RealtimeError::Transport(_)));
    assert_eq!(
        client.get_connection_status().state,
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn test_disconnect_is_a_hard_reset() {
    let (client, mut listener) = common::client();
    let mut peer = common::connect(&client, &mut listener).await;
    let mut states = state_collector(&client);

    client.subscribe_to_table("orders", |_| {}).unwrap();
    client.subscribe_to_channel("news", |_| {}).unwrap();
    client
        .subscribe_to_presence("room", PresenceUser::new("me"), |_| {})
        .unwrap();
    assert_eq!(client.get_active_subscriptions().len(), 2);

    client.disconnect();

    assert!(!client.is_connected());
    assert_eq!(
        states.recv().await.unwrap().state,
        ConnectionState::Disconnected
    );
    assert!(client.get_active_subscriptions().is_empty());
    assert!(client.get_active_channels().is_empty());
    assert!(client.presence_members("room").is_empty());

    // The link is closed once the task is gone.
    while peer.recv().await.is_some() {}

    assert!(matches!(
        client.subscribe_to_table("orders", |_| {}),
        Err(RealtimeError::NotConnected)
    ));

    // Listeners survive and a fresh connect works.
    let _peer = common::connect(&client, &mut listener).await;
    assert_eq!(states.recv().await.unwrap().state, ConnectionState::Connecting);
    assert_eq!(states.recv().await.unwrap().state, ConnectionState::Connected);
    assert!(client.get_active_subscriptions().is_empty());
}

#[tokio::test]
async fn test_disconnect_fails_pending_presence_request() {
    let (client, mut listener) = common::client();
    let mut peer = common::connect(&client, &mut listener).await;

    let requester = client.clone();
    let pending = tokio::spawn(async move { requester.get_presence("room").await });

    assert!(matches!(
        peer.recv().await,
        Some(ClientFrame::GetPresence { .. })
    ));
    client.disconnect();

    assert!(matches!(
        pending.await.unwrap(),
        Err(RealtimeError::NotConnected)
    ));
}

#[tokio::test]
async fn test_removed_listener_is_not_called() {
    let (client, mut listener) = common::client();
    let (tx, mut rx) = mpsc::unbounded_channel::<ConnectionState>();
    let id = client.on_connection_state_change(move |status| {
        let _ = tx.send(status.state);
    });
    assert!(client.remove_listener(id));
    assert!(!client.remove_listener(id));

    let _peer = common::connect(&client, &mut listener).await;
    client.disconnect();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_ping_reaches_server() {
    let (client, mut listener) = common::client();
    let mut peer = common::connect(&client, &mut listener).await;

    client.ping().unwrap();
    assert!(matches!(
        peer.recv().await,
        Some(ClientFrame::Ping { timestamp: Some(_) })
    ));
}
