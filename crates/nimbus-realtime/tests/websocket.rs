//! End-to-end tests against a local WebSocket server.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use nimbus_protocol::{codec, ClientFrame, Encoded, ServerFrame};
use nimbus_realtime::{
    ChangeType, ConnectionState, DatabaseChange, Encoding, RealtimeClient, RealtimeError,
    RealtimeOptions,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const API_KEY: &str = "secret-key";

#[derive(Deserialize)]
struct Credentials {
    #[serde(rename = "apiKey")]
    api_key: String,
    protocol: String,
}

/// How the test server talks.
#[derive(Clone)]
struct Script {
    encoding: Encoding,
    /// Raw messages sent after the key is accepted. Must include the
    /// `connected` frame somewhere.
    greeting: Vec<Message>,
    /// Raw messages sent ahead of every channel greeting.
    noise: Vec<Message>,
}

impl Script {
    fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            greeting: vec![message(&ServerFrame::connected("ws-1"), encoding)],
            noise: Vec::new(),
        }
    }

    fn greeting(mut self, greeting: Vec<Message>) -> Self {
        self.greeting = greeting;
        self
    }

    fn noise(mut self, noise: Vec<Message>) -> Self {
        self.noise = noise;
        self
    }
}

fn message(frame: &ServerFrame, encoding: Encoding) -> Message {
    match codec::encode(frame, encoding).unwrap() {
        Encoded::Text(text) => Message::Text(text),
        Encoded::Binary(data) => Message::Binary(data.to_vec()),
    }
}

fn text(raw: &str) -> Message {
    Message::Text(raw.to_string())
}

fn change(id: u64) -> ServerFrame {
    ServerFrame::DatabaseChange(DatabaseChange {
        change_type: ChangeType::Insert,
        table: "orders".into(),
        record: json!({ "id": id, "status": "open" }),
        old_record: None,
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(script): State<Arc<Script>>,
    Query(credentials): Query<Credentials>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve(socket, script, credentials))
}

fn decode(message: Message, encoding: Encoding) -> Option<ClientFrame> {
    match (message, encoding) {
        (Message::Text(text), Encoding::Json) => codec::decode_json(&text).ok(),
        (Message::Binary(data), Encoding::MessagePack) => codec::decode_msgpack(&data).ok(),
        _ => None,
    }
}

/// Authenticates, greets, then answers channel subscriptions with
/// `"hello"` and table subscriptions with two inserts.
async fn serve(mut socket: WebSocket, script: Arc<Script>, credentials: Credentials) {
    assert_eq!(credentials.protocol, "1.0");
    if credentials.api_key != API_KEY {
        let rejected = ServerFrame::AuthError {
            message: "invalid api key".into(),
        };
        let _ = socket.send(message(&rejected, script.encoding)).await;
        let _ = socket.close().await;
        return;
    }

    for greeting in &script.greeting {
        if socket.send(greeting.clone()).await.is_err() {
            return;
        }
    }

    while let Some(Ok(inbound)) = socket.recv().await {
        let reply = match decode(inbound, script.encoding) {
            Some(ClientFrame::SubscribeChannel { channel }) => {
                let mut reply = script.noise.clone();
                reply.push(message(
                    &ServerFrame::channel_message(channel, json!("hello")),
                    script.encoding,
                ));
                reply
            }
            Some(ClientFrame::SubscribeTable(_)) if script.encoding == Encoding::MessagePack => {
                // Both changes in one binary message.
                let mut batch = BytesMut::new();
                codec::encode_into(&change(1), &mut batch).unwrap();
                codec::encode_into(&change(2), &mut batch).unwrap();
                vec![Message::Binary(batch.to_vec())]
            }
            _ => continue,
        };
        for outbound in reply {
            if socket.send(outbound).await.is_err() {
                return;
            }
        }
    }
}

async fn spawn_server(script: Script) -> SocketAddr {
    let app = Router::new()
        .route("/realtime", get(ws_handler))
        .with_state(Arc::new(script));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn client_with(addr: SocketAddr, api_key: &str, options: RealtimeOptions) -> RealtimeClient {
    RealtimeClient::builder()
        .base_url(format!("http://{addr}/api/v1"))
        .api_key(api_key)
        .options(options)
        .build()
        .unwrap()
}

fn client(addr: SocketAddr, api_key: &str) -> RealtimeClient {
    client_with(addr, api_key, RealtimeOptions::default())
}

async fn expect_greeting(client: &RealtimeClient) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    client
        .subscribe_to_channel("lobby", move |message| {
            let _ = tx.send(message);
        })
        .unwrap();
    assert_eq!(rx.recv().await.unwrap(), json!("hello"));
}

#[tokio::test]
async fn test_websocket_round_trip() {
    let addr = spawn_server(Script::new(Encoding::Json)).await;
    let client = client(addr, API_KEY);

    client.connect().await.unwrap();
    let status = client.get_connection_status();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.connection_id.as_deref(), Some("ws-1"));

    expect_greeting(&client).await;

    client.disconnect();
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_websocket_rejects_bad_key() {
    let addr = spawn_server(Script::new(Encoding::Json)).await;
    let client = client(addr, "wrong-key");

    match client.connect().await {
        Err(RealtimeError::Authentication(message)) => assert_eq!(message, "invalid api key"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(
        client.get_connection_status().state,
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn test_connected_without_payload_completes_handshake() {
    let script = Script::new(Encoding::Json).greeting(vec![text(r#"{"event":"connected"}"#)]);
    let addr = spawn_server(script).await;
    let client = client(addr, API_KEY);

    client.connect().await.unwrap();
    let status = client.get_connection_status();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.connection_id, None);

    expect_greeting(&client).await;
}

#[tokio::test]
async fn test_handshake_skips_unknown_and_undecodable_frames() {
    let script = Script::new(Encoding::Json).greeting(vec![
        text(r#"{"event":"server_info","data":{"region":"eu"}}"#),
        text("not json at all"),
        text(r#"{"event":"pong"}"#),
        message(&ServerFrame::connected("ws-2"), Encoding::Json),
    ]);
    let addr = spawn_server(script).await;
    let client = client(addr, API_KEY);

    client.connect().await.unwrap();
    assert_eq!(
        client.get_connection_status().connection_id.as_deref(),
        Some("ws-2")
    );
}

#[tokio::test]
async fn test_undecodable_frame_is_reported_and_session_continues() {
    let script = Script::new(Encoding::Json).noise(vec![
        text(r#"{"event":"server_info","data":{"region":"eu"}}"#),
        text("{garbage"),
    ]);
    let addr = spawn_server(script).await;
    let client = client(addr, API_KEY);

    let (tx, mut errors) = mpsc::unbounded_channel();
    client.on_error(move |err| {
        let _ = tx.send(err.clone());
    });
    client.connect().await.unwrap();

    expect_greeting(&client).await;

    // Only the garbage is an error; the unknown event is dropped quietly.
    assert!(matches!(errors.try_recv(), Ok(RealtimeError::Protocol(_))));
    assert!(errors.try_recv().is_err());
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_message_pack_round_trip() {
    let addr = spawn_server(Script::new(Encoding::MessagePack)).await;
    let options = RealtimeOptions {
        encoding: Encoding::MessagePack,
        ..RealtimeOptions::default()
    };
    let client = client_with(addr, API_KEY, options);

    client.connect().await.unwrap();
    assert_eq!(
        client.get_connection_status().connection_id.as_deref(),
        Some("ws-1")
    );

    expect_greeting(&client).await;

    let (tx, mut changes) = mpsc::unbounded_channel::<DatabaseChange>();
    client
        .subscribe_to_table("orders", move |change| {
            let _ = tx.send(change);
        })
        .unwrap();

    for id in [1, 2] {
        let change = changes.recv().await.unwrap();
        assert_eq!(change.change_type, ChangeType::Insert);
        assert_eq!(change.record, json!({ "id": id, "status": "open" }));
    }
}
