//! Frame types for the Nimbus realtime protocol.
//!
//! Every frame is a named event with a payload. On the JSON wire a frame
//! looks like `{"event": "subscribe_table", "data": {...}}`; the MessagePack
//! encoding uses the same shape with named fields.
//!
//! Outbound frames ([`ClientFrame`]) and inbound frames ([`ServerFrame`]) are
//! closed enums, so adding an event is a compile-time checked change.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Row-level change types reported by table change feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    /// The event set used when a table subscription names none.
    pub const ALL: [ChangeType; 3] = [ChangeType::Insert, ChangeType::Update, ChangeType::Delete];

    /// Wire name of the change type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Insert => "INSERT",
            ChangeType::Update => "UPDATE",
            ChangeType::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a table change-feed subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSubscription {
    /// Table name.
    pub table: String,
    /// Change types to receive.
    pub events: Vec<ChangeType>,
    /// Optional row filter, passed through to the backend untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
}

impl TableSubscription {
    /// Subscribe to every change type on `table`.
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            events: ChangeType::ALL.to_vec(),
            filter: None,
        }
    }

    /// Restrict the subscription to the given change types.
    ///
    /// An empty list falls back to all change types.
    #[must_use]
    pub fn with_events(mut self, events: impl IntoIterator<Item = ChangeType>) -> Self {
        let events: Vec<ChangeType> = events.into_iter().collect();
        self.events = if events.is_empty() {
            ChangeType::ALL.to_vec()
        } else {
            events
        };
        self
    }

    /// Attach a row filter.
    #[must_use]
    pub fn with_filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }
}

impl From<&str> for TableSubscription {
    fn from(table: &str) -> Self {
        Self::new(table)
    }
}

impl From<String> for TableSubscription {
    fn from(table: String) -> Self {
        Self::new(table)
    }
}

/// An analytics stream target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnalyticsTarget {
    /// Target type (e.g. `page`, `campaign`).
    #[serde(rename = "type")]
    pub target_type: String,
    /// Identifier within the target type.
    pub target_id: String,
}

impl AnalyticsTarget {
    /// Create a new analytics target.
    #[must_use]
    pub fn new(target_type: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            target_type: target_type.into(),
            target_id: target_id.into(),
        }
    }

    /// The `type:target_id` pair used for routing.
    #[must_use]
    pub fn route(&self) -> String {
        format!("{}:{}", self.target_type, self.target_id)
    }
}

/// A user snapshot shared through presence.
///
/// Everything besides `id` is free-form user info.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUser {
    /// User identifier.
    pub id: String,
    /// Additional user info.
    #[serde(flatten)]
    pub info: Map<String, Value>,
}

impl PresenceUser {
    /// Create a presence user with no extra info.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            info: Map::new(),
        }
    }

    /// Attach an info field.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.info.insert(key.into(), value.into());
        self
    }
}

/// A departed member as reported by the server.
///
/// Servers send either a bare user id or an object carrying the departure
/// time in milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LeftMember {
    /// Bare user id.
    Id(String),
    /// User id with departure time.
    Member {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        left_at: Option<u64>,
    },
}

impl LeftMember {
    /// The departed user's id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            LeftMember::Id(id) | LeftMember::Member { id, .. } => id,
        }
    }

    /// Departure time, if the server sent one.
    #[must_use]
    pub fn left_at(&self) -> Option<u64> {
        match self {
            LeftMember::Id(_) => None,
            LeftMember::Member { left_at, .. } => *left_at,
        }
    }
}

/// A row change on a subscribed table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseChange {
    /// Kind of change.
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    /// Table the change happened on.
    pub table: String,
    /// The row after the change (before it, for deletes).
    pub record: Value,
    /// The row before an update, when the backend provides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_record: Option<Value>,
}

/// Raw presence diff for a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    /// Presence channel.
    pub channel: String,
    #[serde(default)]
    pub joined: Vec<PresenceUser>,
    #[serde(default)]
    pub left: Vec<LeftMember>,
    #[serde(default)]
    pub updated: Vec<PresenceUser>,
}

/// An event emitted by a running workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub workflow_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// An event emitted by a logic flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicEvent {
    pub logic_name: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// A live analytics update for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsUpdate {
    #[serde(rename = "type")]
    pub target_type: String,
    pub target_id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl AnalyticsUpdate {
    /// The `type:target_id` pair used for routing.
    #[must_use]
    pub fn route(&self) -> String {
        format!("{}:{}", self.target_type, self.target_id)
    }
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    SubscribeTable(TableSubscription),
    UnsubscribeTable {
        table: String,
    },
    SubscribeChannel {
        channel: String,
    },
    UnsubscribeChannel {
        channel: String,
    },
    PublishChannel {
        channel: String,
        message: Value,
    },
    JoinPresence {
        channel: String,
        user: PresenceUser,
    },
    LeavePresence {
        channel: String,
    },
    UpdatePresence {
        channel: String,
        user: PresenceUser,
    },
    /// Request the full membership of a channel; answered by
    /// [`ServerFrame::PresenceState`] carrying the same `request_id`.
    GetPresence {
        channel: String,
        request_id: u64,
    },
    SubscribeWorkflow {
        workflow_id: String,
    },
    UnsubscribeWorkflow {
        workflow_id: String,
    },
    SubscribeLogic {
        logic_name: String,
    },
    UnsubscribeLogic {
        logic_name: String,
    },
    SubscribeAnalytics(AnalyticsTarget),
    UnsubscribeAnalytics(AnalyticsTarget),
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientFrame {
    /// Wire name of the event.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientFrame::SubscribeTable(_) => "subscribe_table",
            ClientFrame::UnsubscribeTable { .. } => "unsubscribe_table",
            ClientFrame::SubscribeChannel { .. } => "subscribe_channel",
            ClientFrame::UnsubscribeChannel { .. } => "unsubscribe_channel",
            ClientFrame::PublishChannel { .. } => "publish_channel",
            ClientFrame::JoinPresence { .. } => "join_presence",
            ClientFrame::LeavePresence { .. } => "leave_presence",
            ClientFrame::UpdatePresence { .. } => "update_presence",
            ClientFrame::GetPresence { .. } => "get_presence",
            ClientFrame::SubscribeWorkflow { .. } => "subscribe_workflow",
            ClientFrame::UnsubscribeWorkflow { .. } => "unsubscribe_workflow",
            ClientFrame::SubscribeLogic { .. } => "subscribe_logic",
            ClientFrame::UnsubscribeLogic { .. } => "unsubscribe_logic",
            ClientFrame::SubscribeAnalytics(_) => "subscribe_analytics",
            ClientFrame::UnsubscribeAnalytics(_) => "unsubscribe_analytics",
            ClientFrame::Ping { .. } => "ping",
        }
    }

    /// The frame that undoes a subscribe-style frame.
    ///
    /// Returns `None` for frames that open nothing on the server.
    #[must_use]
    pub fn teardown(&self) -> Option<ClientFrame> {
        match self {
            ClientFrame::SubscribeTable(sub) => Some(ClientFrame::UnsubscribeTable {
                table: sub.table.clone(),
            }),
            ClientFrame::SubscribeChannel { channel } => Some(ClientFrame::UnsubscribeChannel {
                channel: channel.clone(),
            }),
            ClientFrame::JoinPresence { channel, .. } => Some(ClientFrame::LeavePresence {
                channel: channel.clone(),
            }),
            ClientFrame::SubscribeWorkflow { workflow_id } => {
                Some(ClientFrame::UnsubscribeWorkflow {
                    workflow_id: workflow_id.clone(),
                })
            }
            ClientFrame::SubscribeLogic { logic_name } => Some(ClientFrame::UnsubscribeLogic {
                logic_name: logic_name.clone(),
            }),
            ClientFrame::SubscribeAnalytics(target) => {
                Some(ClientFrame::UnsubscribeAnalytics(target.clone()))
            }
            _ => None,
        }
    }

    /// Create a new SubscribeTable frame.
    #[must_use]
    pub fn subscribe_table(subscription: TableSubscription) -> Self {
        ClientFrame::SubscribeTable(subscription)
    }

    /// Create a new SubscribeChannel frame.
    #[must_use]
    pub fn subscribe_channel(channel: impl Into<String>) -> Self {
        ClientFrame::SubscribeChannel {
            channel: channel.into(),
        }
    }

    /// Create a new PublishChannel frame.
    #[must_use]
    pub fn publish(channel: impl Into<String>, message: Value) -> Self {
        ClientFrame::PublishChannel {
            channel: channel.into(),
            message,
        }
    }

    /// Create a new Ping frame with timestamp.
    #[must_use]
    pub fn ping_with_timestamp(timestamp: u64) -> Self {
        ClientFrame::Ping {
            timestamp: Some(timestamp),
        }
    }
}

/// Frames pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Authentication succeeded; the session is ready.
    Connected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
        /// Protocol version spoken by the server, as `major.minor`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    /// The API key was rejected.
    AuthError {
        message: String,
    },
    /// A server-side error not tied to one subscription.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        message: String,
    },
    DatabaseChange(DatabaseChange),
    ChannelMessage {
        channel: String,
        message: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    PresenceUpdate(PresenceUpdate),
    /// Full membership of a channel.
    PresenceState {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        #[serde(default)]
        users: Vec<PresenceUser>,
    },
    WorkflowEvent(WorkflowEvent),
    LogicEvent(LogicEvent),
    AnalyticsUpdate(AnalyticsUpdate),
    SubscriptionConfirmed {
        kind: String,
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subscribers: Option<u64>,
    },
    SubscriptionError {
        kind: String,
        target: String,
        message: String,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerFrame {
    /// Wire names of every event this client understands.
    pub const EVENTS: [&'static str; 13] = [
        "connected",
        "auth_error",
        "error",
        "database_change",
        "channel_message",
        "presence_update",
        "presence_state",
        "workflow_event",
        "logic_event",
        "analytics_update",
        "subscription_confirmed",
        "subscription_error",
        "pong",
    ];

    /// Wire name of the event.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerFrame::Connected { .. } => "connected",
            ServerFrame::AuthError { .. } => "auth_error",
            ServerFrame::Error { .. } => "error",
            ServerFrame::DatabaseChange(_) => "database_change",
            ServerFrame::ChannelMessage { .. } => "channel_message",
            ServerFrame::PresenceUpdate(_) => "presence_update",
            ServerFrame::PresenceState { .. } => "presence_state",
            ServerFrame::WorkflowEvent(_) => "workflow_event",
            ServerFrame::LogicEvent(_) => "logic_event",
            ServerFrame::AnalyticsUpdate(_) => "analytics_update",
            ServerFrame::SubscriptionConfirmed { .. } => "subscription_confirmed",
            ServerFrame::SubscriptionError { .. } => "subscription_error",
            ServerFrame::Pong { .. } => "pong",
        }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>) -> Self {
        ServerFrame::Connected {
            connection_id: Some(connection_id.into()),
            version: None,
        }
    }

    /// Create a new ChannelMessage frame.
    #[must_use]
    pub fn channel_message(channel: impl Into<String>, message: Value) -> Self {
        ServerFrame::ChannelMessage {
            channel: channel.into(),
            message,
            sender: None,
            timestamp: None,
        }
    }
}

/// An inbound frame with its payload still undecoded.
///
/// Servers may push events newer than this client, and may leave out
/// `data` when every field of the payload is optional. Reading the
/// envelope first lets the receiver drop the former and accept the latter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Whether `event` names a [`ServerFrame`].
    #[must_use]
    pub fn is_known(&self) -> bool {
        ServerFrame::EVENTS.contains(&self.event.as_str())
    }

    /// Decode the payload into a [`ServerFrame`].
    ///
    /// A missing or `null` payload decodes as an empty object.
    ///
    /// # Errors
    ///
    /// Fails for unknown events and payloads that do not match the event.
    pub fn into_frame(self) -> Result<ServerFrame, serde_json::Error> {
        let data = match self.data {
            Value::Null => Value::Object(Map::new()),
            data => data,
        };
        let mut raw = Map::with_capacity(2);
        raw.insert("event".into(), Value::String(self.event));
        raw.insert("data".into(), data);
        serde_json::from_value(Value::Object(raw))
    }
}
