//! The realtime client.
//!
//! [`RealtimeClient`] multiplexes every subscription kind over one
//! connection. It is cheap to clone; clones share the connection.
//!
//! ```rust,ignore
//! use nimbus_realtime::{RealtimeClient, TableSubscription, ChangeType};
//!
//! let client = RealtimeClient::builder()
//!     .base_url("https://api.example.com/api/v1")
//!     .api_key("pk_live_...")
//!     .build()?;
//! client.connect().await?;
//!
//! let orders = client.subscribe_to_table(
//!     TableSubscription::new("orders").with_events([ChangeType::Insert]),
//!     |change| println!("{} {}", change.change_type, change.record),
//! )?;
//! ```

use dashmap::DashMap;
use nimbus_protocol::{
    AnalyticsTarget, AnalyticsUpdate, ClientFrame, DatabaseChange, LogicEvent, PresenceUser,
    ProtocolError, TableSubscription, WorkflowEvent, PROTOCOL_VERSION,
};
use nimbus_transport::{Connector, WebSocketConnector};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::connection;
use crate::endpoint::{realtime_endpoint, with_credentials};
use crate::error::RealtimeError;
use crate::listeners::{ListenerId, Listeners};
use crate::metrics;
use crate::options::RealtimeOptions;
use crate::presence::PresenceDiff;
use crate::registry::{validate_target, Handler, SubscriptionId, SubscriptionKey};
use crate::state::{ClientState, ConnectionState, ConnectionStatus};
use crate::subscription::Subscription;

/// How long `get_presence` waits for the server's answer.
pub const PRESENCE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared by client clones, subscription handles and the
/// connection task.
pub(crate) struct ClientInner {
    /// Endpoint with credentials; never logged.
    url: String,
    pub(crate) options: RealtimeOptions,
    connector: Arc<dyn Connector>,
    pub(crate) state: Mutex<ClientState>,
    pub(crate) listeners: Mutex<Listeners>,
    pub(crate) pending: DashMap<u64, oneshot::Sender<Vec<PresenceUser>>>,
    next_request_id: AtomicU64,
}

impl ClientInner {
    /// Spawn a fresh connection task, superseding any previous one.
    fn start(self: &Arc<Self>, state: &mut ClientState) {
        state.epoch += 1;
        if let Some(previous) = state.task.take() {
            previous.abort();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.outbound = Some(tx);
        state.phase = ConnectionState::Connecting;
        state.reconnect_attempts = 0;
        state.connection_id = None;

        state.task = Some(tokio::spawn(connection::run(
            Arc::downgrade(self),
            state.epoch,
            rx,
            Arc::clone(&self.connector),
            self.url.clone(),
            self.options.clone(),
        )));
    }

    /// Queue a frame on the live connection.
    pub(crate) fn emit(&self, frame: ClientFrame) -> Result<(), RealtimeError> {
        self.state.lock().send(frame)
    }

    /// Install or replace a keyed subscription and send its subscribe frame.
    fn install(
        self: &Arc<Self>,
        key: SubscriptionKey,
        frame: ClientFrame,
        handler: Handler,
    ) -> Result<Subscription, RealtimeError> {
        let (id, count) = {
            let mut state = self.state.lock();
            if !state.is_connected() {
                return Err(RealtimeError::NotConnected);
            }

            let (id, previous) = state.registry.insert(key.clone(), frame.clone(), handler);
            let teardown = previous.and_then(|entry| entry.subscribe.teardown());
            if teardown.is_some() {
                debug!(key = %key, "Replacing existing subscription");
            }

            let sent = match teardown {
                Some(teardown) => state.send(teardown),
                None => Ok(()),
            }
            .and_then(|()| state.send(frame));
            if let Err(err) = sent {
                state.registry.remove(&key, Some(id));
                return Err(err);
            }
            (id, state.registry.len())
        };

        metrics::set_subscriptions(count);
        Ok(Subscription::keyed(self, key, id))
    }

    /// Remove a keyed subscription and, if connected, tell the server.
    pub(crate) fn remove_keyed(&self, key: &SubscriptionKey, id: Option<SubscriptionId>) -> bool {
        let count = {
            let mut state = self.state.lock();
            let Some(entry) = state.registry.remove(key, id) else {
                return false;
            };
            if key.kind == crate::registry::SubscriptionKind::Presence {
                state.presence.forget(&key.target);
            }
            if state.is_connected() {
                if let Some(teardown) = entry.subscribe.teardown() {
                    if let Err(err) = state.send(teardown) {
                        debug!(key = %key, error = %err, "Unsubscribe not sent");
                    }
                }
            }
            state.registry.len()
        };
        metrics::set_subscriptions(count);
        true
    }

    /// Remove a channel subscription and, if connected, tell the server.
    pub(crate) fn remove_channel(&self, channel: &str, id: Option<SubscriptionId>) -> bool {
        let count = {
            let mut state = self.state.lock();
            if state.registry.remove_channel(channel, id).is_none() {
                return false;
            }
            if state.is_connected() {
                let frame = ClientFrame::UnsubscribeChannel {
                    channel: channel.to_string(),
                };
                if let Err(err) = state.send(frame) {
                    debug!(channel = %channel, error = %err, "Unsubscribe not sent");
                }
            }
            state.registry.len()
        };
        metrics::set_subscriptions(count);
        true
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(task) = self.state.get_mut().task.take() {
            task.abort();
        }
    }
}

/// Realtime client.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RealtimeClient")
            .field("transport", &self.inner.connector.name())
            .field("state", &state.phase)
            .field("subscriptions", &state.registry.len())
            .finish()
    }
}

impl RealtimeClient {
    /// Create a client for the API at `base_url` with default options.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::InvalidConfig`] if the URL or key is unusable.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, RealtimeError> {
        Self::builder().base_url(base_url).api_key(api_key).build()
    }

    /// Start building a client.
    #[must_use]
    pub fn builder() -> RealtimeClientBuilder {
        RealtimeClientBuilder::new()
    }

    /// Options the client was built with.
    #[must_use]
    pub fn options(&self) -> &RealtimeOptions {
        &self.inner.options
    }

    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    /// Connect and wait for the server's handshake.
    ///
    /// Returns immediately when already connected. Concurrent calls share
    /// one attempt. While a reconnect is in progress, waits for its outcome.
    ///
    /// # Errors
    ///
    /// Fails on an authentication error, a transport error, an incompatible
    /// server version or the connection timeout.
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        let (ready, started) = {
            let mut state = self.inner.state.lock();
            if state.is_connected() {
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);

            let started = !state.is_active();
            if started {
                self.inner.start(&mut state);
            }
            (rx, started.then(|| state.status()))
        };

        if let Some(status) = started {
            self.inner.notify_state(&status);
        }

        ready.await.unwrap_or_else(|_| {
            Err(RealtimeError::ConnectFailed(
                "connection attempt cancelled".into(),
            ))
        })
    }

    /// Tear everything down.
    ///
    /// Stops the connection task, closing the socket, and clears every
    /// subscription, channel and presence cache. Pending requests fail.
    /// Listeners stay registered.
    pub fn disconnect(&self) {
        let (task, changed) = {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            let before = state.status();
            let task = state.detach();
            state.registry.clear();
            state.presence.clear();
            state.waiters.clear();
            let after = state.status();
            (task, (before != after).then_some(after))
        };

        self.inner.pending.clear();
        if let Some(task) = task {
            task.abort();
        }
        metrics::set_subscriptions(0);
        info!("Disconnected from realtime server");

        if let Some(status) = changed {
            self.inner.notify_state(&status);
        }
    }

    /// Whether the handshake has completed and the connection is live.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().is_connected()
    }

    /// Current connection status.
    #[must_use]
    pub fn get_connection_status(&self) -> ConnectionStatus {
        self.inner.state.lock().status()
    }

    /// Register a connection-state listener.
    pub fn on_connection_state_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.inner.listeners.lock().add_state(Arc::new(listener))
    }

    /// Register an error listener.
    ///
    /// Receives failures that have no caller to return to: server errors,
    /// refused subscriptions, panicking callbacks and reconnection errors.
    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&RealtimeError) + Send + Sync + 'static,
    {
        self.inner.listeners.lock().add_error(Arc::new(listener))
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.lock().remove(id)
    }

    /// Send a ping; the server answers with a pong.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::NotConnected`] when not connected.
    pub fn ping(&self) -> Result<(), RealtimeError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        self.inner.emit(ClientFrame::ping_with_timestamp(now))
    }

    // ------------------------------------------------------------------
    // Tables
    // ------------------------------------------------------------------

    /// Subscribe to row changes on a table.
    ///
    /// Accepts a table name or a [`TableSubscription`] carrying change
    /// types and a filter. Subscribing to a table again replaces the
    /// previous subscription.
    ///
    /// # Errors
    ///
    /// Fails if the table name is invalid or the client is not connected.
    pub fn subscribe_to_table<F>(
        &self,
        subscription: impl Into<TableSubscription>,
        callback: F,
    ) -> Result<Subscription, RealtimeError>
    where
        F: Fn(DatabaseChange) + Send + Sync + 'static,
    {
        let subscription = subscription.into();
        validate_target(&subscription.table).map_err(RealtimeError::InvalidTarget)?;
        self.inner.install(
            SubscriptionKey::database(&subscription.table),
            ClientFrame::subscribe_table(subscription),
            Handler::Database(Arc::new(callback)),
        )
    }

    /// Remove the subscription on a table.
    pub fn unsubscribe_from_table(&self, table: &str) -> bool {
        self.inner.remove_keyed(&SubscriptionKey::database(table), None)
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    /// Subscribe to a broadcast channel. The callback receives the message
    /// payload.
    ///
    /// # Errors
    ///
    /// Fails if the channel name is invalid or the client is not connected.
    pub fn subscribe_to_channel<F>(
        &self,
        channel: &str,
        callback: F,
    ) -> Result<Subscription, RealtimeError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        validate_target(channel).map_err(RealtimeError::InvalidTarget)?;

        let (id, count) = {
            let mut state = self.inner.state.lock();
            if !state.is_connected() {
                return Err(RealtimeError::NotConnected);
            }

            let (id, previous) = state.registry.insert_channel(channel, Arc::new(callback));
            let sent = match previous {
                Some(_) => {
                    debug!(channel = %channel, "Replacing existing channel subscription");
                    state.send(ClientFrame::UnsubscribeChannel {
                        channel: channel.to_string(),
                    })
                }
                None => Ok(()),
            }
            .and_then(|()| state.send(ClientFrame::subscribe_channel(channel)));
            if let Err(err) = sent {
                state.registry.remove_channel(channel, Some(id));
                return Err(err);
            }
            (id, state.registry.len())
        };

        metrics::set_subscriptions(count);
        Ok(Subscription::channel(&self.inner, channel.to_string(), id))
    }

    /// Remove the subscription on a channel.
    pub fn unsubscribe_from_channel(&self, channel: &str) -> bool {
        self.inner.remove_channel(channel, None)
    }

    /// Publish a message on a channel.
    ///
    /// # Errors
    ///
    /// Fails if the channel name is invalid, the message cannot be
    /// serialized or the client is not connected.
    pub fn publish<T: Serialize + ?Sized>(&self, channel: &str, message: &T) -> Result<(), RealtimeError> {
        validate_target(channel).map_err(RealtimeError::InvalidTarget)?;
        let message = serde_json::to_value(message).map_err(ProtocolError::from)?;
        self.inner.emit(ClientFrame::publish(channel, message))
    }

    /// Subscriber count of a channel, as last reported by the server.
    #[must_use]
    pub fn channel_subscribers(&self, channel: &str) -> Option<u64> {
        self.inner.state.lock().registry.channel_subscribers(channel)
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    /// Join a channel's presence group as `user` and watch membership.
    ///
    /// # Errors
    ///
    /// Fails if the channel or user id is invalid or the client is not
    /// connected.
    pub fn subscribe_to_presence<F>(
        &self,
        channel: &str,
        user: PresenceUser,
        callback: F,
    ) -> Result<Subscription, RealtimeError>
    where
        F: Fn(PresenceDiff) + Send + Sync + 'static,
    {
        validate_target(channel).map_err(RealtimeError::InvalidTarget)?;
        validate_target(&user.id).map_err(RealtimeError::InvalidTarget)?;
        self.inner.install(
            SubscriptionKey::presence(channel),
            ClientFrame::JoinPresence {
                channel: channel.to_string(),
                user,
            },
            Handler::Presence(Arc::new(callback)),
        )
    }

    /// Leave a channel's presence group.
    pub fn leave_presence(&self, channel: &str) -> bool {
        self.inner.remove_keyed(&SubscriptionKey::presence(channel), None)
    }

    /// Replace the info published for this client in a presence group.
    ///
    /// A later resubscription joins with the new info.
    ///
    /// # Errors
    ///
    /// Fails if the channel is invalid or the client is not connected.
    pub fn update_presence(&self, channel: &str, user: PresenceUser) -> Result<(), RealtimeError> {
        validate_target(channel).map_err(RealtimeError::InvalidTarget)?;
        let mut state = self.inner.state.lock();
        state.send(ClientFrame::UpdatePresence {
            channel: channel.to_string(),
            user: user.clone(),
        })?;
        state.registry.set_subscribe_frame(
            &SubscriptionKey::presence(channel),
            ClientFrame::JoinPresence {
                channel: channel.to_string(),
                user,
            },
        );
        Ok(())
    }

    /// Ask the server for a channel's full membership.
    ///
    /// # Errors
    ///
    /// Fails if not connected, if the connection drops before the answer,
    /// or after [`PRESENCE_REQUEST_TIMEOUT`] without one.
    pub async fn get_presence(&self, channel: &str) -> Result<Vec<PresenceUser>, RealtimeError> {
        validate_target(channel).map_err(RealtimeError::InvalidTarget)?;

        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(request_id, tx);

        let frame = ClientFrame::GetPresence {
            channel: channel.to_string(),
            request_id,
        };
        if let Err(err) = self.inner.emit(frame) {
            self.inner.pending.remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(PRESENCE_REQUEST_TIMEOUT, rx).await {
            Ok(Ok(users)) => Ok(users),
            Ok(Err(_)) => Err(RealtimeError::NotConnected),
            Err(_) => {
                self.inner.pending.remove(&request_id);
                Err(RealtimeError::Timeout {
                    operation: "get_presence",
                    after: PRESENCE_REQUEST_TIMEOUT,
                })
            }
        }
    }

    /// Locally cached members of a presence group, ordered by id.
    #[must_use]
    pub fn presence_members(&self, channel: &str) -> Vec<PresenceUser> {
        self.inner.state.lock().presence.members(channel)
    }

    // ------------------------------------------------------------------
    // Workflows, logic, analytics
    // ------------------------------------------------------------------

    /// Subscribe to a workflow's events.
    ///
    /// # Errors
    ///
    /// Fails if the id is invalid or the client is not connected.
    pub fn subscribe_to_workflow<F>(
        &self,
        workflow_id: &str,
        callback: F,
    ) -> Result<Subscription, RealtimeError>
    where
        F: Fn(WorkflowEvent) + Send + Sync + 'static,
    {
        validate_target(workflow_id).map_err(RealtimeError::InvalidTarget)?;
        self.inner.install(
            SubscriptionKey::workflow(workflow_id),
            ClientFrame::SubscribeWorkflow {
                workflow_id: workflow_id.to_string(),
            },
            Handler::Workflow(Arc::new(callback)),
        )
    }

    /// Stop following a workflow. Returns `false` if it was not followed.
    pub fn unsubscribe_from_workflow(&self, workflow_id: &str) -> bool {
        self.inner
            .remove_keyed(&SubscriptionKey::workflow(workflow_id), None)
    }

    /// Subscribe to a server-side logic function's events.
    ///
    /// # Errors
    ///
    /// Fails if the name is invalid or the client is not connected.
    pub fn subscribe_to_logic<F>(
        &self,
        logic_name: &str,
        callback: F,
    ) -> Result<Subscription, RealtimeError>
    where
        F: Fn(LogicEvent) + Send + Sync + 'static,
    {
        validate_target(logic_name).map_err(RealtimeError::InvalidTarget)?;
        self.inner.install(
            SubscriptionKey::logic(logic_name),
            ClientFrame::SubscribeLogic {
                logic_name: logic_name.to_string(),
            },
            Handler::Logic(Arc::new(callback)),
        )
    }

    /// Stop following a logic function. Returns `false` if it was not followed.
    pub fn unsubscribe_from_logic(&self, logic_name: &str) -> bool {
        self.inner
            .remove_keyed(&SubscriptionKey::logic(logic_name), None)
    }

    /// Subscribe to an analytics stream.
    ///
    /// # Errors
    ///
    /// Fails if the target is invalid or the client is not connected.
    pub fn subscribe_to_analytics<F>(
        &self,
        target: AnalyticsTarget,
        callback: F,
    ) -> Result<Subscription, RealtimeError>
    where
        F: Fn(AnalyticsUpdate) + Send + Sync + 'static,
    {
        validate_target(&target.target_type).map_err(RealtimeError::InvalidTarget)?;
        validate_target(&target.target_id).map_err(RealtimeError::InvalidTarget)?;
        self.inner.install(
            SubscriptionKey::analytics(&target),
            ClientFrame::SubscribeAnalytics(target),
            Handler::Analytics(Arc::new(callback)),
        )
    }

    /// Leave an analytics stream. Returns `false` if it was not subscribed.
    pub fn unsubscribe_from_analytics(&self, target: &AnalyticsTarget) -> bool {
        self.inner
            .remove_keyed(&SubscriptionKey::analytics(target), None)
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    /// Remove the subscription behind a handle.
    ///
    /// Returns `false` if it was already removed or has been replaced.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        subscription.unsubscribe()
    }

    /// `kind:target` keys of every active subscription, sorted.
    #[must_use]
    pub fn get_active_subscriptions(&self) -> Vec<String> {
        self.inner.state.lock().registry.active_keys()
    }

    /// Names of every subscribed channel, sorted.
    #[must_use]
    pub fn get_active_channels(&self) -> Vec<String> {
        self.inner.state.lock().registry.channel_names()
    }
}

/// Builder for [`RealtimeClient`].
pub struct RealtimeClientBuilder {
    base_url: Option<String>,
    endpoint: Option<String>,
    api_key: Option<String>,
    options: RealtimeOptions,
    connector: Option<Arc<dyn Connector>>,
}

impl RealtimeClientBuilder {
    fn new() -> Self {
        Self {
            base_url: None,
            endpoint: None,
            api_key: None,
            options: RealtimeOptions::default(),
            connector: None,
        }
    }

    /// REST base URL; the realtime endpoint is derived from its origin.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Use this realtime endpoint verbatim instead of deriving it.
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Some(url.into());
        self
    }

    /// API key sent with the connection.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Connection options.
    pub fn options(mut self, options: RealtimeOptions) -> Self {
        self.options = options;
        self
    }

    /// Transport to connect with. Defaults to WebSocket.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Build the client. Does not connect.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::InvalidConfig`] without an API key or
    /// without a usable URL.
    pub fn build(self) -> Result<RealtimeClient, RealtimeError> {
        let api_key = self
            .api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| RealtimeError::InvalidConfig("API key is required".into()))?;

        let endpoint = match (self.endpoint, self.base_url) {
            (Some(endpoint), _) => endpoint,
            (None, Some(base_url)) => realtime_endpoint(&base_url, &self.options.path)?,
            (None, None) => {
                return Err(RealtimeError::InvalidConfig(
                    "base URL or endpoint is required".into(),
                ))
            }
        };
        debug!(endpoint = %endpoint, "Realtime endpoint resolved");
        let url = with_credentials(&endpoint, &api_key, PROTOCOL_VERSION)?;

        let connector = self.connector.unwrap_or_else(|| {
            Arc::new(WebSocketConnector::with_encoding(self.options.encoding))
        });

        Ok(RealtimeClient {
            inner: Arc::new(ClientInner {
                url,
                options: self.options,
                connector,
                state: Mutex::new(ClientState::new()),
                listeners: Mutex::new(Listeners::default()),
                pending: DashMap::new(),
                next_request_id: AtomicU64::new(1),
            }),
        })
    }
}
