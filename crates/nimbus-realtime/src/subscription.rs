//! Subscription handles.

use std::sync::{Arc, Weak};

use crate::client::ClientInner;
use crate::registry::{SubscriptionId, SubscriptionKey};

#[derive(Debug, Clone)]
enum Target {
    Keyed(SubscriptionKey),
    Channel(String),
}

/// Handle to one installed subscription.
///
/// Dropping the handle leaves the subscription in place; call
/// [`Subscription::unsubscribe`] to remove it. A handle only ever removes
/// the subscription it created: once the same key has been subscribed
/// again, the old handle is inert.
#[derive(Debug)]
pub struct Subscription {
    client: Weak<ClientInner>,
    target: Target,
    id: SubscriptionId,
}

impl Subscription {
    pub(crate) fn keyed(client: &Arc<ClientInner>, key: SubscriptionKey, id: SubscriptionId) -> Self {
        Self {
            client: Arc::downgrade(client),
            target: Target::Keyed(key),
            id,
        }
    }

    pub(crate) fn channel(client: &Arc<ClientInner>, channel: String, id: SubscriptionId) -> Self {
        Self {
            client: Arc::downgrade(client),
            target: Target::Channel(channel),
            id,
        }
    }

    /// Identifier of this install.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// `kind:target` key, e.g. `database:orders` or `channel:news`.
    #[must_use]
    pub fn key(&self) -> String {
        match &self.target {
            Target::Keyed(key) => key.to_string(),
            Target::Channel(channel) => format!("channel:{channel}"),
        }
    }

    /// Whether this handle still owns its subscription and the server has
    /// not refused it.
    #[must_use]
    pub fn is_active(&self) -> bool {
        let Some(client) = self.client.upgrade() else {
            return false;
        };
        let state = client.state.lock();
        match &self.target {
            Target::Keyed(key) => {
                state.registry.owns(key, self.id) && state.registry.is_active(key)
            }
            Target::Channel(channel) => state.registry.owns_channel(channel, self.id),
        }
    }

    /// Remove the subscription, telling the server if connected.
    ///
    /// Returns `false` if it was already gone or has been replaced.
    pub fn unsubscribe(self) -> bool {
        let Some(client) = self.client.upgrade() else {
            return false;
        };
        match &self.target {
            Target::Keyed(key) => client.remove_keyed(key, Some(self.id)),
            Target::Channel(channel) => client.remove_channel(channel, Some(self.id)),
        }
    }
}
