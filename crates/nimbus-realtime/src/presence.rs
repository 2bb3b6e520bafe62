//! Presence membership cache.
//!
//! The client keeps a local view of who is present in each channel it has
//! joined. The server is the authority; the cache is only changed by
//! inbound presence updates and full presence snapshots.

use nimbus_protocol::{PresenceUpdate, PresenceUser};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// A member that left a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceLeave {
    /// User id.
    pub id: String,
    /// When the member left, in milliseconds since the Unix epoch.
    pub left_at: u64,
}

/// Membership change delivered to presence callbacks.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PresenceDiff {
    /// Members that joined.
    pub joined: Vec<PresenceUser>,
    /// Members that left.
    pub left: Vec<PresenceLeave>,
    /// Members whose info changed.
    pub updated: Vec<PresenceUser>,
}

impl PresenceDiff {
    /// Check if the diff carries no change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty() && self.updated.is_empty()
    }
}

/// Channel to members cache.
#[derive(Debug, Default)]
pub struct PresenceCache {
    channels: HashMap<String, HashMap<String, PresenceUser>>,
}

impl PresenceCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an update into the channel's membership.
    ///
    /// Joined members are inserted, left members removed and updated
    /// members replaced. Returns the diff to deliver; a leave without a
    /// timestamp is stamped with the current time.
    pub fn apply(&mut self, update: PresenceUpdate) -> PresenceDiff {
        let members = self.channels.entry(update.channel.clone()).or_default();

        for user in &update.joined {
            members.insert(user.id.clone(), user.clone());
        }

        let now = now_ms();
        let left: Vec<PresenceLeave> = update
            .left
            .iter()
            .map(|member| {
                members.remove(member.id());
                PresenceLeave {
                    id: member.id().to_string(),
                    left_at: member.left_at().unwrap_or(now),
                }
            })
            .collect();

        for user in &update.updated {
            members.insert(user.id.clone(), user.clone());
        }

        debug!(
            channel = %update.channel,
            joined = update.joined.len(),
            left = left.len(),
            updated = update.updated.len(),
            "Presence: applied update"
        );

        PresenceDiff {
            joined: update.joined,
            left,
            updated: update.updated,
        }
    }

    /// Replace the channel's membership with a full snapshot.
    pub fn replace(&mut self, channel: &str, users: &[PresenceUser]) {
        let members = users
            .iter()
            .map(|user| (user.id.clone(), user.clone()))
            .collect();
        self.channels.insert(channel.to_string(), members);
    }

    /// Members of a channel, ordered by id.
    #[must_use]
    pub fn members(&self, channel: &str) -> Vec<PresenceUser> {
        let mut members: Vec<PresenceUser> = self
            .channels
            .get(channel)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members
    }

    /// Get the number of members in a channel.
    #[must_use]
    pub fn count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, HashMap::len)
    }

    /// Check if a user is present in a channel.
    #[must_use]
    pub fn is_present(&self, channel: &str, user_id: &str) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|members| members.contains_key(user_id))
    }

    /// Drop a channel's membership.
    pub fn forget(&mut self, channel: &str) {
        self.channels.remove(channel);
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
