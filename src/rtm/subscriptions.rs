//! Channel↔handle subscription registry.
//!
//! Exactly one subscription per channel and one channel per handle. Double
//! insertion is a programming error and panics; the client relies on this to
//! catch misuse before it corrupts routing.

use std::collections::HashMap;
use std::rc::Rc;

use super::{SubscriptionHandler, SubscriptionId};

/// Ack-driven lifecycle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Subscribe sent, ack not yet received.
    PendingSubscribe,
    /// Subscribe acked; data flows.
    Current,
    /// Unsubscribe sent, ack not yet received. Data still arriving for the
    /// channel is delivered until the ack lands.
    PendingUnsubscribe,
}

/// One registered subscription.
pub struct SubscriptionEntry {
    pub channel: String,
    pub sub: SubscriptionId,
    pub handler: Rc<dyn SubscriptionHandler>,
    pub status: SubscriptionStatus,
    /// Request id of the subscribe or unsubscribe currently awaiting an ack.
    pub pending_request_id: Option<u64>,
}

/// Bidirectional channel↔handle map.
#[derive(Default)]
pub struct SubscriptionRegistry {
    by_channel: HashMap<String, SubscriptionEntry>,
    by_sub: HashMap<SubscriptionId, String>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending subscription. Panics if the channel or the handle
    /// is already present.
    pub fn add(
        &mut self,
        channel: &str,
        sub: SubscriptionId,
        handler: Rc<dyn SubscriptionHandler>,
        pending_request_id: u64,
    ) {
        assert!(
            !self.by_channel.contains_key(channel),
            "subscription already exists for channel {channel}"
        );
        assert!(
            !self.by_sub.contains_key(&sub),
            "subscription handle already registered for channel {channel}"
        );

        self.by_channel.insert(
            channel.to_string(),
            SubscriptionEntry {
                channel: channel.to_string(),
                sub,
                handler,
                status: SubscriptionStatus::PendingSubscribe,
                pending_request_id: Some(pending_request_id),
            },
        );
        self.by_sub.insert(sub, channel.to_string());
    }

    pub fn find_by_channel(&self, channel: &str) -> Option<&SubscriptionEntry> {
        self.by_channel.get(channel)
    }

    pub fn find_by_channel_mut(&mut self, channel: &str) -> Option<&mut SubscriptionEntry> {
        self.by_channel.get_mut(channel)
    }

    pub fn find_by_sub(&self, sub: SubscriptionId) -> Option<&SubscriptionEntry> {
        self.by_sub
            .get(&sub)
            .and_then(|channel| self.by_channel.get(channel))
    }

    pub fn find_by_sub_mut(&mut self, sub: SubscriptionId) -> Option<&mut SubscriptionEntry> {
        let channel = self.by_sub.get(&sub)?.clone();
        self.by_channel.get_mut(&channel)
    }

    /// Remove the entry for a channel. Returns false when absent.
    pub fn delete_by_channel(&mut self, channel: &str) -> bool {
        match self.by_channel.remove(channel) {
            Some(entry) => {
                self.by_sub.remove(&entry.sub);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.by_channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_channel.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_channel.clear();
        self.by_sub.clear();
    }
}
