//! Topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels so every subscriber receives every
//! message and a slow subscriber never blocks the control plane.
//!
//! # Topics
//!
//! [`EventBus::emit`] routes each [`Event`] to one [`Topic`] lane by payload,
//! and also to the all-events lane:
//!
//! | Topic | Payloads |
//! |---|---|
//! | [`Topic::Presence`] | device registered / deactivated, presence changed |
//! | [`Topic::Actions`] | action state changes |
//! | [`Topic::Security`] | failed unlock attempts, blocked attempts, lockout trips |
//! | [`Topic::Policy`] | policy and assignment changes |
//!
//! Emitting with nobody listening is normal and never an error.

use futures_util::stream::{self, BoxStream};
use fleetlock_types::{Event, EventPayload};
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Presence,
    Actions,
    Security,
    Policy,
}

impl Topic {
    pub const ALL: [Topic; 4] = [Topic::Presence, Topic::Actions, Topic::Security, Topic::Policy];

    /// Lane an event payload is routed to.
    pub fn of(payload: &EventPayload) -> Topic {
        match payload {
            EventPayload::DeviceRegistered { .. }
            | EventPayload::DeviceDeactivated
            | EventPayload::PresenceChanged { .. } => Topic::Presence,
            EventPayload::ActionStateChanged { .. } => Topic::Actions,
            EventPayload::UnlockAttemptFailed { .. }
            | EventPayload::UnlockBlocked { .. }
            | EventPayload::LockoutTripped { .. } => Topic::Security,
            EventPayload::PolicyChanged { .. } => Topic::Policy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Presence => "presence",
            Topic::Actions => "actions",
            Topic::Security => "security",
            Topic::Policy => "policy",
        }
    }

    pub fn parse(s: &str) -> Option<Topic> {
        Topic::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

/// Shared event bus.  Clones share the same channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    all: broadcast::Sender<Event>,
    presence: broadcast::Sender<Event>,
    actions: broadcast::Sender<Event>,
    security: broadcast::Sender<Event>,
    policy: broadcast::Sender<Event>,
}

impl EventBus {
    /// `capacity` applies to every lane independently.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        let (presence, _) = broadcast::channel(capacity);
        let (actions, _) = broadcast::channel(capacity);
        let (security, _) = broadcast::channel(capacity);
        let (policy, _) = broadcast::channel(capacity);
        Self {
            all,
            presence,
            actions,
            security,
            policy,
        }
    }

    /// Route `event` to its topic lane and to the all-events lane.
    ///
    /// Returns how many receivers were handed the event across both lanes.
    pub fn emit(&self, event: Event) -> usize {
        let topic = Topic::of(&event.payload);
        let on_topic = self.topic_sender(topic).send(event.clone()).unwrap_or(0);
        let on_all = self.all.send(event).unwrap_or(0);
        on_topic + on_all
    }

    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic: Some(topic),
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Subscribe to every event regardless of topic.
    pub fn subscribe_all(&self) -> TopicReceiver {
        TopicReceiver {
            topic: None,
            receiver: self.all.subscribe(),
        }
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Presence => &self.presence,
            Topic::Actions => &self.actions,
            Topic::Security => &self.security,
            Topic::Policy => &self.policy,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to one lane.
pub struct TopicReceiver {
    /// `None` for the all-events lane.
    topic: Option<Topic>,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event.  A lagging receiver skips what it missed and
    /// keeps going; `None` means the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn topic(&self) -> Option<Topic> {
        self.topic
    }

    /// Turn the receiver into a stream that ends when the bus is dropped.
    pub fn into_stream(self) -> BoxStream<'static, Event> {
        Box::pin(stream::unfold(self, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        }))
    }
}
