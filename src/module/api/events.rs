//! Event subscriptions
//!
//! Each running module owns a [`SubscriptionSet`]. A subscription pairs a
//! source pattern (tested against the sender's name) with a type pattern
//! (tested against the event type). Patterns use `*` and `?` wildcards.

use wildmatch::WildMatch;

use crate::module::ipc::protocol::{MessageId, WILDCARD};

#[derive(Debug, Clone)]
pub struct Subscription {
    /// Id of the `register` message that created this subscription
    pub registration: MessageId,
    pub source: String,
    pub event_type: String,
    source_matcher: WildMatch,
    type_matcher: WildMatch,
}

impl Subscription {
    pub fn new(registration: MessageId, source: &str, event_type: &str) -> Self {
        Self {
            registration,
            source: source.to_string(),
            event_type: event_type.to_string(),
            source_matcher: WildMatch::new(source),
            type_matcher: WildMatch::new(event_type),
        }
    }

    pub fn matches(&self, sender: &str, event_type: &str) -> bool {
        (self.source == WILDCARD || self.source_matcher.matches(sender))
            && (self.event_type == WILDCARD || self.type_matcher.matches(event_type))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionSet {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription. A repeated registration id replaces the earlier one.
    pub fn register(&mut self, registration: MessageId, source: &str, event_type: &str) {
        self.subscriptions.retain(|s| s.registration != registration);
        self.subscriptions
            .push(Subscription::new(registration, source, event_type));
    }

    /// Remove a subscription, returning whether it existed
    pub fn unregister(&mut self, registration: MessageId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.registration != registration);
        self.subscriptions.len() != before
    }

    /// Whether any subscription matches
    pub fn matches(&self, sender: &str, event_type: &str) -> bool {
        self.subscriptions
            .iter()
            .any(|s| s.matches(sender, event_type))
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.iter()
    }
}
