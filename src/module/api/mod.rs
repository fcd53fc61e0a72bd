//! Module bus
//!
//! Event subscriptions, the message dispatcher, and the virtual host endpoint.

pub mod events;
pub mod host;
pub mod hub;

pub use events::{Subscription, SubscriptionSet};
pub use host::{HostEndpoint, Procedure};
pub use hub::{HubHandle, Inbound, MessageHub};
