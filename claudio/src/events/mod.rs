//! Event bus - typed publish/subscribe for instance-level events
//!
//! Capture workers and workflow coordinators publish here; the UI loop
//! subscribes per topic and drains receivers on each tick.

mod bus;
mod types;

pub use bus::{EventBus, Subscription, SubscriptionHandle, SUBSCRIPTION_CAPACITY};
pub use types::{Event, TimeoutKind, Topic};
