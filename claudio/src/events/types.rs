//! Event and topic types for the bus

use serde::{Deserialize, Serialize};

/// Timeout kinds raised by the instance supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutKind {
    /// No activity (output change) for longer than the activity bound
    Activity,
    /// The instance ran longer than the wall-clock bound
    Completion,
    /// Output byte-identical for longer than the stale bound while Working
    Stale,
}

/// Subscription topics
///
/// One topic per event variant; unknown topics cannot be expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    PrCompleted,
    PrOpened,
    InstanceTimeout,
    InstanceBell,
}

impl Topic {
    /// Wire name of the topic
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrCompleted => "pr.completed",
            Self::PrOpened => "pr.opened",
            Self::InstanceTimeout => "instance.timeout",
            Self::InstanceBell => "instance.bell",
        }
    }
}

/// A bus event, tagged with the originating instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A pull-request workflow finished for an instance
    PrCompleted { instance_id: String, success: bool },
    /// A pull-request URL was detected in an instance's stream
    PrOpened { instance_id: String },
    /// The supervisor crossed a timeout bound
    InstanceTimeout { instance_id: String, kind: TimeoutKind },
    /// The terminal rang the bell in an instance session
    InstanceBell { instance_id: String },
}

impl Event {
    /// Topic this event is published under
    pub fn topic(&self) -> Topic {
        match self {
            Self::PrCompleted { .. } => Topic::PrCompleted,
            Self::PrOpened { .. } => Topic::PrOpened,
            Self::InstanceTimeout { .. } => Topic::InstanceTimeout,
            Self::InstanceBell { .. } => Topic::InstanceBell,
        }
    }

    /// Originating instance ID
    pub fn instance_id(&self) -> &str {
        match self {
            Self::PrCompleted { instance_id, .. }
            | Self::PrOpened { instance_id }
            | Self::InstanceTimeout { instance_id, .. }
            | Self::InstanceBell { instance_id } => instance_id,
        }
    }
}
