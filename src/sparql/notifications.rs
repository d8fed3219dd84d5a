//! Notifications delivered from a processing unit to its subscribers, and the
//! sink capability the gateway provides for delivery.

use serde::Serialize;

use crate::sparql::bindings::Bindings;

/// Why a subscription was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The last subscriber unsubscribed.
    Unsubscribed,
    /// The gateway reported the connection gone.
    ConnectionLost,
    /// The engine is shutting down.
    Shutdown,
}

/// The tagged content of a notification.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationPayload {
    /// The full result set a new subscriber starts from.
    InitialSnapshot(Bindings),
    /// Bindings that entered the result set in the last update.
    Added(Bindings),
    /// Bindings that left the result set in the last update.
    Removed(Bindings),
    /// The subscription is gone.
    Terminated(TerminationReason),
}

/// One event on a subscription. Sequence numbers are per processing unit,
/// strictly increasing and without gaps.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub spuid: String,
    pub sequence: u64,
    pub payload: NotificationPayload,
}

impl Notification {
    pub fn initial_snapshot(spuid: &str, sequence: u64, bindings: Bindings) -> Self {
        Notification {
            spuid: spuid.to_string(),
            sequence,
            payload: NotificationPayload::InitialSnapshot(bindings),
        }
    }

    pub fn added(spuid: &str, sequence: u64, bindings: Bindings) -> Self {
        Notification {
            spuid: spuid.to_string(),
            sequence,
            payload: NotificationPayload::Added(bindings),
        }
    }

    pub fn removed(spuid: &str, sequence: u64, bindings: Bindings) -> Self {
        Notification {
            spuid: spuid.to_string(),
            sequence,
            payload: NotificationPayload::Removed(bindings),
        }
    }

    pub fn terminated(spuid: &str, sequence: u64, reason: TerminationReason) -> Self {
        Notification {
            spuid: spuid.to_string(),
            sequence,
            payload: NotificationPayload::Terminated(reason),
        }
    }

    /// Serializes the notification to the gateway wire frame: `spuid`,
    /// `sequence` and the three result lists, absent lists as `null`.
    pub fn to_frame(&self) -> serde_json::Value {
        let mut frame = NotificationFrame {
            spuid: &self.spuid,
            sequence: self.sequence,
            first_results: None,
            added_results: None,
            removed_results: None,
            terminated: None,
        };
        match &self.payload {
            NotificationPayload::InitialSnapshot(b) => frame.first_results = Some(b),
            NotificationPayload::Added(b) => frame.added_results = Some(b),
            NotificationPayload::Removed(b) => frame.removed_results = Some(b),
            NotificationPayload::Terminated(reason) => frame.terminated = Some(*reason),
        }
        serde_json::json!({ "notification": frame })
    }
}

#[derive(Serialize)]
struct NotificationFrame<'a> {
    spuid: &'a str,
    sequence: u64,
    #[serde(rename = "firstResults")]
    first_results: Option<&'a Bindings>,
    #[serde(rename = "addedResults")]
    added_results: Option<&'a Bindings>,
    #[serde(rename = "removedResults")]
    removed_results: Option<&'a Bindings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    terminated: Option<TerminationReason>,
}

/// Error returned by a sink whose connection is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

impl std::fmt::Display for SinkClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "event sink closed")
    }
}

impl std::error::Error for SinkClosed {}

/// Delivery capability provided by the gateway for one subscriber.
///
/// Delivery must return quickly; the gateway completes the actual write on
/// its own threads. A [`SinkClosed`] error marks the connection lost and is
/// reported upstream, it never aborts the fan-out to other subscribers.
pub trait EventSink: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<(), SinkClosed>;
}
