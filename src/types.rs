//! Core event and message types for the routing fabric
//!
//! All types use camelCase JSON serialization for wire compatibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Queue-assigned message identifier (msg-<uuid>)
pub type MessageId = String;

/// A single event flowing through the fabric
///
/// Events are immutable once published. Forwarding between buses shares the
/// same event (the router passes it behind an `Arc`), so `id`, `source` and
/// `detail` are identical at every hop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique delivery identifier (evt-<uuid>), assigned at ingress
    pub id: String,

    /// Origin of the event (e.g., "custom.stripe.test", "aws.partner/stripe.com/...")
    pub source: String,

    /// Event type identifier (e.g., "charge.created")
    #[serde(alias = "detail-type")]
    pub detail_type: String,

    /// Event payload — arbitrary JSON data
    pub detail: serde_json::Value,

    /// Time the event entered the fabric
    pub time: DateTime<Utc>,

    /// Resources the event concerns
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
}

impl Event {
    /// Create a new event with auto-generated id and timestamp
    pub fn new(
        source: impl Into<String>,
        detail_type: impl Into<String>,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            source: source.into(),
            detail_type: detail_type.into(),
            detail,
            time: Utc::now(),
            resources: Vec::new(),
        }
    }

    /// Add a resource entry
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resources.push(resource.into());
        self
    }
}

/// One line of newline-delimited JSON accepted by `Fabric::ingest_line`
///
/// The fabric assigns `id` and `time`; `bus` defaults to the partner bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRecord {
    #[serde(default = "default_ingest_bus")]
    pub bus: String,

    pub source: String,

    #[serde(alias = "detail-type")]
    pub detail_type: String,

    #[serde(default)]
    pub detail: serde_json::Value,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
}

fn default_ingest_bus() -> String {
    crate::config::PARTNER_BUS_ALIAS.to_string()
}

impl IngestRecord {
    pub fn into_event(self) -> Event {
        let mut event = Event::new(self.source, self.detail_type, self.detail);
        event.resources = self.resources;
        event
    }
}

/// A message handed out by `DurableQueue::dequeue_batch`
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Queue-assigned message id
    pub message_id: MessageId,

    /// Identifies this receive; required by ack/nack
    pub receipt_handle: String,

    /// The original event
    pub event: Event,

    /// How many times this message has been dequeued, including this time
    pub receive_count: u32,

    /// Unix timestamp in milliseconds when the message was enqueued
    pub enqueued_at: u64,

    /// Unix timestamp in milliseconds when the message becomes visible again
    pub visible_at: u64,
}

/// Point-in-time message counts for a queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Messages available for dequeue
    pub visible: usize,

    /// Messages dequeued and hidden, awaiting ack or expiry
    pub in_flight: usize,
}
