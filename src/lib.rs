//! # a3s-fabric
//!
//! Rule-based event routing between buses and durable work queues.
//!
//! ## Overview
//!
//! `a3s-fabric` routes events from a partner feed and from internal sources
//! through named buses. Each bus holds pattern-matching rules; every matching
//! rule forwards the event to its targets, either another bus (evaluated
//! again there) or a durable queue with visibility-timeout, at-least-once
//! delivery. A dispatcher drains each queue into a single registered handler.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_fabric::{Event, Fabric, FabricConfig};
//!
//! # async fn example() -> a3s_fabric::Result<()> {
//! // The standard partner topology: partner and internal buses feed a
//! // processing bus, which feeds StripeEventQueue
//! let config = FabricConfig::partner_topology("aws.partner/stripe.com/ed_test_61");
//! let fabric = Fabric::from_config(config)?;
//!
//! let event = Event::new("custom.stripe.test", "test", serde_json::json!({"n": 1}));
//! let receipt = fabric.publish("InternalEventBus", event).await?;
//!
//! println!("Queued: {:?}", receipt.queued());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **EventBus** — named set of rules; unmatched events are dropped
//! - **EventPattern** — field → exact/prefix predicates (AND across fields, OR within)
//! - **Router** — forwards to bus and queue targets, checking resolved capabilities
//! - **DurableQueue** — at-least-once queue with visibility timeouts
//! - **Dispatcher** — polls a queue and acks messages its `Handler` accepts
//! - **Fabric** — builds and owns all of the above from a `FabricConfig`

pub mod access;
pub mod bus;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod dlq;
pub mod error;
pub mod fabric;
pub mod partner;
pub mod pattern;
pub mod queue;
pub mod router;
pub mod rule;
pub mod state;
pub mod types;

// Re-export core types
pub use access::{AccessPolicy, Capability, PolicyStatement, Role};
pub use bus::EventBus;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::FabricConfig;
pub use dispatcher::{
    handler_fn, BatchReport, Dispatcher, DispatcherHandle, DispatcherOptions, Handler,
    LoggingHandler,
};
pub use dlq::{DeadLetter, DlqHandler, MemoryDlqHandler, QueueDlqHandler};
pub use error::{FabricError, HandlerError, Result, RoutingError};
pub use fabric::{Fabric, FabricBuilder};
pub use partner::PartnerFeed;
pub use pattern::{matches, EventPattern, Predicate};
pub use queue::{DurableQueue, QueueOptions, RedrivePolicy};
pub use router::{Delivery, PublishReceipt, Router};
pub use rule::{Rule, RuleHandle, Target, TargetKind};
pub use state::{FileQueueStore, MemoryQueueStore, QueueStore};
pub use types::{Event, IngestRecord, MessageId, QueueStats, ReceivedMessage};
