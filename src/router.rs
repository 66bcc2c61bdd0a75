//! Router — forwards matching events to bus and queue targets
//!
//! Publishing on a bus evaluates its rules and forwards the event to every
//! target of every matching rule, concurrently. A bus target re-enters rule
//! evaluation on that bus, so chains of any depth (up to the hop limit) work
//! the same way. The event is shared behind an `Arc` and never modified.

use crate::access::{AccessPolicy, Capability};
use crate::bus::EventBus;
use crate::error::{FabricError, Result, RoutingError};
use crate::queue::DurableQueue;
use crate::rule::{AttachedRule, ResolvedTarget, Rule, RuleHandle, Target, TargetKind};
use crate::types::{Event, MessageId};
use futures::future::{join_all, BoxFuture};
use std::collections::HashMap;
use std::sync::Arc;

/// Default maximum number of bus-to-bus hops for one event
pub const DEFAULT_MAX_HOPS: usize = 16;

/// Outcome of one successful forward
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Re-published on a bus; the receipt describes that publish
    Bus(PublishReceipt),

    /// Enqueued
    Queue { queue: String, message_id: MessageId },
}

/// A successful forward by one rule to one target
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub rule: String,
    pub target_id: String,
    pub delivery: Delivery,
}

/// A failed forward by one rule to one target
#[derive(Debug, Clone)]
pub struct FailedDelivery {
    pub rule: String,
    pub target_id: String,
    pub error: RoutingError,
}

/// Summary of publishing one event on one bus
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub event_id: String,
    pub bus: String,

    /// Names of the rules that matched (empty means the event was dropped)
    pub matched_rules: Vec<String>,

    pub deliveries: Vec<DeliveryRecord>,

    /// Routing errors at this hop
    pub failures: Vec<FailedDelivery>,
}

impl PublishReceipt {
    fn new(event_id: &str, bus: &str) -> Self {
        Self {
            event_id: event_id.to_string(),
            bus: bus.to_string(),
            matched_rules: Vec::new(),
            deliveries: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// True when no rule matched
    pub fn is_dropped(&self) -> bool {
        self.matched_rules.is_empty()
    }

    /// Every (queue, message id) reached from this publish, across all hops
    pub fn queued(&self) -> Vec<(String, MessageId)> {
        let mut out = Vec::new();
        self.collect_queued(&mut out);
        out
    }

    fn collect_queued(&self, out: &mut Vec<(String, MessageId)>) {
        for record in &self.deliveries {
            match &record.delivery {
                Delivery::Queue { queue, message_id } => {
                    out.push((queue.clone(), message_id.clone()))
                }
                Delivery::Bus(receipt) => receipt.collect_queued(out),
            }
        }
    }

    /// Every bus the event was re-published on, across all hops
    pub fn buses_reached(&self) -> Vec<String> {
        let mut out = Vec::new();
        for record in &self.deliveries {
            if let Delivery::Bus(receipt) = &record.delivery {
                out.push(receipt.bus.clone());
                out.extend(receipt.buses_reached());
            }
        }
        out
    }

    /// Routing errors from this hop and every downstream hop
    pub fn all_failures(&self) -> Vec<FailedDelivery> {
        let mut out = self.failures.clone();
        for record in &self.deliveries {
            if let Delivery::Bus(receipt) = &record.delivery {
                out.extend(receipt.all_failures());
            }
        }
        out
    }
}

struct RouterInner {
    buses: HashMap<String, Arc<EventBus>>,
    queues: HashMap<String, Arc<DurableQueue>>,
    policy: AccessPolicy,
    max_hops: usize,
}

/// Owns the bus and queue registries and performs forwards
///
/// Cheap to clone; clones share the same registries.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(
        buses: impl IntoIterator<Item = Arc<EventBus>>,
        queues: impl IntoIterator<Item = Arc<DurableQueue>>,
        policy: AccessPolicy,
        max_hops: usize,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                buses: buses
                    .into_iter()
                    .map(|b| (b.name().to_string(), b))
                    .collect(),
                queues: queues
                    .into_iter()
                    .map(|q| (q.name().to_string(), q))
                    .collect(),
                policy,
                max_hops,
            }),
        }
    }

    pub fn bus(&self, name: &str) -> Option<Arc<EventBus>> {
        self.inner.buses.get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<Arc<DurableQueue>> {
        self.inner.queues.get(name).cloned()
    }

    pub fn bus_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.buses.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.inner.policy
    }

    /// Resolve a target's capability against the access policy
    pub fn resolve(&self, target: Target) -> ResolvedTarget {
        let capability = self.inner.policy.resolve(&target);
        if let Capability::Denied { reason } = &capability {
            tracing::warn!(target_id = %target.id, reason = %reason, "Target capability denied");
        }
        ResolvedTarget { target, capability }
    }

    /// Attach a rule to a bus, resolving each target's capability once
    pub fn attach_rule(&self, bus: &str, rule: Rule) -> Result<RuleHandle> {
        rule.validate()?;
        let bus = self
            .bus(bus)
            .ok_or_else(|| FabricError::NotFound(format!("Bus not found: {}", bus)))?;

        let targets = rule
            .targets
            .into_iter()
            .map(|t| self.resolve(t))
            .collect();
        bus.attach(AttachedRule {
            name: rule.name,
            pattern: rule.pattern,
            targets,
        })
    }

    /// Detach a rule; returns whether it was attached
    pub fn detach_rule(&self, handle: &RuleHandle) -> bool {
        self.bus(&handle.bus)
            .map(|bus| bus.detach(&handle.rule))
            .unwrap_or(false)
    }

    /// Publish an event on a bus
    ///
    /// Fails only if the bus does not exist. An event no rule matches is
    /// dropped silently; routing errors at this hop are in the receipt.
    pub async fn publish(&self, bus: &str, event: Event) -> Result<PublishReceipt> {
        let bus = self.bus(bus).ok_or_else(|| RoutingError::TargetNotFound {
            kind: "bus",
            name: bus.to_string(),
        })?;
        Ok(self.publish_on(bus, Arc::new(event), 0).await)
    }

    /// Forward an event to a single resolved target
    pub async fn forward(
        &self,
        event: Arc<Event>,
        target: &ResolvedTarget,
    ) -> std::result::Result<Delivery, RoutingError> {
        self.forward_hop(event, target, 0).await
    }

    fn publish_on(
        &self,
        bus: Arc<EventBus>,
        event: Arc<Event>,
        hops: usize,
    ) -> BoxFuture<'_, PublishReceipt> {
        Box::pin(async move {
            let mut receipt = PublishReceipt::new(&event.id, bus.name());
            let rules = bus.matching_rules(&event);

            if rules.is_empty() {
                tracing::debug!(
                    bus = %bus.name(),
                    event_id = %event.id,
                    source = %event.source,
                    "No rule matched, event dropped"
                );
                return receipt;
            }

            receipt.matched_rules = rules.iter().map(|r| r.name.clone()).collect();
            tracing::debug!(
                bus = %bus.name(),
                event_id = %event.id,
                rules = ?receipt.matched_rules,
                "Rules matched"
            );

            let event = &event;
            let sends = rules.iter().flat_map(move |rule| {
                rule.targets.iter().map(move |target| async move {
                    let outcome = self.forward_hop(Arc::clone(event), target, hops).await;
                    (rule.name.clone(), target.target.id.clone(), outcome)
                })
            });

            for (rule, target_id, outcome) in join_all(sends).await {
                match outcome {
                    Ok(delivery) => receipt.deliveries.push(DeliveryRecord {
                        rule,
                        target_id,
                        delivery,
                    }),
                    Err(error) => {
                        tracing::warn!(
                            bus = %bus.name(),
                            rule = %rule,
                            target_id = %target_id,
                            event_id = %event.id,
                            error = %error,
                            "Forward failed, event dropped at this hop"
                        );
                        receipt.failures.push(FailedDelivery {
                            rule,
                            target_id,
                            error,
                        });
                    }
                }
            }

            receipt
        })
    }

    fn forward_hop<'a>(
        &'a self,
        event: Arc<Event>,
        target: &'a ResolvedTarget,
        hops: usize,
    ) -> BoxFuture<'a, std::result::Result<Delivery, RoutingError>> {
        Box::pin(async move {
            if let Capability::Denied { reason } = &target.capability {
                return Err(RoutingError::PermissionDenied {
                    target: target.target.id.clone(),
                    reason: reason.clone(),
                });
            }

            match &target.target.kind {
                TargetKind::Bus(name) => {
                    if hops >= self.inner.max_hops {
                        return Err(RoutingError::HopLimitExceeded {
                            event_id: event.id.clone(),
                            limit: self.inner.max_hops,
                        });
                    }
                    let bus = self.bus(name).ok_or_else(|| RoutingError::TargetNotFound {
                        kind: "bus",
                        name: name.clone(),
                    })?;
                    let receipt = self.publish_on(bus, event, hops + 1).await;
                    Ok(Delivery::Bus(receipt))
                }
                TargetKind::Queue(name) => {
                    let queue = self.queue(name).ok_or_else(|| RoutingError::TargetNotFound {
                        kind: "queue",
                        name: name.clone(),
                    })?;
                    let message_id = queue.enqueue(Event::clone(&event)).await.map_err(|e| {
                        RoutingError::QueueUnavailable {
                            queue: name.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                    Ok(Delivery::Queue {
                        queue: name.clone(),
                        message_id,
                    })
                }
            }
        })
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("buses", &self.bus_names())
            .field("queues", &self.queue_names())
            .field("max_hops", &self.inner.max_hops)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{Role, PUT_EVENTS};
    use crate::pattern::EventPattern;
    use crate::queue::QueueOptions;

    fn router(buses: &[&str], queues: &[&str], roles: Vec<Role>, max_hops: usize) -> Router {
        Router::new(
            buses.iter().map(|b| Arc::new(EventBus::new(*b))),
            queues
                .iter()
                .map(|q| Arc::new(DurableQueue::new(*q, QueueOptions::default()))),
            AccessPolicy::new(roles),
            max_hops,
        )
    }

    fn event() -> Event {
        Event::new("custom.stripe.test", "test", serde_json::json!({"id": 1}))
    }

    #[tokio::test]
    async fn test_publish_unknown_bus() {
        let router = router(&["A"], &[], vec![], DEFAULT_MAX_HOPS);
        let err = router.publish("Nope", event()).await.unwrap_err();
        assert!(matches!(
            err,
            FabricError::Routing(RoutingError::TargetNotFound { kind: "bus", .. })
        ));
    }

    #[tokio::test]
    async fn test_no_match_dropped_silently() {
        let router = router(&["A"], &["Q"], vec![], DEFAULT_MAX_HOPS);
        router
            .attach_rule(
                "A",
                Rule::new("r", EventPattern::source_in(["other"])).target(Target::queue("t", "Q")),
            )
            .unwrap();

        let receipt = router.publish("A", event()).await.unwrap();
        assert!(receipt.is_dropped());
        assert!(receipt.failures.is_empty());
        assert!(router.queue("Q").unwrap().is_empty().await);
    }

    #[tokio::test]
    async fn test_chain_preserves_event() {
        let names: Vec<String> = (0..5).map(|i| format!("Bus{}", i)).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let router = router(&name_refs, &["Q"], vec![], DEFAULT_MAX_HOPS);

        for pair in names.windows(2) {
            router
                .attach_rule(
                    &pair[0],
                    Rule::new("next", EventPattern::new()).target(Target::bus("t", &pair[1])),
                )
                .unwrap();
        }
        router
            .attach_rule(
                "Bus4",
                Rule::new("sink", EventPattern::new()).target(Target::queue("t", "Q")),
            )
            .unwrap();

        let original = event();
        let receipt = router.publish("Bus0", original.clone()).await.unwrap();
        assert_eq!(receipt.buses_reached(), vec!["Bus1", "Bus2", "Bus3", "Bus4"]);

        let batch = router.queue("Q").unwrap().dequeue_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event, original);
    }

    #[tokio::test]
    async fn test_hop_limit_stops_cycles() {
        let router = router(&["A", "B"], &[], vec![], 4);
        router
            .attach_rule("A", Rule::new("ab", EventPattern::new()).target(Target::bus("t", "B")))
            .unwrap();
        router
            .attach_rule("B", Rule::new("ba", EventPattern::new()).target(Target::bus("t", "A")))
            .unwrap();

        let receipt = router.publish("A", event()).await.unwrap();
        let failures = receipt.all_failures();
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            failures[0].error,
            RoutingError::HopLimitExceeded { limit: 4, .. }
        ));
        assert_eq!(receipt.buses_reached().len(), 4);
    }

    #[tokio::test]
    async fn test_missing_target_reported() {
        let router = router(&["A"], &[], vec![], DEFAULT_MAX_HOPS);
        router
            .attach_rule(
                "A",
                Rule::new("r", EventPattern::new()).target(Target::queue("missing", "Ghost")),
            )
            .unwrap();

        let receipt = router.publish("A", event()).await.unwrap();
        assert_eq!(receipt.failures.len(), 1);
        assert_eq!(
            receipt.failures[0].error,
            RoutingError::TargetNotFound {
                kind: "queue",
                name: "Ghost".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_permission_denied_but_other_targets_deliver() {
        let router = router(
            &["A", "B"],
            &["Q"],
            vec![Role::new("put-b").allow(PUT_EVENTS, "B")],
            DEFAULT_MAX_HOPS,
        );
        router
            .attach_rule(
                "A",
                Rule::new("r", EventPattern::new())
                    .target(Target::queue("denied", "Q").with_role("put-b"))
                    .target(Target::bus("allowed", "B").with_role("put-b")),
            )
            .unwrap();

        let receipt = router.publish("A", event()).await.unwrap();
        assert_eq!(receipt.deliveries.len(), 1);
        assert_eq!(receipt.deliveries[0].target_id, "allowed");
        assert_eq!(receipt.failures.len(), 1);
        assert!(matches!(
            receipt.failures[0].error,
            RoutingError::PermissionDenied { .. }
        ));
        assert!(router.queue("Q").unwrap().is_empty().await);
    }

    #[tokio::test]
    async fn test_forward_direct() {
        let router = router(&[], &["Q"], vec![], DEFAULT_MAX_HOPS);
        let target = router.resolve(Target::queue("t", "Q"));
        let event = Arc::new(event());

        let delivery = router.forward(event.clone(), &target).await.unwrap();
        match delivery {
            Delivery::Queue { queue, .. } => assert_eq!(queue, "Q"),
            other => panic!("unexpected delivery {:?}", other),
        }
        let batch = router.queue("Q").unwrap().dequeue_batch(1).await.unwrap();
        assert_eq!(batch[0].event.id, event.id);
    }

    #[tokio::test]
    async fn test_detach_rule_stops_routing() {
        let router = router(&["A"], &["Q"], vec![], DEFAULT_MAX_HOPS);
        let handle = router
            .attach_rule("A", Rule::new("r", EventPattern::new()).target(Target::queue("t", "Q")))
            .unwrap();

        assert!(router.detach_rule(&handle));
        assert!(!router.detach_rule(&handle));

        let receipt = router.publish("A", event()).await.unwrap();
        assert!(receipt.is_dropped());
    }

    #[tokio::test]
    async fn test_attach_to_unknown_bus() {
        let router = router(&["A"], &["Q"], vec![], DEFAULT_MAX_HOPS);
        let result = router.attach_rule(
            "Nope",
            Rule::new("r", EventPattern::new()).target(Target::queue("t", "Q")),
        );
        assert!(matches!(result, Err(FabricError::NotFound(_))));
    }
}
