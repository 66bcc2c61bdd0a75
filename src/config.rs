//! Fabric configuration
//!
//! Loaded from a camelCase JSON file, or built from the partner bus reference
//! in `STRIPE_PARTNER_EVENT_BUS_ARN` for the standard partner topology:
//!
//! ```text
//! partner bus ──(source prefix aws.partner/stripe.com)──┐
//!                                                       ▼
//! InternalEventBus ──(source custom.stripe.test)──▶ ProcessingEventBus
//!                                                       │ (either source)
//!                                                       ▼
//!                                               StripeEventQueue ──▶ handler
//! ```

use crate::access::{Role, PUT_EVENTS, SEND_MESSAGE};
use crate::dispatcher::DispatcherOptions;
use crate::error::{FabricError, Result};
use crate::partner::{PartnerFeed, STRIPE_PARTNER_PREFIX};
use crate::pattern::EventPattern;
use crate::queue::{QueueOptions, DEFAULT_VISIBILITY_TIMEOUT, MAX_VISIBILITY_TIMEOUT};
use crate::router::DEFAULT_MAX_HOPS;
use crate::rule::{Rule, Target};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the partner bus reference
pub const PARTNER_BUS_ENV: &str = "STRIPE_PARTNER_EVENT_BUS_ARN";

/// Stands for the partner bus in rule and target `bus` fields
pub const PARTNER_BUS_ALIAS: &str = "$partner";

pub const INTERNAL_BUS: &str = "InternalEventBus";
pub const PROCESSING_BUS: &str = "ProcessingEventBus";
pub const STRIPE_EVENT_QUEUE: &str = "StripeEventQueue";

/// Source used by internally generated test events
pub const CUSTOM_TEST_SOURCE: &str = "custom.stripe.test";

/// Top-level fabric configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FabricConfig {
    /// Partner bus reference (event-bus ARN or bus name); required
    #[serde(default)]
    pub partner_event_bus: String,

    /// Buses owned by the fabric (the partner bus is implicit)
    #[serde(default)]
    pub buses: Vec<BusConfig>,

    #[serde(default)]
    pub queues: Vec<QueueConfig>,

    #[serde(default)]
    pub roles: Vec<Role>,

    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatcher: Option<DispatcherConfig>,

    #[serde(default = "default_max_hops")]
    pub max_hops: usize,

    /// Directory for queue snapshots; queues are memory-only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

fn default_max_hops() -> usize {
    DEFAULT_MAX_HOPS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    pub name: String,

    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Dead-letter after repeated receives; unbounded redelivery when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redrive: Option<RedriveConfig>,
}

fn default_visibility_timeout_secs() -> u64 {
    DEFAULT_VISIBILITY_TIMEOUT.as_secs()
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            redrive: None,
        }
    }

    pub fn options(&self) -> QueueOptions {
        QueueOptions {
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            ..QueueOptions::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedriveConfig {
    pub max_receive_count: u32,

    /// Queue receiving dead letters; kept in memory when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_queue: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfig {
    pub name: String,

    /// Bus the rule is attached to (`$partner` for the partner bus)
    pub bus: String,

    pub pattern: EventPattern,

    pub targets: Vec<TargetConfig>,
}

impl RuleConfig {
    /// Name of the bus this rule attaches to
    pub fn bus_name<'a>(&'a self, partner_bus: &'a str) -> &'a str {
        resolve_alias(&self.bus, partner_bus)
    }

    pub fn to_rule(&self, partner_bus: &str) -> Result<Rule> {
        let mut rule = Rule::new(self.name.clone(), self.pattern.clone());
        for target in &self.targets {
            rule = rule.target(target.to_target(&self.name, partner_bus)?);
        }
        rule.validate()?;
        Ok(rule)
    }
}

/// A rule target; exactly one of `bus` and `queue` must be set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl TargetConfig {
    pub fn bus(id: impl Into<String>, bus: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bus: Some(bus.into()),
            queue: None,
            role: None,
        }
    }

    pub fn queue(id: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bus: None,
            queue: Some(queue.into()),
            role: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    fn to_target(&self, rule: &str, partner_bus: &str) -> Result<Target> {
        let target = match (&self.bus, &self.queue) {
            (Some(bus), None) => Target::bus(self.id.clone(), resolve_alias(bus, partner_bus)),
            (None, Some(queue)) => Target::queue(self.id.clone(), queue.clone()),
            _ => {
                return Err(FabricError::Config(format!(
                    "Target '{}' of rule '{}' must name exactly one of bus or queue",
                    self.id, rule
                )))
            }
        };
        Ok(match &self.role {
            Some(role) => target.with_role(role.clone()),
            None => target,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherConfig {
    /// Queue the handler consumes
    pub queue: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_poll_wait_ms")]
    pub poll_wait_ms: u64,

    /// Defaults to the queue's visibility timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_timeout_secs: Option<u64>,
}

fn default_batch_size() -> usize {
    10
}

fn default_workers() -> usize {
    1
}

fn default_poll_wait_ms() -> u64 {
    1000
}

impl DispatcherConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            batch_size: default_batch_size(),
            workers: default_workers(),
            poll_wait_ms: default_poll_wait_ms(),
            handler_timeout_secs: None,
        }
    }

    pub fn options(&self) -> DispatcherOptions {
        DispatcherOptions {
            batch_size: self.batch_size,
            workers: self.workers,
            poll_wait: Duration::from_millis(self.poll_wait_ms),
            handler_timeout: self.handler_timeout_secs.map(Duration::from_secs),
        }
    }
}

fn resolve_alias<'a>(bus: &'a str, partner_bus: &'a str) -> &'a str {
    if bus == PARTNER_BUS_ALIAS {
        partner_bus
    } else {
        bus
    }
}

impl FabricConfig {
    /// Load and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            FabricError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            FabricError::Config(format!("Failed to parse config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        tracing::info!(path = %path.display(), rules = config.rules.len(), "Configuration loaded");
        Ok(config)
    }

    /// Standard partner topology from `STRIPE_PARTNER_EVENT_BUS_ARN`
    pub fn from_env() -> Result<Self> {
        Self::from_env_var(PARTNER_BUS_ENV)
    }

    /// Standard partner topology from the reference held in `var`
    pub fn from_env_var(var: &str) -> Result<Self> {
        let reference = std::env::var(var)
            .map_err(|_| FabricError::Config(format!("{} is not set", var)))?;
        let config = Self::partner_topology(reference);
        config.validate()?;
        Ok(config)
    }

    /// The standard partner topology for the given partner bus reference
    pub fn partner_topology(reference: impl Into<String>) -> Self {
        let to_processing_role = "EventBridgeToProcessingBusRole";
        let to_queue_role = "EventBridgeToSqsRole";

        Self {
            partner_event_bus: reference.into(),
            buses: vec![
                BusConfig {
                    name: INTERNAL_BUS.to_string(),
                },
                BusConfig {
                    name: PROCESSING_BUS.to_string(),
                },
            ],
            queues: vec![QueueConfig::new(STRIPE_EVENT_QUEUE)],
            roles: vec![
                Role::new(to_processing_role).allow(PUT_EVENTS, PROCESSING_BUS),
                Role::new(to_queue_role).allow(SEND_MESSAGE, STRIPE_EVENT_QUEUE),
            ],
            rules: vec![
                RuleConfig {
                    name: "StripePartnerToProcessingBusRule".to_string(),
                    bus: PARTNER_BUS_ALIAS.to_string(),
                    pattern: EventPattern::source_prefix(STRIPE_PARTNER_PREFIX),
                    targets: vec![TargetConfig::bus("ForwardToProcessingBus", PROCESSING_BUS)
                        .with_role(to_processing_role)],
                },
                RuleConfig {
                    name: "InternalToProcessingBusRule".to_string(),
                    bus: INTERNAL_BUS.to_string(),
                    pattern: EventPattern::source_in([CUSTOM_TEST_SOURCE]),
                    targets: vec![TargetConfig::bus("Target0", PROCESSING_BUS)],
                },
                RuleConfig {
                    name: "ProcessingBusToSqsCustomRule".to_string(),
                    bus: PROCESSING_BUS.to_string(),
                    pattern: EventPattern::source_in([CUSTOM_TEST_SOURCE]),
                    targets: vec![TargetConfig::queue("Target0", STRIPE_EVENT_QUEUE)],
                },
                RuleConfig {
                    name: "ProcessingBusToSqsStripeRule".to_string(),
                    bus: PROCESSING_BUS.to_string(),
                    pattern: EventPattern::source_prefix(STRIPE_PARTNER_PREFIX),
                    targets: vec![TargetConfig::queue("ForwardToStripeQueue", STRIPE_EVENT_QUEUE)
                        .with_role(to_queue_role)],
                },
            ],
            dispatcher: Some(DispatcherConfig::new(STRIPE_EVENT_QUEUE)),
            max_hops: DEFAULT_MAX_HOPS,
            state_dir: None,
        }
    }

    /// Parse the partner bus reference
    pub fn partner_feed(&self) -> Result<PartnerFeed> {
        PartnerFeed::from_reference(&self.partner_event_bus)
    }

    pub fn queue_config(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// Check the configuration for startup errors
    ///
    /// Rule targets naming buses or queues that do not exist are accepted
    /// here; forwarding to them fails with `TargetNotFound`.
    pub fn validate(&self) -> Result<()> {
        let partner = self.partner_feed()?;
        let partner_bus = partner.bus_name();

        if self.max_hops == 0 {
            return Err(FabricError::Config("maxHops must be at least 1".to_string()));
        }

        let mut buses: HashSet<&str> = HashSet::from([partner_bus]);
        for bus in &self.buses {
            if bus.name.is_empty() || bus.name == PARTNER_BUS_ALIAS {
                return Err(FabricError::Config(format!(
                    "Invalid bus name '{}'",
                    bus.name
                )));
            }
            if !buses.insert(bus.name.as_str()) {
                return Err(FabricError::Config(format!(
                    "Duplicate bus name '{}'",
                    bus.name
                )));
            }
        }

        let mut queues = HashSet::new();
        for queue in &self.queues {
            if queue.name.is_empty() {
                return Err(FabricError::Config("Queue name cannot be empty".to_string()));
            }
            if !queues.insert(queue.name.as_str()) {
                return Err(FabricError::Config(format!(
                    "Duplicate queue name '{}'",
                    queue.name
                )));
            }
            if queue.visibility_timeout_secs > MAX_VISIBILITY_TIMEOUT.as_secs() {
                return Err(FabricError::Config(format!(
                    "Queue '{}': visibilityTimeoutSecs must be at most {}",
                    queue.name,
                    MAX_VISIBILITY_TIMEOUT.as_secs()
                )));
            }
        }
        for queue in &self.queues {
            self.validate_redrive(queue)?;
        }

        let mut roles = HashSet::new();
        for role in &self.roles {
            if !roles.insert(role.name.as_str()) {
                return Err(FabricError::Config(format!(
                    "Duplicate role name '{}'",
                    role.name
                )));
            }
        }

        let mut rules = HashSet::new();
        for rule in &self.rules {
            let bus = rule.bus_name(partner_bus);
            if !buses.contains(bus) {
                return Err(FabricError::Config(format!(
                    "Rule '{}' is attached to unknown bus '{}'",
                    rule.name, rule.bus
                )));
            }
            if !rules.insert((bus, rule.name.as_str())) {
                return Err(FabricError::Config(format!(
                    "Duplicate rule '{}' on bus '{}'",
                    rule.name, bus
                )));
            }
            rule.to_rule(partner_bus)?;
        }

        if let Some(dispatcher) = &self.dispatcher {
            if !queues.contains(dispatcher.queue.as_str()) {
                return Err(FabricError::Config(format!(
                    "Dispatcher consumes unknown queue '{}'",
                    dispatcher.queue
                )));
            }
            if dispatcher.batch_size == 0 {
                return Err(FabricError::Config("batchSize must be at least 1".to_string()));
            }
            if dispatcher.workers == 0 {
                return Err(FabricError::Config("workers must be at least 1".to_string()));
            }
        }

        Ok(())
    }

    fn validate_redrive(&self, queue: &QueueConfig) -> Result<()> {
        let Some(redrive) = &queue.redrive else {
            return Ok(());
        };
        if redrive.max_receive_count == 0 {
            return Err(FabricError::Config(format!(
                "Queue '{}' redrive maxReceiveCount must be at least 1",
                queue.name
            )));
        }
        let Some(dlq) = &redrive.dead_letter_queue else {
            return Ok(());
        };
        if *dlq == queue.name {
            return Err(FabricError::Config(format!(
                "Queue '{}' cannot dead-letter into itself",
                queue.name
            )));
        }
        match self.queue_config(dlq) {
            None => Err(FabricError::Config(format!(
                "Queue '{}' dead-letters into unknown queue '{}'",
                queue.name, dlq
            ))),
            Some(target) if target.redrive.is_some() => Err(FabricError::Config(format!(
                "Dead-letter queue '{}' cannot have its own redrive policy",
                dlq
            ))),
            Some(_) => Ok(()),
        }
    }
}
