//! Rules and targets
//!
//! A rule pairs an `EventPattern` with one or more targets. Exact-list and
//! prefix rules are the same construct; only the pattern's predicates differ.

use crate::access::Capability;
use crate::error::{FabricError, Result};
use crate::pattern::EventPattern;
use serde::{Deserialize, Serialize};

/// Where a matching event is forwarded
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetKind {
    /// Re-publish on another bus
    Bus(String),
    /// Enqueue on a durable queue
    Queue(String),
}

impl TargetKind {
    /// Name of the bus or queue
    pub fn name(&self) -> &str {
        match self {
            TargetKind::Bus(name) | TargetKind::Queue(name) => name,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            TargetKind::Bus(_) => "bus",
            TargetKind::Queue(_) => "queue",
        }
    }
}

/// A rule target
///
/// Refers to its bus or queue by name; it does not own it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Target id, unique within its rule
    pub id: String,

    pub kind: TargetKind,

    /// Role assumed when forwarding; `None` uses the owner's implicit grant
    pub role: Option<String>,
}

impl Target {
    pub fn bus(id: impl Into<String>, bus: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TargetKind::Bus(bus.into()),
            role: None,
        }
    }

    pub fn queue(id: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TargetKind::Queue(queue.into()),
            role: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// A target together with the capability resolved for it
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub target: Target,
    pub capability: Capability,
}

/// A rule definition, before it is attached to a bus
#[derive(Debug, Clone)]
pub struct Rule {
    /// Rule name, unique within its bus
    pub name: String,

    pub pattern: EventPattern,

    pub targets: Vec<Target>,
}

impl Rule {
    pub fn new(name: impl Into<String>, pattern: EventPattern) -> Self {
        Self {
            name: name.into(),
            pattern,
            targets: Vec::new(),
        }
    }

    /// Add a target
    pub fn target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(FabricError::Config("Rule name cannot be empty".to_string()));
        }
        if self.targets.is_empty() {
            return Err(FabricError::Config(format!(
                "Rule '{}' has no targets",
                self.name
            )));
        }
        for (i, target) in self.targets.iter().enumerate() {
            if target.id.is_empty() {
                return Err(FabricError::Config(format!(
                    "Rule '{}' has a target with an empty id",
                    self.name
                )));
            }
            if self.targets[..i].iter().any(|t| t.id == target.id) {
                return Err(FabricError::Config(format!(
                    "Rule '{}' has duplicate target id '{}'",
                    self.name, target.id
                )));
            }
        }
        self.pattern.validate()
    }
}

/// A rule attached to a bus, with capabilities resolved
#[derive(Debug)]
pub struct AttachedRule {
    pub name: String,
    pub pattern: EventPattern,
    pub targets: Vec<ResolvedTarget>,
}

/// Identifies an attached rule
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleHandle {
    pub bus: String,
    pub rule: String,
}
