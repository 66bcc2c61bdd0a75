//! Event buses
//!
//! A bus is a named rule holder. It never stores events: publishing evaluates
//! every attached rule and the router forwards to the targets of each match.
//! Events that match nothing are dropped.

use crate::error::{FabricError, Result};
use crate::rule::{AttachedRule, RuleHandle};
use crate::types::Event;
use std::sync::{Arc, RwLock};

/// A named event bus
#[derive(Debug)]
pub struct EventBus {
    name: String,

    /// Attached rules, in attach order
    rules: RwLock<Vec<Arc<AttachedRule>>>,
}

impl EventBus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach a rule; rule names are unique per bus
    pub(crate) fn attach(&self, rule: AttachedRule) -> Result<RuleHandle> {
        let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
        if rules.iter().any(|r| r.name == rule.name) {
            return Err(FabricError::Config(format!(
                "Rule '{}' already attached to bus '{}'",
                rule.name, self.name
            )));
        }

        let handle = RuleHandle {
            bus: self.name.clone(),
            rule: rule.name.clone(),
        };
        tracing::info!(
            bus = %self.name,
            rule = %rule.name,
            targets = rule.targets.len(),
            "Rule attached"
        );
        rules.push(Arc::new(rule));
        Ok(handle)
    }

    /// Detach a rule by name, returning whether it was attached
    pub(crate) fn detach(&self, rule: &str) -> bool {
        let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
        let before = rules.len();
        rules.retain(|r| r.name != rule);
        let removed = rules.len() != before;
        if removed {
            tracing::info!(bus = %self.name, rule, "Rule detached");
        }
        removed
    }

    /// Names of the attached rules
    pub fn rule_names(&self) -> Vec<String> {
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
        rules.iter().map(|r| r.name.clone()).collect()
    }

    /// Get an attached rule by name
    pub fn rule(&self, name: &str) -> Option<Arc<AttachedRule>> {
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
        rules.iter().find(|r| r.name == name).cloned()
    }

    /// Every attached rule whose pattern matches the event
    pub fn matching_rules(&self, event: &Event) -> Vec<Arc<AttachedRule>> {
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
        rules
            .iter()
            .filter(|r| r.pattern.matches(event))
            .cloned()
            .collect()
    }
}
