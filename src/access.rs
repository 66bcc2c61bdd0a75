//! Access policy — roles, statements and resolved capabilities
//!
//! A target may name a role. When a rule is attached, each target's role is
//! resolved once against the fabric's policy into a `Capability`; the router
//! only ever checks the resolved capability.

use crate::rule::{Target, TargetKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Action required to publish onto a bus
pub const PUT_EVENTS: &str = "events:PutEvents";

/// Action required to enqueue onto a queue
pub const SEND_MESSAGE: &str = "sqs:SendMessage";

/// A single allow statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatement {
    /// Allowed actions (`events:PutEvents`, `sqs:*`, `*`)
    pub actions: Vec<String>,

    /// Bus or queue names the actions apply to (`*` for any)
    pub resources: Vec<String>,
}

impl PolicyStatement {
    pub fn new(action: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            actions: vec![action.into()],
            resources: vec![resource.into()],
        }
    }

    fn allows(&self, action: &str, resource: &str) -> bool {
        let action_ok = self.actions.iter().any(|a| {
            a == "*"
                || a == action
                || a.strip_suffix(":*")
                    .is_some_and(|service| action.split(':').next() == Some(service))
        });
        action_ok && self.resources.iter().any(|r| r == "*" || r == resource)
    }
}

/// A named role holding allow statements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub name: String,

    #[serde(default)]
    pub statements: Vec<PolicyStatement>,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            statements: Vec::new(),
        }
    }

    pub fn allow(mut self, action: impl Into<String>, resource: impl Into<String>) -> Self {
        self.statements.push(PolicyStatement::new(action, resource));
        self
    }
}

/// Resolved authorization for one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// Forwarding is allowed; `principal` is the role name, or `owner` for
    /// targets without a role
    Granted { principal: String },

    /// Every forward through this target fails with `PermissionDenied`
    Denied { reason: String },
}

impl Capability {
    pub fn is_granted(&self) -> bool {
        matches!(self, Capability::Granted { .. })
    }
}

/// All roles known to the fabric
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    roles: HashMap<String, Role>,
}

impl AccessPolicy {
    pub fn new(roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            roles: roles.into_iter().map(|r| (r.name.clone(), r)).collect(),
        }
    }

    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.get(name)
    }

    /// Resolve the capability for a target
    ///
    /// Targets without a role act with the owner's implicit grant.
    pub fn resolve(&self, target: &Target) -> Capability {
        let Some(role_name) = target.role.as_deref() else {
            return Capability::Granted {
                principal: "owner".to_string(),
            };
        };

        let Some(role) = self.roles.get(role_name) else {
            return Capability::Denied {
                reason: format!("role '{}' does not exist", role_name),
            };
        };

        let action = required_action(&target.kind);
        let resource = target.kind.name();
        if role.statements.iter().any(|s| s.allows(action, resource)) {
            Capability::Granted {
                principal: role.name.clone(),
            }
        } else {
            Capability::Denied {
                reason: format!(
                    "role '{}' is not allowed {} on '{}'",
                    role.name, action, resource
                ),
            }
        }
    }
}

/// The action a target kind requires
pub fn required_action(kind: &TargetKind) -> &'static str {
    match kind {
        TargetKind::Bus(_) => PUT_EVENTS,
        TargetKind::Queue(_) => SEND_MESSAGE,
    }
}
