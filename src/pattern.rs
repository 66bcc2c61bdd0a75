//! Event patterns — the rule matcher
//!
//! A pattern maps field names to predicate lists. An event matches when every
//! field in the pattern has at least one satisfied predicate (AND across
//! fields, OR within a field). Predicates are exact-string based.
//!
//! Patterns use the EventBridge JSON shape:
//!
//! ```json
//! {"source": ["custom.stripe.test"]}
//! {"source": [{"prefix": "aws.partner/stripe.com"}]}
//! {"detail": {"type": ["charge.created"]}}
//! ```
//!
//! Nested objects flatten into dotted field names (`detail.type`).

use crate::error::{FabricError, Result};
use crate::types::Event;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// A single predicate over one field value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Value equals the string
    Exact(String),
    /// Value starts with the string
    Prefix(String),
}

impl Predicate {
    pub fn exact(value: impl Into<String>) -> Self {
        Predicate::Exact(value.into())
    }

    pub fn prefix(value: impl Into<String>) -> Self {
        Predicate::Prefix(value.into())
    }

    /// Test a single field value
    pub fn test(&self, value: &str) -> bool {
        match self {
            Predicate::Exact(expected) => value == expected,
            Predicate::Prefix(prefix) => value.starts_with(prefix.as_str()),
        }
    }

    fn parse(field: &str, value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(Predicate::Exact(s.clone())),
            Value::Number(n) => Ok(Predicate::Exact(n.to_string())),
            Value::Bool(b) => Ok(Predicate::Exact(b.to_string())),
            Value::Object(op) => match op.get("prefix") {
                Some(Value::String(prefix)) if op.len() == 1 => {
                    Ok(Predicate::Prefix(prefix.clone()))
                }
                Some(_) if op.len() == 1 => Err(FabricError::Config(format!(
                    "Pattern field '{}': prefix operand must be a string",
                    field
                ))),
                _ => Err(FabricError::Config(format!(
                    "Pattern field '{}': unsupported operator {:?}",
                    field,
                    op.keys().collect::<Vec<_>>()
                ))),
            },
            other => Err(FabricError::Config(format!(
                "Pattern field '{}': unsupported predicate {}",
                field, other
            ))),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Predicate::Exact(s) => Value::String(s.clone()),
            Predicate::Prefix(p) => serde_json::json!({ "prefix": p }),
        }
    }
}

/// Declarative predicate over event fields
///
/// The empty pattern matches every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct EventPattern {
    fields: BTreeMap<String, Vec<Predicate>>,
}

impl EventPattern {
    /// Create an empty (match-all) pattern
    pub fn new() -> Self {
        Self::default()
    }

    /// Match events whose source is one of the given strings
    pub fn source_in<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new().with_field("source", sources.into_iter().map(Predicate::exact))
    }

    /// Match events whose source starts with the given prefix
    pub fn source_prefix(prefix: impl Into<String>) -> Self {
        Self::new().with_field("source", [Predicate::prefix(prefix)])
    }

    /// Add predicates for a field (OR-ed with any already present)
    pub fn with_field(
        mut self,
        field: impl Into<String>,
        predicates: impl IntoIterator<Item = Predicate>,
    ) -> Self {
        self.fields
            .entry(field.into())
            .or_default()
            .extend(predicates);
        self
    }

    /// Iterate over (field, predicates)
    pub fn fields(&self) -> impl Iterator<Item = (&str, &[Predicate])> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Reject fields that can never match
    pub fn validate(&self) -> Result<()> {
        for (field, predicates) in &self.fields {
            if field.is_empty() {
                return Err(FabricError::Config(
                    "Pattern field name cannot be empty".to_string(),
                ));
            }
            if predicates.is_empty() {
                return Err(FabricError::Config(format!(
                    "Pattern field '{}' has no predicates",
                    field
                )));
            }
        }
        Ok(())
    }

    /// Evaluate the pattern against an event
    pub fn matches(&self, event: &Event) -> bool {
        self.fields.iter().all(|(field, predicates)| {
            field_values(event, field)
                .iter()
                .any(|value| predicates.iter().any(|p| p.test(value)))
        })
    }

    /// Parse an EventBridge-style JSON pattern
    pub fn from_json(value: &Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(FabricError::Config(
                "Event pattern must be a JSON object".to_string(),
            ));
        };

        let mut pattern = Self::new();
        collect_fields(None, map, &mut pattern.fields)?;
        pattern.validate()?;
        Ok(pattern)
    }

    /// Render as an EventBridge-style JSON pattern
    pub fn to_json(&self) -> Value {
        let mut root = Map::new();
        for (field, predicates) in &self.fields {
            let leaf = Value::Array(predicates.iter().map(Predicate::to_json).collect());
            insert_path(&mut root, field, leaf);
        }
        Value::Object(root)
    }
}

/// Evaluate `pattern` against `event`
pub fn matches(event: &Event, pattern: &EventPattern) -> bool {
    pattern.matches(event)
}

impl TryFrom<Value> for EventPattern {
    type Error = FabricError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_json(&value)
    }
}

impl From<EventPattern> for Value {
    fn from(pattern: EventPattern) -> Self {
        pattern.to_json()
    }
}

fn collect_fields(
    prefix: Option<&str>,
    map: &Map<String, Value>,
    out: &mut BTreeMap<String, Vec<Predicate>>,
) -> Result<()> {
    for (key, value) in map {
        let name = match prefix {
            Some(p) => format!("{}.{}", p, key),
            None => key.clone(),
        };
        match value {
            Value::Object(nested) => collect_fields(Some(&name), nested, out)?,
            Value::Array(items) => {
                if items.is_empty() {
                    return Err(FabricError::Config(format!(
                        "Pattern field '{}' has no predicates",
                        name
                    )));
                }
                let predicates = items
                    .iter()
                    .map(|item| Predicate::parse(&name, item))
                    .collect::<Result<Vec<_>>>()?;
                out.entry(name).or_default().extend(predicates);
            }
            _ => {
                return Err(FabricError::Config(format!(
                    "Pattern field '{}' must be an array or object",
                    name
                )))
            }
        }
    }
    Ok(())
}

fn insert_path(root: &mut Map<String, Value>, field: &str, leaf: Value) {
    match field.split_once('.') {
        None => {
            root.insert(field.to_string(), leaf);
        }
        Some((head, rest)) => {
            let child = root
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(child) = child {
                insert_path(child, rest, leaf);
            }
        }
    }
}

/// Resolve the candidate values of a field on an event
///
/// Absent fields resolve to no values and therefore never match.
fn field_values<'a>(event: &'a Event, field: &str) -> Vec<Cow<'a, str>> {
    match field {
        "source" => vec![Cow::Borrowed(event.source.as_str())],
        "detail-type" | "detailType" => vec![Cow::Borrowed(event.detail_type.as_str())],
        "id" => vec![Cow::Borrowed(event.id.as_str())],
        "resources" => event
            .resources
            .iter()
            .map(|r| Cow::Borrowed(r.as_str()))
            .collect(),
        _ => match field.strip_prefix("detail.") {
            Some(path) => lookup(&event.detail, path)
                .map(scalar_values)
                .unwrap_or_default(),
            None => Vec::new(),
        },
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
}

fn scalar_values(value: &Value) -> Vec<Cow<'_, str>> {
    match value {
        Value::String(s) => vec![Cow::Borrowed(s.as_str())],
        Value::Number(n) => vec![Cow::Owned(n.to_string())],
        Value::Bool(b) => vec![Cow::Owned(b.to_string())],
        Value::Array(items) => items
            .iter()
            .filter(|item| !item.is_array())
            .flat_map(scalar_values)
            .collect(),
        Value::Null | Value::Object(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(source: &str) -> Event {
        Event::new(source, "test", json!({}))
    }

    #[test]
    fn test_exact_list_match() {
        let pattern = EventPattern::source_in(["custom.stripe.test", "custom.other"]);

        assert!(matches(&event("custom.stripe.test"), &pattern));
        assert!(matches(&event("custom.other"), &pattern));
        assert!(!matches(&event("custom.stripe.test.extra"), &pattern));
        assert!(!matches(&event("custom.stripe"), &pattern));
        assert!(!matches(&event(""), &pattern));
    }

    #[test]
    fn test_prefix_match() {
        let pattern = EventPattern::source_prefix("aws.partner/stripe.com");

        assert!(matches(&event("aws.partner/stripe.com"), &pattern));
        assert!(matches(
            &event("aws.partner/stripe.com/ed_test_123/charge.created"),
            &pattern
        ));
        assert!(!matches(&event("aws.partner/stripe.co"), &pattern));
        assert!(!matches(&event("custom.aws.partner/stripe.com"), &pattern));
    }

    #[test]
    fn test_empty_pattern_matches_everything() {
        let pattern = EventPattern::new();
        assert!(pattern.is_empty());
        assert!(matches(&event("anything"), &pattern));
    }

    #[test]
    fn test_and_across_fields_or_within() {
        let pattern = EventPattern::source_prefix("aws.partner/stripe.com").with_field(
            "detail-type",
            [
                Predicate::exact("charge.created"),
                Predicate::prefix("invoice."),
            ],
        );

        let charge = Event::new("aws.partner/stripe.com/x", "charge.created", json!({}));
        let invoice = Event::new("aws.partner/stripe.com/x", "invoice.paid", json!({}));
        let refund = Event::new("aws.partner/stripe.com/x", "charge.refunded", json!({}));
        let internal = Event::new("custom.stripe.test", "charge.created", json!({}));

        assert!(pattern.matches(&charge));
        assert!(pattern.matches(&invoice));
        assert!(!pattern.matches(&refund));
        assert!(!pattern.matches(&internal));
    }

    #[test]
    fn test_detail_path_match() {
        let pattern = EventPattern::from_json(&json!({
            "detail": {"data": {"object": ["charge"]}, "livemode": [false]}
        }))
        .unwrap();

        let hit = Event::new(
            "s",
            "t",
            json!({"data": {"object": "charge"}, "livemode": false}),
        );
        let wrong_value = Event::new(
            "s",
            "t",
            json!({"data": {"object": "refund"}, "livemode": false}),
        );
        let missing = Event::new("s", "t", json!({"livemode": false}));

        assert!(pattern.matches(&hit));
        assert!(!pattern.matches(&wrong_value));
        assert!(!pattern.matches(&missing));
    }

    #[test]
    fn test_numeric_detail_match() {
        let pattern = EventPattern::from_json(&json!({"detail": {"id": [1, 2]}})).unwrap();

        assert!(pattern.matches(&Event::new("s", "t", json!({"id": 1}))));
        assert!(pattern.matches(&Event::new("s", "t", json!({"id": 2}))));
        assert!(!pattern.matches(&Event::new("s", "t", json!({"id": 3}))));
    }

    #[test]
    fn test_resources_any_element() {
        let pattern =
            EventPattern::new().with_field("resources", [Predicate::prefix("arn:aws:sqs")]);

        let hit = Event::new("s", "t", json!({}))
            .with_resource("arn:aws:events:bus")
            .with_resource("arn:aws:sqs:queue");
        let miss = Event::new("s", "t", json!({})).with_resource("arn:aws:events:bus");

        assert!(pattern.matches(&hit));
        assert!(!pattern.matches(&miss));
        assert!(!pattern.matches(&event("s")));
    }

    #[test]
    fn test_unknown_field_never_matches() {
        let pattern = EventPattern::new().with_field("region", [Predicate::exact("us-east-1")]);
        assert!(!pattern.matches(&event("s")));
    }

    #[test]
    fn test_from_json_partner_stack_patterns() {
        let exact = EventPattern::from_json(&json!({"source": ["custom.stripe.test"]})).unwrap();
        assert_eq!(exact, EventPattern::source_in(["custom.stripe.test"]));

        let prefix =
            EventPattern::from_json(&json!({"source": [{"prefix": "aws.partner/stripe.com"}]}))
                .unwrap();
        assert_eq!(prefix, EventPattern::source_prefix("aws.partner/stripe.com"));
    }

    #[test]
    fn test_from_json_rejects_malformed() {
        assert!(EventPattern::from_json(&json!(["source"])).is_err());
        assert!(EventPattern::from_json(&json!({"source": "custom"})).is_err());
        assert!(EventPattern::from_json(&json!({"source": []})).is_err());
        assert!(EventPattern::from_json(&json!({"source": [{"suffix": ".test"}]})).is_err());
        assert!(EventPattern::from_json(&json!({"source": [{"prefix": 5}]})).is_err());
        assert!(EventPattern::from_json(&json!({"source": [null]})).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_predicate_list() {
        let pattern = EventPattern::new().with_field("source", Vec::new());
        assert!(pattern.validate().is_err());
    }

    #[test]
    fn test_serde_uses_eventbridge_shape() {
        let pattern = EventPattern::source_prefix("aws.partner/stripe.com")
            .with_field("detail.type", [Predicate::exact("charge.created")]);

        let value = serde_json::to_value(&pattern).unwrap();
        assert_eq!(
            value,
            json!({
                "source": [{"prefix": "aws.partner/stripe.com"}],
                "detail": {"type": ["charge.created"]}
            })
        );

        let parsed: EventPattern = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, pattern);
    }
}
