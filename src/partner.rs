//! Partner event feed
//!
//! The partner bus already exists outside the fabric; it is identified by an
//! opaque reference supplied at startup, either an event-bus ARN
//! (`arn:aws:events:<region>:<account>:event-bus/<name>`) or a bare bus name.
//! Partner events carry the bus name as their `source`, e.g.
//! `aws.partner/stripe.com/ed_test_123`.

use crate::error::{FabricError, Result};
use crate::types::Event;

/// Source prefix shared by all Stripe partner events
pub const STRIPE_PARTNER_PREFIX: &str = "aws.partner/stripe.com";

/// Ingress for a partner's event bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartnerFeed {
    reference: String,
    bus_name: String,
}

impl PartnerFeed {
    /// Parse a partner-feed reference
    pub fn from_reference(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(FabricError::Config(
                "Partner event bus reference is not set".to_string(),
            ));
        }

        let bus_name = if reference.starts_with("arn:") {
            bus_name_from_arn(reference)?
        } else {
            reference.to_string()
        };

        Ok(Self {
            reference: reference.to_string(),
            bus_name,
        })
    }

    /// The reference as supplied
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Name of the partner bus inside the fabric
    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    /// Build a partner event stamped with this feed's source
    pub fn event(&self, detail_type: impl Into<String>, detail: serde_json::Value) -> Event {
        Event::new(self.bus_name.clone(), detail_type, detail)
    }
}

fn bus_name_from_arn(arn: &str) -> Result<String> {
    let invalid =
        |why: &str| FabricError::Config(format!("Invalid event bus ARN '{}': {}", arn, why));

    let parts: Vec<&str> = arn.splitn(6, ':').collect();
    if parts.len() != 6 {
        return Err(invalid("expected arn:partition:service:region:account:resource"));
    }
    if parts[2] != "events" {
        return Err(invalid("service must be 'events'"));
    }
    match parts[5].strip_prefix("event-bus/") {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(invalid("resource must be 'event-bus/<name>'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arn_reference() {
        let feed = PartnerFeed::from_reference(
            "arn:aws:events:us-east-1:123456789012:event-bus/aws.partner/stripe.com/ed_test_61",
        )
        .unwrap();
        assert_eq!(feed.bus_name(), "aws.partner/stripe.com/ed_test_61");
        assert!(feed.reference().starts_with("arn:aws:events"));
    }

    #[test]
    fn test_bare_name_reference() {
        let feed = PartnerFeed::from_reference("aws.partner/stripe.com/ed_test_61").unwrap();
        assert_eq!(feed.bus_name(), "aws.partner/stripe.com/ed_test_61");
    }

    #[test]
    fn test_missing_reference_is_config_error() {
        assert!(matches!(
            PartnerFeed::from_reference("  "),
            Err(FabricError::Config(_))
        ));
    }

    #[test]
    fn test_malformed_arns() {
        assert!(PartnerFeed::from_reference("arn:aws:events:us-east-1").is_err());
        assert!(PartnerFeed::from_reference("arn:aws:sqs:us-east-1:1:event-bus/x").is_err());
        assert!(PartnerFeed::from_reference("arn:aws:events:us-east-1:1:rule/x").is_err());
        assert!(PartnerFeed::from_reference("arn:aws:events:us-east-1:1:event-bus/").is_err());
    }

    #[test]
    fn test_partner_event_source() {
        let feed = PartnerFeed::from_reference("aws.partner/stripe.com/ed_test_61").unwrap();
        let event = feed.event("charge.created", serde_json::json!({"id": "ch_1"}));
        assert!(event.source.starts_with(STRIPE_PARTNER_PREFIX));
        assert_eq!(event.detail_type, "charge.created");
    }
}
