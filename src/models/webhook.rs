//! Webhook Subscription Model

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::EventKind;

/// A registered outbound webhook
#[derive(Debug, Clone, Serialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub url: String,
    /// Kind names, or `"*"` for everything
    pub events: Vec<String>,
    pub active: bool,
    pub created_at: i64,
}

impl WebhookSubscription {
    /// Whether this subscription wants the given kind
    pub fn wants(&self, kind: EventKind) -> bool {
        self.active
            && self
                .events
                .iter()
                .any(|e| e == "*" || e == &kind.to_string())
    }
}

/// Validate an event list against the closed kind set
pub fn validate_event_list(events: &[String]) -> Result<(), String> {
    if events.is_empty() {
        return Err("events must not be empty".to_string());
    }
    for name in events {
        if name != "*" && name.parse::<EventKind>().is_err() {
            return Err(format!("unknown event kind: {}", name));
        }
    }
    Ok(())
}

// ============================================================================
// API shapes
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CreateWebhookRequest {
    pub url: String,
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatchWebhookRequest {
    pub url: Option<String>,
    pub events: Option<Vec<String>>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestWebhookRequest {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishEventRequest {
    pub event_type: String,
    pub event_data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(events: &[&str], active: bool) -> WebhookSubscription {
        WebhookSubscription {
            id: Uuid::new_v4(),
            url: "http://localhost/hook".to_string(),
            events: events.iter().map(|s| s.to_string()).collect(),
            active,
            created_at: 0,
        }
    }

    #[test]
    fn test_wants_exact_kind() {
        let sub = subscription(&["ORDER_EXECUTED"], true);
        assert!(sub.wants(EventKind::OrderExecuted));
        assert!(!sub.wants(EventKind::PriceUpdate));
    }

    #[test]
    fn test_wildcard_wants_everything() {
        let sub = subscription(&["*"], true);
        for kind in EventKind::ALL {
            assert!(sub.wants(kind));
        }
    }

    #[test]
    fn test_inactive_wants_nothing() {
        let sub = subscription(&["*"], false);
        assert!(!sub.wants(EventKind::OrderExecuted));
    }

    #[test]
    fn test_validate_event_list() {
        assert!(validate_event_list(&["ORDER_PLACED".to_string()]).is_ok());
        assert!(validate_event_list(&["*".to_string()]).is_ok());
        assert!(validate_event_list(&[]).is_err());
        assert!(validate_event_list(&["NOT_A_KIND".to_string()]).is_err());
    }
}
