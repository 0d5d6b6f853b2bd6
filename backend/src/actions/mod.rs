// Action Execution
//
// Server-side action handlers (webhook delivery, custom event tracking)
// with a shared exponential-backoff retry utility and a bounded-concurrency
// execution queue.

pub mod executor;
pub mod queue;
pub mod retry;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub use executor::{ActionExecutor, ActionResult};
pub use queue::ExecutionQueue;
pub use retry::{retry_with_backoff, RetryPolicy};

/// Server-side action kinds the engine can execute. Parsed from the node's
/// authored config; the tagged representation makes dispatch exhaustive at
/// compile time instead of string-matching on node titles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    Webhook(WebhookAction),
    TrackEvent(TrackEventAction),
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAction {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// User-authored JSON template, merged into the payload after
    /// placeholder substitution
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackEventAction {
    pub event_name: String,
    #[serde(default)]
    pub detail: serde_json::Value,
}

/// One action execution request, consumed exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionJob {
    pub workflow_id: Uuid,
    pub node_id: String,
    pub site_id: Uuid,
    pub visitor_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub identified_user: Option<serde_json::Value>,
    #[serde(default)]
    pub local_storage_data: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_kind_parses_tagged_config() {
        let config = serde_json::json!({
            "kind": "webhook",
            "url": "https://hooks.example.com/x",
            "method": "PUT",
            "headers": {"x-custom": "1"},
            "payload": {"plan": "{{user.plan}}"}
        });

        let action: ActionKind = serde_json::from_value(config).unwrap();
        match action {
            ActionKind::Webhook(webhook) => {
                assert_eq!(webhook.method, "PUT");
                assert_eq!(webhook.headers.get("x-custom").map(String::as_str), Some("1"));
            }
            other => panic!("expected webhook, got {:?}", other),
        }
    }

    #[test]
    fn webhook_method_defaults_to_post() {
        let action: ActionKind = serde_json::from_value(serde_json::json!({
            "kind": "webhook",
            "url": "https://hooks.example.com/x"
        }))
        .unwrap();

        match action {
            ActionKind::Webhook(webhook) => assert_eq!(webhook.method, "POST"),
            other => panic!("expected webhook, got {:?}", other),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let result: Result<ActionKind, _> = serde_json::from_value(serde_json::json!({
            "kind": "send_carrier_pigeon"
        }));
        assert!(result.is_err());
    }
}
