use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::db::{Booking, Conversation, Customer, Message};
use crate::models::rule::TriggerType;

/// What the caller knows when it raises a trigger: tenant plus whichever
/// entity IDs apply, and event details for status/tag triggers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerContext {
    pub tenant_id: Option<Uuid>,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub customer_id: Option<Uuid>,
    #[serde(default)]
    pub message_id: Option<Uuid>,
    #[serde(default)]
    pub booking_id: Option<Uuid>,
    #[serde(default)]
    pub escalation_id: Option<Uuid>,
    #[serde(default)]
    pub previous_status: Option<String>,
    #[serde(default)]
    pub new_status: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

/// Per-firing state shared read-only by every candidate rule of one pass.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub trigger: TriggerType,
    pub event: TriggerContext,
    pub customer: Option<Customer>,
    pub conversation: Option<Conversation>,
    pub message: Option<Message>,
    pub booking: Option<Booking>,
    pub variables: BTreeMap<String, String>,
    /// Entity snapshots plus the synthetic `time` object, keyed the way
    /// condition fields address them (`customer.country`, `time.hour`).
    pub facts: serde_json::Value,
    pub triggered_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(trigger: TriggerType, event: TriggerContext, triggered_at: DateTime<Utc>) -> Self {
        Self {
            trigger,
            event,
            customer: None,
            conversation: None,
            message: None,
            booking: None,
            variables: BTreeMap::new(),
            facts: serde_json::Value::Object(serde_json::Map::new()),
            triggered_at,
        }
    }

    pub fn tenant_id(&self) -> Option<Uuid> {
        self.event.tenant_id
    }

    pub fn conversation_id(&self) -> Option<Uuid> {
        self.event
            .conversation_id
            .or_else(|| self.conversation.as_ref().map(|c| c.id))
    }

    pub fn customer_id(&self) -> Option<Uuid> {
        self.event
            .customer_id
            .or_else(|| self.customer.as_ref().map(|c| c.id))
            .or_else(|| self.conversation.as_ref().map(|c| c.customer_id))
    }

    pub fn message_id(&self) -> Option<Uuid> {
        self.event
            .message_id
            .or_else(|| self.message.as_ref().map(|m| m.id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action_type: String,
    pub success: bool,
    #[serde(default)]
    pub skipped: bool,
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn ok(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            success: true,
            skipped: false,
            error: None,
        }
    }

    pub fn skipped(action_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            success: true,
            skipped: true,
            error: Some(reason.into()),
        }
    }

    pub fn failed(action_type: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            success: false,
            skipped: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub rule_name: String,
    pub tenant_id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub trigger_type: TriggerType,
    pub success: bool,
    pub actions_executed: i32,
    pub action_results: Vec<ActionOutcome>,
    pub duration_ms: i64,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}
