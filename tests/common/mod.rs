//! Shared fixtures: an `AppState` wired to in-memory adapters and seeded
//! clinic records.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

use clinic_automation::AppState;
use clinic_automation::clock::ManualClock;
use clinic_automation::config::EngineSettings;
use clinic_automation::mock::{MockLlm, MockWebhookSink};
use clinic_automation::models::db::{Conversation, ConversationStatus, Customer, Message};
use clinic_automation::models::rule::{
    ActionSpec, AutomationRule, ConditionGroup, TriggerConfig, TriggerType,
};
use clinic_automation::queue::MemoryJobQueue;
use clinic_automation::store::MemoryStore;

pub struct Harness {
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub llm: Arc<MockLlm>,
    pub webhooks: Arc<MockWebhookSink>,
    pub clock: Arc<ManualClock>,
    pub tenant_id: Uuid,
}

/// Saturday 15 March 2025, 10:00 in Seoul.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 15, 1, 0, 0).unwrap()
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(EngineSettings::default())
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        Self::build(
            MockLlm::failing("model offline"),
            MockWebhookSink::responding(200),
            settings,
        )
    }

    pub fn with_llm(llm: MockLlm) -> Self {
        Self::build(llm, MockWebhookSink::responding(200), EngineSettings::default())
    }

    pub fn with_webhooks(webhooks: MockWebhookSink) -> Self {
        Self::build(MockLlm::failing("model offline"), webhooks, EngineSettings::default())
    }

    fn build(llm: MockLlm, webhooks: MockWebhookSink, settings: EngineSettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let llm = Arc::new(llm);
        let webhooks = Arc::new(webhooks);
        let clock = Arc::new(ManualClock::new(start_time()));

        let state = Arc::new(AppState {
            store: store.clone(),
            queue: queue.clone(),
            llm: llm.clone(),
            webhooks: webhooks.clone(),
            clock: clock.clone(),
            settings,
        });

        Self {
            state,
            store,
            queue,
            llm,
            webhooks,
            clock,
            tenant_id: Uuid::new_v4(),
        }
    }

    pub fn customer(&self, name: Option<&str>, language: &str, country: &str) -> Customer {
        let customer = Customer {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            name: name.map(str::to_string),
            language: Some(language.to_string()),
            country: Some(country.to_string()),
            phone: None,
            tags: Vec::new(),
            consultation_tag: None,
            crm_customer_id: None,
            created_at: start_time(),
            updated_at: start_time(),
        };
        self.store.insert_customer(customer.clone());
        customer
    }

    pub fn conversation(&self, customer: &Customer) -> Conversation {
        let conversation = Conversation {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            customer_id: customer.id,
            channel_type: "line".to_string(),
            channel_account_id: Some("line-main".to_string()),
            external_user_id: Some("U123".to_string()),
            status: ConversationStatus::Active,
            assigned_to: None,
            last_customer_message_at: Some(start_time()),
            last_reply_at: None,
            created_at: start_time(),
            updated_at: start_time(),
        };
        self.store.insert_conversation(conversation.clone());
        conversation
    }

    pub fn message(&self, conversation: &Conversation, content: &str) -> Message {
        let message = Message {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            conversation_id: conversation.id,
            sender_type: "customer".to_string(),
            content: content.to_string(),
            language: None,
            created_at: self.state.clock.now(),
        };
        self.store.insert_message(message.clone());
        message
    }

    pub fn rule(
        &self,
        name: &str,
        priority: i32,
        trigger: TriggerType,
        conditions: Option<ConditionGroup>,
        actions: Vec<ActionSpec>,
    ) -> AutomationRule {
        let rule = AutomationRule {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            name: name.to_string(),
            description: None,
            is_active: true,
            priority,
            trigger_type: trigger,
            trigger_config: TriggerConfig::default(),
            conditions,
            actions,
            max_executions_per_conversation: None,
            cooldown_minutes: None,
            execution_count: 0,
            last_executed_at: None,
            created_at: start_time(),
            updated_at: start_time(),
            load_error: None,
        };
        self.store.insert_rule(rule.clone());
        rule
    }
}

/// Parses an action from its stored JSON form.
pub fn action(value: serde_json::Value) -> ActionSpec {
    serde_json::from_value(value).unwrap()
}

pub fn note(text: &str) -> ActionSpec {
    action(json!({ "type": "send_internal_note", "config": { "note": text } }))
}
