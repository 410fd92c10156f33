//! In-process [`Store`] used by tests and local runs without Postgres.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::booking::{BookingApproval, BookingRequest, BookingStatus, NewBookingRequest};
use crate::models::db::{
    Booking, Conversation, ConversationStatus, Customer, Escalation, Message, NewEscalation,
};
use crate::models::execution::ExecutionResult;
use crate::models::rule::{AutomationRule, TriggerType};
use crate::store::{Store, SweepCursor};

#[derive(Default)]
struct Inner {
    rules: HashMap<Uuid, AutomationRule>,
    executions: Vec<ExecutionResult>,
    customers: HashMap<Uuid, Customer>,
    conversations: HashMap<Uuid, Conversation>,
    messages: Vec<Message>,
    bookings: HashMap<Uuid, Booking>,
    escalations: Vec<Escalation>,
    booking_requests: HashMap<Uuid, BookingRequest>,
    failing_rules: HashSet<Uuid>,
    rules_unavailable: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- seeding --

    pub fn insert_rule(&self, rule: AutomationRule) {
        self.lock().rules.insert(rule.id, rule);
    }

    pub fn insert_customer(&self, customer: Customer) {
        self.lock().customers.insert(customer.id, customer);
    }

    pub fn insert_conversation(&self, conversation: Conversation) {
        self.lock().conversations.insert(conversation.id, conversation);
    }

    pub fn insert_message(&self, message: Message) {
        self.lock().messages.push(message);
    }

    pub fn insert_booking(&self, booking: Booking) {
        self.lock().bookings.insert(booking.id, booking);
    }

    /// Every store call touching this rule's audit trail fails afterwards.
    pub fn fail_rule(&self, rule_id: Uuid) {
        self.lock().failing_rules.insert(rule_id);
    }

    pub fn set_rules_unavailable(&self, unavailable: bool) {
        self.lock().rules_unavailable = unavailable;
    }

    // -- inspection --

    pub fn executions(&self) -> Vec<ExecutionResult> {
        self.lock().executions.clone()
    }

    pub fn escalations(&self) -> Vec<Escalation> {
        self.lock().escalations.clone()
    }

    pub fn rule(&self, id: Uuid) -> Option<AutomationRule> {
        self.lock().rules.get(&id).cloned()
    }

    pub fn messages_in(&self, conversation_id: Uuid) -> Vec<Message> {
        self.lock()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn booking_requests(&self) -> Vec<BookingRequest> {
        let mut all: Vec<_> = self.lock().booking_requests.values().cloned().collect();
        all.sort_by_key(|r| r.created_at);
        all
    }
}

fn unavailable(rule_id: Uuid) -> StoreError {
    StoreError::Unavailable(format!("audit log for rule {rule_id}"))
}

#[async_trait]
impl Store for MemoryStore {
    async fn active_rules(
        &self,
        tenant_id: Uuid,
        trigger: TriggerType,
    ) -> Result<Vec<AutomationRule>, StoreError> {
        let inner = self.lock();
        if inner.rules_unavailable {
            return Err(StoreError::Unavailable("automation_rules".to_string()));
        }
        let mut rules: Vec<AutomationRule> = inner
            .rules
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.is_active && r.trigger_type == trigger)
            .cloned()
            .collect();
        rules.sort_by_key(|r| (r.priority, r.created_at));
        Ok(rules)
    }

    async fn increment_rule_stats(
        &self,
        rule_id: Uuid,
        executed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let rule = inner.rules.get_mut(&rule_id).ok_or(StoreError::NotFound {
            entity: "automation rule",
            id: rule_id,
        })?;
        rule.execution_count += 1;
        rule.last_executed_at = Some(executed_at);
        Ok(())
    }

    async fn insert_execution(&self, result: &ExecutionResult) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.failing_rules.contains(&result.rule_id) {
            return Err(unavailable(result.rule_id));
        }
        inner.executions.push(result.clone());
        Ok(())
    }

    async fn count_successful_executions(
        &self,
        rule_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<i64, StoreError> {
        let inner = self.lock();
        if inner.failing_rules.contains(&rule_id) {
            return Err(unavailable(rule_id));
        }
        let count = inner
            .executions
            .iter()
            .filter(|e| {
                e.rule_id == rule_id && e.conversation_id == Some(conversation_id) && e.success
            })
            .count();
        Ok(count as i64)
    }

    async fn last_execution_at(
        &self,
        rule_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let inner = self.lock();
        if inner.failing_rules.contains(&rule_id) {
            return Err(unavailable(rule_id));
        }
        Ok(inner
            .executions
            .iter()
            .filter(|e| e.rule_id == rule_id && e.conversation_id == Some(conversation_id))
            .map(|e| e.executed_at)
            .max())
    }

    async fn customer(&self, id: Uuid) -> Result<Option<Customer>, StoreError> {
        Ok(self.lock().customers.get(&id).cloned())
    }

    async fn conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        Ok(self.lock().conversations.get(&id).cloned())
    }

    async fn message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        Ok(self.lock().messages.iter().find(|m| m.id == id).cloned())
    }

    async fn booking(&self, id: Uuid) -> Result<Option<Booking>, StoreError> {
        Ok(self.lock().bookings.get(&id).cloned())
    }

    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let mut messages = self.messages_in(conversation_id);
        messages.sort_by_key(|m| m.created_at);
        let skip = messages.len().saturating_sub(limit.max(0) as usize);
        Ok(messages.split_off(skip))
    }

    async fn conversations_by_last_customer_message(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        unanswered_only: bool,
        after: Option<SweepCursor>,
        limit: i64,
    ) -> Result<Vec<Conversation>, StoreError> {
        let inner = self.lock();
        let mut found: Vec<Conversation> = inner
            .conversations
            .values()
            .filter(|c| !matches!(c.status, ConversationStatus::Resolved | ConversationStatus::Closed))
            .filter(|c| {
                c.last_customer_message_at
                    .is_some_and(|at| at >= from && at < to)
            })
            .filter(|c| {
                !unanswered_only
                    || match (c.last_reply_at, c.last_customer_message_at) {
                        (Some(reply), Some(customer)) => reply < customer,
                        _ => true,
                    }
            })
            .filter(|c| match (after, c.last_customer_message_at) {
                (Some(cursor), Some(at)) => (at, c.id) > cursor,
                _ => true,
            })
            .cloned()
            .collect();
        found.sort_by_key(|c| (c.last_customer_message_at, c.id));
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }

    async fn update_conversation_status(
        &self,
        id: Uuid,
        status: ConversationStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let conversation = inner.conversations.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "conversation",
            id,
        })?;
        conversation.status = status;
        conversation.updated_at = at;
        Ok(())
    }

    async fn assign_conversation(
        &self,
        id: Uuid,
        agent_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let conversation = inner.conversations.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "conversation",
            id,
        })?;
        conversation.assigned_to = agent_id;
        conversation.updated_at = at;
        Ok(())
    }

    async fn set_customer_tags(
        &self,
        id: Uuid,
        tags: &[String],
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let customer = inner.customers.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "customer",
            id,
        })?;
        customer.tags = tags.to_vec();
        customer.updated_at = at;
        Ok(())
    }

    async fn set_consultation_tag(
        &self,
        id: Uuid,
        tag: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let customer = inner.customers.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "customer",
            id,
        })?;
        customer.consultation_tag = Some(tag.to_string());
        customer.updated_at = at;
        Ok(())
    }

    async fn insert_internal_note(
        &self,
        conversation: &Conversation,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<Message, StoreError> {
        let message = Message {
            id: Uuid::new_v4(),
            tenant_id: conversation.tenant_id,
            conversation_id: conversation.id,
            sender_type: "internal_note".to_string(),
            content: content.to_string(),
            language: None,
            created_at: at,
        };
        self.lock().messages.push(message.clone());
        Ok(message)
    }

    async fn create_escalation(
        &self,
        escalation: NewEscalation,
        at: DateTime<Utc>,
    ) -> Result<Option<Escalation>, StoreError> {
        let mut inner = self.lock();
        if let Some(key) = &escalation.idempotency_key
            && inner
                .escalations
                .iter()
                .any(|e| e.idempotency_key.as_deref() == Some(key.as_str()))
        {
            return Ok(None);
        }

        let row = Escalation {
            id: Uuid::new_v4(),
            tenant_id: escalation.tenant_id,
            conversation_id: escalation.conversation_id,
            message_id: escalation.message_id,
            customer_id: escalation.customer_id,
            rule_id: escalation.rule_id,
            reason: escalation.reason,
            priority: escalation.priority,
            status: "pending".to_string(),
            idempotency_key: escalation.idempotency_key,
            created_at: at,
        };
        inner.escalations.push(row.clone());
        Ok(Some(row))
    }

    async fn create_booking_request(
        &self,
        request: NewBookingRequest,
        at: DateTime<Utc>,
    ) -> Result<BookingRequest, StoreError> {
        let row = BookingRequest {
            id: Uuid::new_v4(),
            tenant_id: request.tenant_id,
            customer_id: request.customer_id,
            conversation_id: request.conversation_id,
            requested_date: request.requested_date,
            requested_time: request.requested_time,
            requested_date_text: request.requested_date_text,
            treatment_type: request.treatment_type,
            special_requests: request.special_requests,
            status: BookingStatus::Pending,
            human_response: None,
            responded_by: None,
            alternative_dates: Vec::new(),
            rejection_reason: None,
            crm_booking_id: None,
            confirmed_date: None,
            confirmed_time: None,
            metadata: request.metadata,
            notification_count: 0,
            created_at: at,
            human_responded_at: None,
            confirmed_at: None,
        };
        self.lock().booking_requests.insert(row.id, row.clone());
        Ok(row)
    }

    async fn booking_request(&self, id: Uuid) -> Result<Option<BookingRequest>, StoreError> {
        Ok(self.lock().booking_requests.get(&id).cloned())
    }

    async fn approve_booking_request(
        &self,
        id: Uuid,
        approval: &BookingApproval,
        at: DateTime<Utc>,
    ) -> Result<Option<BookingRequest>, StoreError> {
        let mut inner = self.lock();
        let Some(row) = inner
            .booking_requests
            .get_mut(&id)
            .filter(|r| r.status == BookingStatus::Pending)
        else {
            return Ok(None);
        };
        row.status = BookingStatus::Approved;
        row.confirmed_date = approval.confirmed_date;
        row.confirmed_time = approval.confirmed_time;
        row.alternative_dates = approval.alternative_dates.clone();
        row.human_response = approval.response_text.clone();
        row.responded_by = approval.responder_id;
        row.human_responded_at = Some(at);
        Ok(Some(row.clone()))
    }

    async fn reject_booking_request(
        &self,
        id: Uuid,
        reason: &str,
        responder_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<Option<BookingRequest>, StoreError> {
        let mut inner = self.lock();
        let Some(row) = inner
            .booking_requests
            .get_mut(&id)
            .filter(|r| r.status == BookingStatus::Pending)
        else {
            return Ok(None);
        };
        row.status = BookingStatus::Rejected;
        row.rejection_reason = Some(reason.to_string());
        row.responded_by = responder_id;
        row.human_responded_at = Some(at);
        Ok(Some(row.clone()))
    }

    async fn confirm_booking_to_crm(
        &self,
        id: Uuid,
        crm_booking_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<BookingRequest>, StoreError> {
        let mut inner = self.lock();
        let Some(row) = inner.booking_requests.get_mut(&id).filter(|r| {
            matches!(r.status, BookingStatus::Pending | BookingStatus::Approved)
        }) else {
            return Ok(None);
        };
        row.status = BookingStatus::Confirmed;
        row.crm_booking_id = Some(crm_booking_id.to_string());
        row.confirmed_at = Some(at);
        Ok(Some(row.clone()))
    }

    async fn pending_booking_requests(
        &self,
        tenant_id: Option<Uuid>,
    ) -> Result<Vec<BookingRequest>, StoreError> {
        Ok(self
            .booking_requests()
            .into_iter()
            .filter(|r| r.status == BookingStatus::Pending)
            .filter(|r| tenant_id.is_none_or(|t| r.tenant_id == t))
            .collect())
    }

    async fn record_booking_notification(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let row = inner.booking_requests.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "booking request",
            id,
        })?;
        row.notification_count += 1;
        Ok(())
    }
}
