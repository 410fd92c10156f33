//! Data-store boundary. The engine only talks to [`Store`]; Postgres backs it
//! in the worker and [`MemoryStore`] backs it in tests and local runs.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::booking::{BookingApproval, BookingRequest, NewBookingRequest};
use crate::models::db::{
    Booking, Conversation, ConversationStatus, Customer, Escalation, Message, NewEscalation,
};
use crate::models::execution::ExecutionResult;
use crate::models::rule::{AutomationRule, TriggerType};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Keyset position in a sweep window: the last row's
/// `last_customer_message_at` and id.
pub type SweepCursor = (DateTime<Utc>, Uuid);

#[async_trait]
pub trait Store: Send + Sync {
    // -- rules & audit --

    /// Active rules for a tenant and trigger, ascending priority, ties by
    /// creation time.
    async fn active_rules(
        &self,
        tenant_id: Uuid,
        trigger: TriggerType,
    ) -> Result<Vec<AutomationRule>, StoreError>;

    async fn increment_rule_stats(
        &self,
        rule_id: Uuid,
        executed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn insert_execution(&self, result: &ExecutionResult) -> Result<(), StoreError>;

    async fn count_successful_executions(
        &self,
        rule_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<i64, StoreError>;

    async fn last_execution_at(
        &self,
        rule_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    // -- entity reads --

    async fn customer(&self, id: Uuid) -> Result<Option<Customer>, StoreError>;
    async fn conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError>;
    async fn message(&self, id: Uuid) -> Result<Option<Message>, StoreError>;
    async fn booking(&self, id: Uuid) -> Result<Option<Booking>, StoreError>;

    /// Latest `limit` messages of a conversation, oldest first.
    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError>;

    /// Open conversations whose last customer message falls in `[from, to)`,
    /// ordered by `(last_customer_message_at, id)` and starting strictly after
    /// `after`. With `unanswered_only`, only those with no reply after that
    /// message.
    async fn conversations_by_last_customer_message(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        unanswered_only: bool,
        after: Option<SweepCursor>,
        limit: i64,
    ) -> Result<Vec<Conversation>, StoreError>;

    // -- single-row mutations --

    async fn update_conversation_status(
        &self,
        id: Uuid,
        status: ConversationStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn assign_conversation(
        &self,
        id: Uuid,
        agent_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn set_customer_tags(
        &self,
        id: Uuid,
        tags: &[String],
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn set_consultation_tag(
        &self,
        id: Uuid,
        tag: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn insert_internal_note(
        &self,
        conversation: &Conversation,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<Message, StoreError>;

    /// Returns `None` when an escalation with the same idempotency key exists.
    async fn create_escalation(
        &self,
        escalation: NewEscalation,
        at: DateTime<Utc>,
    ) -> Result<Option<Escalation>, StoreError>;

    // -- booking request primitives --

    async fn create_booking_request(
        &self,
        request: NewBookingRequest,
        at: DateTime<Utc>,
    ) -> Result<BookingRequest, StoreError>;

    async fn booking_request(&self, id: Uuid) -> Result<Option<BookingRequest>, StoreError>;

    /// Guarded: only applies to `pending` requests, `None` otherwise.
    async fn approve_booking_request(
        &self,
        id: Uuid,
        approval: &BookingApproval,
        at: DateTime<Utc>,
    ) -> Result<Option<BookingRequest>, StoreError>;

    /// Guarded: only applies to `pending` requests, `None` otherwise.
    async fn reject_booking_request(
        &self,
        id: Uuid,
        reason: &str,
        responder_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<Option<BookingRequest>, StoreError>;

    /// Guarded: only applies to `pending` or `approved` requests.
    async fn confirm_booking_to_crm(
        &self,
        id: Uuid,
        crm_booking_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<BookingRequest>, StoreError>;

    /// Pending requests, oldest first. `None` means every tenant.
    async fn pending_booking_requests(
        &self,
        tenant_id: Option<Uuid>,
    ) -> Result<Vec<BookingRequest>, StoreError>;

    async fn record_booking_notification(&self, id: Uuid) -> Result<(), StoreError>;
}
