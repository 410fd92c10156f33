use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::booking::{BookingApproval, BookingRequest, NewBookingRequest};
use crate::models::db::{
    Booking, Conversation, ConversationStatus, Customer, Escalation, Message, NewEscalation,
};
use crate::models::execution::ExecutionResult;
use crate::models::rule::{AutomationRule, RuleRow, TriggerType};
use crate::store::{Store, SweepCursor};

/// Postgres-backed store. Schema lives in `migrations/`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn active_rules(
        &self,
        tenant_id: Uuid,
        trigger: TriggerType,
    ) -> Result<Vec<AutomationRule>, StoreError> {
        let rows = sqlx::query_as::<_, RuleRow>(
            r#"
            SELECT * FROM automation_rules
            WHERE tenant_id = $1 AND trigger_type = $2 AND is_active = true
            ORDER BY priority ASC, created_at ASC
            "#,
        )
        .bind(tenant_id)
        .bind(trigger.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| row.into_rule(trigger)).collect())
    }

    async fn increment_rule_stats(
        &self,
        rule_id: Uuid,
        executed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE automation_rules
            SET execution_count = execution_count + 1, last_executed_at = $2
            WHERE id = $1
            "#,
        )
        .bind(rule_id)
        .bind(executed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_execution(&self, result: &ExecutionResult) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO automation_executions
                (id, rule_id, tenant_id, conversation_id, customer_id, trigger_type,
                 success, actions_executed, action_results, duration_ms, error, executed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(result.id)
        .bind(result.rule_id)
        .bind(result.tenant_id)
        .bind(result.conversation_id)
        .bind(result.customer_id)
        .bind(result.trigger_type.as_str())
        .bind(result.success)
        .bind(result.actions_executed)
        .bind(Json(&result.action_results))
        .bind(result.duration_ms)
        .bind(&result.error)
        .bind(result.executed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_successful_executions(
        &self,
        rule_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM automation_executions
            WHERE rule_id = $1 AND conversation_id = $2 AND success = true
            "#,
        )
        .bind(rule_id)
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn last_execution_at(
        &self,
        rule_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let last: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT executed_at FROM automation_executions
            WHERE rule_id = $1 AND conversation_id = $2
            ORDER BY executed_at DESC LIMIT 1
            "#,
        )
        .bind(rule_id)
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(last)
    }

    async fn customer(&self, id: Uuid) -> Result<Option<Customer>, StoreError> {
        let row = sqlx::query_as::<_, Customer>("SELECT * FROM customers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn booking(&self, id: Uuid) -> Result<Option<Booking>, StoreError> {
        let row = sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM (
                SELECT * FROM messages
                WHERE conversation_id = $1
                ORDER BY created_at DESC
                LIMIT $2
            ) latest
            ORDER BY created_at ASC
            "#,
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn conversations_by_last_customer_message(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        unanswered_only: bool,
        after: Option<SweepCursor>,
        limit: i64,
    ) -> Result<Vec<Conversation>, StoreError> {
        let (after_at, after_id) = after.unzip();
        let rows = sqlx::query_as::<_, Conversation>(
            r#"
            SELECT * FROM conversations
            WHERE status NOT IN ('resolved', 'closed')
              AND last_customer_message_at >= $1
              AND last_customer_message_at < $2
              AND (
                $3 = false
                OR last_reply_at IS NULL
                OR last_reply_at < last_customer_message_at
              )
              AND (
                $4::timestamptz IS NULL
                OR (last_customer_message_at, id) > ($4, $5::uuid)
              )
            ORDER BY last_customer_message_at ASC, id ASC
            LIMIT $6
            "#,
        )
        .bind(from)
        .bind(to)
        .bind(unanswered_only)
        .bind(after_at)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_conversation_status(
        &self,
        id: Uuid,
        status: ConversationStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let done = sqlx::query("UPDATE conversations SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .bind(at)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "conversation",
                id,
            });
        }
        Ok(())
    }

    async fn assign_conversation(
        &self,
        id: Uuid,
        agent_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let done =
            sqlx::query("UPDATE conversations SET assigned_to = $2, updated_at = $3 WHERE id = $1")
                .bind(id)
                .bind(agent_id)
                .bind(at)
                .execute(&self.pool)
                .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "conversation",
                id,
            });
        }
        Ok(())
    }

    async fn set_customer_tags(
        &self,
        id: Uuid,
        tags: &[String],
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let done = sqlx::query("UPDATE customers SET tags = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(tags)
            .bind(at)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "customer",
                id,
            });
        }
        Ok(())
    }

    async fn set_consultation_tag(
        &self,
        id: Uuid,
        tag: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let done = sqlx::query(
            "UPDATE customers SET consultation_tag = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(tag)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "customer",
                id,
            });
        }
        Ok(())
    }

    async fn insert_internal_note(
        &self,
        conversation: &Conversation,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<Message, StoreError> {
        let row = sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages (id, tenant_id, conversation_id, sender_type, content, created_at)
            VALUES ($1, $2, $3, 'internal_note', $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(conversation.tenant_id)
        .bind(conversation.id)
        .bind(content)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn create_escalation(
        &self,
        escalation: NewEscalation,
        at: DateTime<Utc>,
    ) -> Result<Option<Escalation>, StoreError> {
        // Unique index on idempotency_key turns a replay into zero rows.
        let row = sqlx::query_as::<_, Escalation>(
            r#"
            INSERT INTO escalations
                (id, tenant_id, conversation_id, message_id, customer_id, rule_id,
                 reason, priority, status, idempotency_key, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', $9, $10)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(escalation.tenant_id)
        .bind(escalation.conversation_id)
        .bind(escalation.message_id)
        .bind(escalation.customer_id)
        .bind(escalation.rule_id)
        .bind(&escalation.reason)
        .bind(escalation.priority.as_str())
        .bind(&escalation.idempotency_key)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn create_booking_request(
        &self,
        request: NewBookingRequest,
        at: DateTime<Utc>,
    ) -> Result<BookingRequest, StoreError> {
        let row = sqlx::query_as::<_, BookingRequest>(
            r#"
            INSERT INTO booking_requests
                (id, tenant_id, customer_id, conversation_id, requested_date, requested_time,
                 requested_date_text, treatment_type, special_requests, status, metadata,
                 created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', $10, $11)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request.tenant_id)
        .bind(request.customer_id)
        .bind(request.conversation_id)
        .bind(request.requested_date)
        .bind(request.requested_time)
        .bind(&request.requested_date_text)
        .bind(&request.treatment_type)
        .bind(&request.special_requests)
        .bind(&request.metadata)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn booking_request(&self, id: Uuid) -> Result<Option<BookingRequest>, StoreError> {
        let row =
            sqlx::query_as::<_, BookingRequest>("SELECT * FROM booking_requests WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    async fn approve_booking_request(
        &self,
        id: Uuid,
        approval: &BookingApproval,
        at: DateTime<Utc>,
    ) -> Result<Option<BookingRequest>, StoreError> {
        let row = sqlx::query_as::<_, BookingRequest>(
            r#"
            UPDATE booking_requests
            SET status = 'approved',
                confirmed_date = $2,
                confirmed_time = $3,
                alternative_dates = $4,
                human_response = $5,
                responded_by = $6,
                human_responded_at = $7
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(approval.confirmed_date)
        .bind(approval.confirmed_time)
        .bind(&approval.alternative_dates)
        .bind(&approval.response_text)
        .bind(approval.responder_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn reject_booking_request(
        &self,
        id: Uuid,
        reason: &str,
        responder_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<Option<BookingRequest>, StoreError> {
        let row = sqlx::query_as::<_, BookingRequest>(
            r#"
            UPDATE booking_requests
            SET status = 'rejected',
                rejection_reason = $2,
                responded_by = $3,
                human_responded_at = $4
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(responder_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn confirm_booking_to_crm(
        &self,
        id: Uuid,
        crm_booking_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<BookingRequest>, StoreError> {
        let row = sqlx::query_as::<_, BookingRequest>(
            r#"
            UPDATE booking_requests
            SET status = 'confirmed', crm_booking_id = $2, confirmed_at = $3
            WHERE id = $1 AND status IN ('pending', 'approved')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(crm_booking_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn pending_booking_requests(
        &self,
        tenant_id: Option<Uuid>,
    ) -> Result<Vec<BookingRequest>, StoreError> {
        let rows = sqlx::query_as::<_, BookingRequest>(
            r#"
            SELECT * FROM booking_requests
            WHERE status = 'pending' AND ($1::uuid IS NULL OR tenant_id = $1)
            ORDER BY created_at ASC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn record_booking_notification(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE booking_requests SET notification_count = notification_count + 1 WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
