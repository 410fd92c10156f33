use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::UnknownVariant;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: Option<String>,
    pub language: Option<String>,
    pub country: Option<String>,
    pub phone: Option<String>,
    pub tags: Vec<String>,
    pub consultation_tag: Option<String>,
    pub crm_customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Waiting,
    Escalated,
    Resolved,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Waiting => "waiting",
            Self::Escalated => "escalated",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }
}

impl TryFrom<String> for ConversationStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "active" => Ok(Self::Active),
            "waiting" => Ok(Self::Waiting),
            "escalated" => Ok(Self::Escalated),
            "resolved" => Ok(Self::Resolved),
            "closed" => Ok(Self::Closed),
            _ => Err(UnknownVariant::new("conversation status", value)),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub channel_type: String,
    pub channel_account_id: Option<String>,
    pub external_user_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: ConversationStatus,
    pub assigned_to: Option<Uuid>,
    pub last_customer_message_at: Option<DateTime<Utc>>,
    pub last_reply_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub conversation_id: Uuid,
    /// customer, agent, ai, system or internal_note
    pub sender_type: String,
    pub content: String,
    pub language: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn is_from_customer(&self) -> bool {
        self.sender_type == "customer"
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub booking_date: DateTime<Utc>,
    pub booking_type: String,
    pub status: String,
    pub crm_booking_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl EscalationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl TryFrom<String> for EscalationPriority {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            _ => Err(UnknownVariant::new("escalation priority", value)),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Escalation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub conversation_id: Uuid,
    pub message_id: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub rule_id: Option<Uuid>,
    pub reason: String,
    #[sqlx(try_from = "String")]
    pub priority: EscalationPriority,
    pub status: String,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for an escalation row.
#[derive(Debug, Clone)]
pub struct NewEscalation {
    pub tenant_id: Uuid,
    pub conversation_id: Uuid,
    pub message_id: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub rule_id: Option<Uuid>,
    pub reason: String,
    pub priority: EscalationPriority,
    pub idempotency_key: Option<String>,
}
