//! Wire formats on the Redis streams: events consumed from
//! `automation:queue:incoming` and jobs produced for downstream workers.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::execution::TriggerContext;
use crate::models::rule::TriggerType;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncomingEvent {
    NewMessage {
        tenant_id: Uuid,
        conversation_id: Uuid,
        customer_id: Uuid,
        message_id: Uuid,
        content: String,
        #[serde(default)]
        language: Option<String>,
    },
    Trigger {
        trigger: TriggerType,
        context: TriggerContext,
    },
    ApproveBooking {
        booking_request_id: Uuid,
        #[serde(default)]
        confirmed_date: Option<NaiveDate>,
        #[serde(default)]
        confirmed_time: Option<NaiveTime>,
        #[serde(default)]
        alternative_dates: Vec<String>,
        #[serde(default)]
        response_text: Option<String>,
        #[serde(default)]
        responder_id: Option<Uuid>,
    },
    RejectBooking {
        booking_request_id: Uuid,
        reason: String,
        #[serde(default)]
        responder_id: Option<Uuid>,
    },
    ConfirmBooking {
        booking_request_id: Uuid,
        crm_booking_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageJob {
    pub tenant_id: Uuid,
    pub conversation_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub channel_type: String,
    pub channel_account_id: Option<String>,
    pub recipient: Option<String>,
    pub content: String,
    /// Target language when the outgoing text must be translated first.
    pub translate_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationJob {
    pub tenant_id: Uuid,
    pub channels: Vec<String>,
    pub recipients: Vec<String>,
    pub message: String,
    pub conversation_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyJob {
    pub tenant_id: Uuid,
    pub conversation_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub language: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum CrmOperation {
    UpdateCustomer {
        fields: std::collections::BTreeMap<String, String>,
    },
    AddNote {
        note: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmSyncJob {
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub crm_customer_id: Option<String>,
    #[serde(flatten)]
    pub operation: CrmOperation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingReviewJob {
    pub tenant_id: Uuid,
    pub booking_request_id: Uuid,
    pub customer_id: Uuid,
    pub summary: String,
    pub reminder: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum JobKind {
    SendMessage(SendMessageJob),
    SendNotification(NotificationJob),
    SendSatisfactionSurvey(SurveyJob),
    CrmSync(CrmSyncJob),
    BookingReview(BookingReviewJob),
}

impl JobKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SendMessage(_) => "send_message",
            Self::SendNotification(_) => "send_notification",
            Self::SendSatisfactionSurvey(_) => "send_satisfaction_survey",
            Self::CrmSync(_) => "crm_sync",
            Self::BookingReview(_) => "booking_review",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    #[serde(flatten)]
    pub kind: JobKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn now(kind: JobKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            delay_ms: None,
            enqueued_at: Utc::now(),
        }
    }

    pub fn delayed(kind: JobKind, delay_ms: u64) -> Self {
        Self {
            delay_ms: Some(delay_ms),
            ..Self::now(kind)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_message_event_parses() {
        let tenant = Uuid::new_v4();
        let raw = json!({
            "type": "NEW_MESSAGE",
            "tenant_id": tenant,
            "conversation_id": Uuid::new_v4(),
            "customer_id": Uuid::new_v4(),
            "message_id": Uuid::new_v4(),
            "content": "예약하고 싶어요"
        });

        let event: IncomingEvent = serde_json::from_value(raw).unwrap();
        match event {
            IncomingEvent::NewMessage {
                tenant_id, language, ..
            } => {
                assert_eq!(tenant_id, tenant);
                assert!(language.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn trigger_event_carries_context() {
        let raw = json!({
            "type": "TRIGGER",
            "trigger": "no_response_24h",
            "context": { "tenant_id": Uuid::new_v4(), "conversation_id": Uuid::new_v4() }
        });

        let event: IncomingEvent = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            event,
            IncomingEvent::Trigger { trigger: TriggerType::NoResponse24h, .. }
        ));
    }

    #[test]
    fn job_serializes_type_and_data_side_by_side() {
        let job = Job::delayed(
            JobKind::SendNotification(NotificationJob {
                tenant_id: Uuid::nil(),
                channels: vec!["slack".into()],
                recipients: vec![],
                message: "hi".into(),
                conversation_id: None,
            }),
            60_000,
        );

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "send_notification");
        assert_eq!(value["data"]["message"], "hi");
        assert_eq!(value["delay_ms"], 60_000);
    }
}
