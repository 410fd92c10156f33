use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Approved,
    Confirmed,
    Rejected,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Rejected)
    }
}

impl TryFrom<String> for BookingStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "confirmed" => Ok(Self::Confirmed),
            "rejected" => Ok(Self::Rejected),
            _ => Err(UnknownVariant::new("booking status", value)),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BookingRequest {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub requested_date: Option<NaiveDate>,
    pub requested_time: Option<NaiveTime>,
    /// Free-text date when the customer did not give a calendar date.
    pub requested_date_text: Option<String>,
    pub treatment_type: Option<String>,
    pub special_requests: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: BookingStatus,
    pub human_response: Option<String>,
    pub responded_by: Option<Uuid>,
    pub alternative_dates: Vec<String>,
    pub rejection_reason: Option<String>,
    pub crm_booking_id: Option<String>,
    pub confirmed_date: Option<NaiveDate>,
    pub confirmed_time: Option<NaiveTime>,
    pub metadata: Option<serde_json::Value>,
    pub notification_count: i32,
    pub created_at: DateTime<Utc>,
    pub human_responded_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewBookingRequest {
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub requested_date: Option<NaiveDate>,
    pub requested_time: Option<NaiveTime>,
    pub requested_date_text: Option<String>,
    pub treatment_type: Option<String>,
    pub special_requests: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// A human operator's approval of a pending request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookingApproval {
    pub confirmed_date: Option<NaiveDate>,
    pub confirmed_time: Option<NaiveTime>,
    #[serde(default)]
    pub alternative_dates: Vec<String>,
    pub response_text: Option<String>,
    pub responder_id: Option<Uuid>,
}

/// Entry of the human review queue.
#[derive(Debug, Clone, Serialize)]
pub struct PendingBookingRequest {
    pub request: BookingRequest,
    pub waiting_minutes: i64,
    pub notification_count: i32,
}

// ---------------------------------------------------------------------------
// Intent classification output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    Inquiry,
    Request,
    Modification,
    Cancellation,
    None,
}

impl IntentType {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "inquiry" => Self::Inquiry,
            "request" => Self::Request,
            "modification" => Self::Modification,
            "cancellation" => Self::Cancellation,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    SendForm,
    AskDetails,
    ConfirmBooking,
    Escalate,
    None,
}

impl RecommendedAction {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "send_form" => Self::SendForm,
            "ask_details" => Self::AskDetails,
            "confirm_booking" => Self::ConfirmBooking,
            "escalate" => Self::Escalate,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentSource {
    Model,
    Keywords,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentEntities {
    /// Machine-readable date (YYYY-MM-DD) when the model could resolve one.
    pub date: Option<NaiveDate>,
    /// Date exactly as the customer phrased it ("next Tuesday").
    pub date_text: Option<String>,
    pub time: Option<NaiveTime>,
    pub treatment: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingIntent {
    pub detected: bool,
    pub confidence: f64,
    pub intent_type: IntentType,
    pub entities: IntentEntities,
    pub recommended_action: RecommendedAction,
    pub suggested_response: String,
    pub source: IntentSource,
}

impl BookingIntent {
    pub fn not_detected(source: IntentSource) -> Self {
        Self {
            detected: false,
            confidence: 0.0,
            intent_type: IntentType::None,
            entities: IntentEntities::default(),
            recommended_action: RecommendedAction::None,
            suggested_response: String::new(),
            source,
        }
    }
}
