//! Booking-request workflow: every request starts `pending` and only a human
//! decision (or an explicit CRM confirmation) moves it on.
//!
//! ```text
//! pending ──▶ approved ──▶ confirmed
//!    │  └───────────────────▲
//!    └──▶ rejected
//! ```

use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveTime};
use regex::{Regex, RegexBuilder};
use tracing::{info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::error::BookingError;
use crate::models::booking::{
    BookingApproval, BookingRequest, BookingStatus, NewBookingRequest, PendingBookingRequest,
};
use crate::models::payloads::{BookingReviewJob, Job, JobKind, SendMessageJob};

pub fn can_transition(from: BookingStatus, to: BookingStatus) -> bool {
    matches!(
        (from, to),
        (BookingStatus::Pending, BookingStatus::Approved)
            | (BookingStatus::Pending, BookingStatus::Rejected)
            | (BookingStatus::Pending, BookingStatus::Confirmed)
            | (BookingStatus::Approved, BookingStatus::Confirmed)
    )
}

/// Stores a new `pending` request and pages staff about it.
pub async fn create_request(
    state: &AppState,
    request: NewBookingRequest,
) -> Result<BookingRequest, BookingError> {
    let now = state.clock.now();
    let mut created = state.store.create_booking_request(request, now).await?;

    info!(
        booking_request_id = %created.id,
        tenant_id = %created.tenant_id,
        customer_id = %created.customer_id,
        "Created booking request"
    );

    match notify_staff(state, &created, false).await {
        Ok(()) => created.notification_count += 1,
        Err(e) => warn!(
            booking_request_id = %created.id,
            error = %e,
            "Failed to notify staff about booking request"
        ),
    }

    Ok(created)
}

/// Enqueues a review job for staff and bumps the request's notification count.
pub async fn notify_staff(
    state: &AppState,
    request: &BookingRequest,
    reminder: bool,
) -> Result<(), BookingError> {
    let job = Job::now(JobKind::BookingReview(BookingReviewJob {
        tenant_id: request.tenant_id,
        booking_request_id: request.id,
        customer_id: request.customer_id,
        summary: summarize(request),
        reminder,
    }));

    state.queue.enqueue(job).await?;
    state.store.record_booking_notification(request.id).await?;
    Ok(())
}

pub async fn approve(
    state: &AppState,
    id: Uuid,
    approval: BookingApproval,
) -> Result<BookingRequest, BookingError> {
    if approval.confirmed_date.is_none() && approval.alternative_dates.is_empty() {
        return Err(BookingError::Validation(
            "approval needs a confirmed date or at least one alternative date".to_string(),
        ));
    }

    ensure_transition(state, id, BookingStatus::Approved).await?;

    let now = state.clock.now();
    let Some(approved) = state.store.approve_booking_request(id, &approval, now).await? else {
        return Err(lost_race(state, id, BookingStatus::Approved).await);
    };

    info!(
        booking_request_id = %id,
        responder_id = ?approval.responder_id,
        "Booking request approved"
    );

    if let Some(text) = approval.response_text.as_deref().filter(|t| !t.trim().is_empty()) {
        reply_to_customer(state, &approved, text).await;
    }

    Ok(approved)
}

pub async fn reject(
    state: &AppState,
    id: Uuid,
    reason: &str,
    responder_id: Option<Uuid>,
) -> Result<BookingRequest, BookingError> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(BookingError::Validation(
            "rejection reason must not be empty".to_string(),
        ));
    }

    ensure_transition(state, id, BookingStatus::Rejected).await?;

    let now = state.clock.now();
    let Some(rejected) = state
        .store
        .reject_booking_request(id, reason, responder_id, now)
        .await?
    else {
        return Err(lost_race(state, id, BookingStatus::Rejected).await);
    };

    info!(booking_request_id = %id, reason, "Booking request rejected");
    Ok(rejected)
}

/// Records the external booking id. A request can be confirmed once; the
/// store's guarded update refuses a second confirmation.
pub async fn confirm_to_crm(
    state: &AppState,
    id: Uuid,
    crm_booking_id: &str,
) -> Result<BookingRequest, BookingError> {
    let crm_booking_id = crm_booking_id.trim();
    if crm_booking_id.is_empty() {
        return Err(BookingError::Validation(
            "external booking id must not be empty".to_string(),
        ));
    }

    ensure_transition(state, id, BookingStatus::Confirmed).await?;

    let now = state.clock.now();
    let Some(confirmed) = state
        .store
        .confirm_booking_to_crm(id, crm_booking_id, now)
        .await?
    else {
        return Err(lost_race(state, id, BookingStatus::Confirmed).await);
    };

    info!(booking_request_id = %id, crm_booking_id, "Booking request confirmed");
    Ok(confirmed)
}

/// Pending requests, oldest first, with how long each has been waiting.
pub async fn list_pending(
    state: &AppState,
    tenant_id: Option<Uuid>,
) -> Result<Vec<PendingBookingRequest>, BookingError> {
    let now = state.clock.now();
    let pending = state.store.pending_booking_requests(tenant_id).await?;

    Ok(pending
        .into_iter()
        .map(|request| PendingBookingRequest {
            waiting_minutes: now.signed_duration_since(request.created_at).num_minutes().max(0),
            notification_count: request.notification_count,
            request,
        })
        .collect())
}

async fn ensure_transition(
    state: &AppState,
    id: Uuid,
    to: BookingStatus,
) -> Result<BookingRequest, BookingError> {
    let current = state
        .store
        .booking_request(id)
        .await?
        .ok_or(BookingError::NotFound(id))?;

    if !can_transition(current.status, to) {
        return Err(BookingError::InvalidTransition {
            from: current.status,
            to,
        });
    }
    Ok(current)
}

/// The guarded update matched nothing: someone else moved the request first.
async fn lost_race(state: &AppState, id: Uuid, to: BookingStatus) -> BookingError {
    match state.store.booking_request(id).await {
        Ok(Some(current)) => BookingError::InvalidTransition {
            from: current.status,
            to,
        },
        Ok(None) => BookingError::NotFound(id),
        Err(e) => BookingError::Store(e),
    }
}

async fn reply_to_customer(state: &AppState, request: &BookingRequest, text: &str) {
    let Some(conversation_id) = request.conversation_id else {
        return;
    };

    let conversation = match state.store.conversation(conversation_id).await {
        Ok(Some(c)) => c,
        Ok(None) => {
            warn!(conversation_id = %conversation_id, "Conversation not found for booking reply");
            return;
        }
        Err(e) => {
            warn!(conversation_id = %conversation_id, error = %e, "Failed to load conversation");
            return;
        }
    };

    let job = Job::now(JobKind::SendMessage(SendMessageJob {
        tenant_id: request.tenant_id,
        conversation_id,
        customer_id: Some(request.customer_id),
        channel_type: conversation.channel_type,
        channel_account_id: conversation.channel_account_id,
        recipient: conversation.external_user_id,
        content: text.to_string(),
        translate_to: None,
    }));

    if let Err(e) = state.queue.enqueue(job).await {
        warn!(booking_request_id = %request.id, error = %e, "Failed to queue booking reply");
    }
}

fn summarize(request: &BookingRequest) -> String {
    let date = request
        .requested_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .or_else(|| request.requested_date_text.clone())
        .unwrap_or_else(|| "date not given".to_string());
    let time = request
        .requested_time
        .map(|t| format!(" {}", t.format("%H:%M")))
        .unwrap_or_default();
    let treatment = request.treatment_type.as_deref().unwrap_or("unspecified treatment");
    format!("{treatment} on {date}{time}")
}

// ---------------------------------------------------------------------------
// Form replies
// ---------------------------------------------------------------------------

/// Fields pulled out of a filled booking form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedBookingForm {
    pub date: Option<NaiveDate>,
    /// Date as written, kept when it is not a calendar date.
    pub date_text: Option<String>,
    pub time: Option<NaiveTime>,
    pub treatment: Option<String>,
    pub notes: Option<String>,
}

impl ParsedBookingForm {
    pub fn into_request(
        self,
        tenant_id: Uuid,
        customer_id: Uuid,
        conversation_id: Option<Uuid>,
    ) -> NewBookingRequest {
        NewBookingRequest {
            tenant_id,
            customer_id,
            conversation_id,
            requested_date: self.date,
            requested_time: self.time,
            requested_date_text: self.date_text,
            treatment_type: self.treatment,
            special_requests: self.notes,
            metadata: Some(serde_json::json!({ "source": "form" })),
        }
    }
}

fn field_pattern(labels: &str) -> Regex {
    RegexBuilder::new(&format!(r"^[ \t]*[-*•]?[ \t]*(?:{labels})[ \t]*[:：][ \t]*(.+?)[ \t]*$"))
        .case_insensitive(true)
        .multi_line(true)
        .build()
        .expect("form label pattern is valid")
}

static DATE_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    field_pattern(r"희망 ?날짜|예약 ?날짜|날짜|preferred date|date|希望日|日付|预约日期|預約日期|日期")
});
static TIME_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    field_pattern(r"희망 ?시간|예약 ?시간|시간|preferred time|time|希望時間|時間|时间|時間帯")
});
static TREATMENT_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    field_pattern(r"시술|진료|치료|treatment|procedure|施術|治療|治疗|项目|項目")
});
static NOTES_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    field_pattern(r"요청 ?사항|메모|비고|notes?|requests?|ご要望|備考|备注|備註")
});
static DATE_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4})\s*[-./년年]\s*(\d{1,2})\s*[-./월月]\s*(\d{1,2})").expect("date pattern is valid")
});
static TIME_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,2})\s*(?:[:：시時点]\s*(\d{1,2})?)?").expect("time pattern is valid")
});
static PM_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"오후|pm|p\.m\.|午後|下午")
        .case_insensitive(true)
        .build()
        .expect("pm pattern is valid")
});

fn capture(pattern: &Regex, text: &str) -> Option<String> {
    pattern
        .captures(text)
        .map(|caps| caps[1].trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let caps = DATE_VALUE.captures(value)?;
    let year = caps[1].parse().ok()?;
    let month = caps[2].parse().ok()?;
    let day = caps[3].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

pub fn parse_time(value: &str) -> Option<NaiveTime> {
    let caps = TIME_VALUE.captures(value)?;
    let mut hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = caps
        .get(2)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    if hour < 12 && PM_MARKER.is_match(value) {
        hour += 12;
    }
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// Reads a filled booking form. Counts as a form only with a date plus a
/// time or a treatment.
pub fn parse_booking_form(text: &str) -> Option<ParsedBookingForm> {
    let raw_date = capture(&DATE_FIELD, text);
    let raw_time = capture(&TIME_FIELD, text);

    let date = raw_date.as_deref().and_then(parse_date);
    let form = ParsedBookingForm {
        date,
        date_text: raw_date.filter(|_| date.is_none()),
        time: raw_time.as_deref().and_then(parse_time),
        treatment: capture(&TREATMENT_FIELD, text),
        notes: capture(&NOTES_FIELD, text),
    };

    let has_date = form.date.is_some() || form.date_text.is_some();
    let has_detail = form.time.is_some() || form.treatment.is_some();
    (has_date && has_detail).then_some(form)
}
