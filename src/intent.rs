//! Booking intent detection on inbound customer messages.
//!
//! The model is asked for strict JSON, but its reply is read defensively:
//! code fences are stripped, the first JSON object is extracted and unknown
//! enum values collapse to `none`. When the model fails or answers nonsense a
//! keyword matcher takes over, so [`detect`] itself never fails.

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use chrono::{NaiveDate, NaiveTime};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::booking;
use crate::config::EngineSettings;
use crate::context::DEFAULT_LANGUAGE;
use crate::llm::{LlmClient, LlmRequest};
use crate::models::booking::{
    BookingIntent, BookingRequest, IntentEntities, IntentSource, IntentType, NewBookingRequest,
    RecommendedAction,
};
use crate::models::db::Message;
use crate::models::payloads::{Job, JobKind, SendMessageJob};

const HISTORY_LIMIT: i64 = 10;
const KEYWORD_CONFIDENCE: f64 = 0.6;

const SYSTEM_PROMPT: &str = r#"You classify messages that patients send to a medical clinic.
Decide whether the latest customer message expresses an intent to book, change or cancel an appointment.
Reply with a single JSON object and nothing else, using exactly these keys:
{
  "detected": true | false,
  "confidence": number between 0 and 1,
  "intent_type": "inquiry" | "request" | "modification" | "cancellation" | "none",
  "entities": {
    "date": "YYYY-MM-DD" or null,
    "date_text": the date exactly as the customer wrote it, or null,
    "time": "HH:MM" (24h) or null,
    "treatment": string or null,
    "notes": string or null
  },
  "recommended_action": "send_form" | "ask_details" | "confirm_booking" | "escalate" | "none",
  "suggested_response": a short, polite reply written in the customer's language
}
Use "confirm_booking" only when the date, time and treatment are all clear.
Use "send_form" when the customer wants to book but gave few details."#;

pub async fn detect(
    llm: &dyn LlmClient,
    settings: &EngineSettings,
    message: &str,
    history: &[Message],
    language: &str,
) -> BookingIntent {
    let request = LlmRequest {
        system_prompt: SYSTEM_PROMPT.to_string(),
        user_prompt: user_prompt(message, history, language),
        model: settings.llm_model.clone(),
        temperature: settings.llm_temperature,
        max_tokens: settings.llm_max_tokens,
    };

    match llm.complete(&request).await {
        Ok(reply) => match parse_intent_reply(&reply) {
            Some(intent) => intent,
            None => {
                warn!(reply_preview = preview(&reply), "Unparseable intent reply, using keywords");
                keyword_intent(message, language)
            }
        },
        Err(e) => {
            warn!(error = %e, "Intent model call failed, using keywords");
            keyword_intent(message, language)
        }
    }
}

fn preview(text: &str) -> &str {
    match text.char_indices().nth(80) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn user_prompt(message: &str, history: &[Message], language: &str) -> String {
    let mut prompt = format!("Customer language: {language}\n");
    if !history.is_empty() {
        prompt.push_str("Recent conversation:\n");
        for m in history {
            prompt.push_str(&format!("{}: {}\n", m.sender_type, m.content));
        }
    }
    prompt.push_str(&format!("Latest customer message:\n{message}"));
    prompt
}

/// Reads a model reply into an intent. `None` when no JSON object is found.
pub fn parse_intent_reply(raw: &str) -> Option<BookingIntent> {
    let unfenced: String = raw
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n");
    let object = first_json_object(&unfenced)?;
    let value: Value = serde_json::from_str(object).ok()?;
    let map = value.as_object()?;

    let text = |v: Option<&Value>| -> Option<String> {
        v.and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
            .map(str::to_string)
    };

    let confidence = match map.get("confidence") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };
    let confidence = if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };

    let entities = map.get("entities").and_then(Value::as_object);
    let field = |key: &str| text(entities.and_then(|e| e.get(key)));

    let raw_date = field("date");
    let date = raw_date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok().or_else(|| booking::parse_date(d)));
    let date_text = field("date_text").or_else(|| raw_date.filter(|_| date.is_none()));
    let time = field("time").as_deref().and_then(|t| {
        NaiveTime::parse_from_str(t, "%H:%M")
            .ok()
            .or_else(|| booking::parse_time(t))
    });

    Some(BookingIntent {
        detected: map.get("detected").and_then(Value::as_bool).unwrap_or(false),
        confidence,
        intent_type: text(map.get("intent_type"))
            .map(|s| IntentType::parse(&s))
            .unwrap_or(IntentType::None),
        entities: IntentEntities {
            date,
            date_text,
            time,
            treatment: field("treatment"),
            notes: field("notes"),
        },
        recommended_action: text(map.get("recommended_action"))
            .map(|s| RecommendedAction::parse(&s))
            .unwrap_or(RecommendedAction::None),
        suggested_response: text(map.get("suggested_response")).unwrap_or_default(),
        source: IntentSource::Model,
    })
}

/// Slice of the first balanced `{...}` in `text`, honoring JSON strings.
fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Substring keywords. Stems are fine here since these scripts do not embed
/// them in unrelated words the way English does.
const BOOKING_KEYWORDS: &[(&str, &[&str])] = &[
    ("KO", &["예약", "방문 일정", "상담 받고"]),
    ("JA", &["予約", "アポ"]),
    ("ZH", &["预约", "預約", "预定", "挂号", "掛號"]),
    ("VI", &["đặt lịch", "đặt hẹn", "lịch hẹn"]),
    ("TH", &["จอง", "นัด"]),
    ("RU", &["запис", "бронир", "приём"]),
];

/// English keywords need whole words: "book" must not hit "facebook".
static EN_BOOKING_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(
        r"\b(?:book|booking|booked|appointments?|reserve|reservations?|schedule\s+(?:a|an|my)\s+(?:visit|appointment|consultation))\b",
    )
    .case_insensitive(true)
    .build()
    .expect("english keyword pattern is valid")
});

fn canned_reply(language: &str) -> &'static str {
    match language.to_uppercase().as_str() {
        "KO" => "예약을 도와드리겠습니다. 희망하시는 날짜와 시간, 시술 내용을 알려주세요.",
        "JA" => "ご予約を承ります。ご希望の日時と施術内容をお知らせください。",
        "ZH" => "我们很乐意为您安排预约。请告诉我们您希望的日期、时间和项目。",
        "VI" => "Chúng tôi rất sẵn lòng hỗ trợ đặt lịch. Vui lòng cho biết ngày giờ và dịch vụ bạn mong muốn.",
        "TH" => "ยินดีช่วยจองนัดค่ะ กรุณาแจ้งวันเวลาและบริการที่ต้องการ",
        "RU" => "Мы с радостью поможем записаться. Пожалуйста, укажите желаемую дату, время и процедуру.",
        _ => "We'd be happy to help you book. Please tell us your preferred date, time and treatment.",
    }
}

/// Keyword fallback. Keywords of every language are checked since customers
/// do not always write in their profile language; the reply uses `language`.
pub fn keyword_intent(message: &str, language: &str) -> BookingIntent {
    let lowered = message.to_lowercase();
    let hit = EN_BOOKING_KEYWORDS.is_match(message)
        || BOOKING_KEYWORDS
            .iter()
            .flat_map(|(_, words)| words.iter())
            .any(|word| lowered.contains(word));

    if !hit {
        return BookingIntent::not_detected(IntentSource::Keywords);
    }

    BookingIntent {
        detected: true,
        confidence: KEYWORD_CONFIDENCE,
        intent_type: IntentType::Inquiry,
        entities: IntentEntities::default(),
        recommended_action: RecommendedAction::AskDetails,
        suggested_response: canned_reply(language).to_string(),
        source: IntentSource::Keywords,
    }
}

/// Form appended to replies whose recommended action is `send_form`. Labels
/// match what [`booking::parse_booking_form`] reads back.
pub fn booking_form_prompt(language: &str) -> &'static str {
    match language.to_uppercase().as_str() {
        "KO" => "[예약 신청서]\n날짜: \n시간: \n시술: \n요청사항: ",
        "JA" => "[ご予約フォーム]\n日付：\n時間：\n施術：\n備考：",
        "ZH" => "[预约表]\n日期：\n时间：\n项目：\n备注：",
        _ => "[Booking form]\nDate: \nTime: \nTreatment: \nNotes: ",
    }
}

// ---------------------------------------------------------------------------
// Inbound message handling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub tenant_id: Uuid,
    pub conversation_id: Uuid,
    pub customer_id: Uuid,
    pub message_id: Uuid,
    pub content: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InboundOutcome {
    pub intent: Option<BookingIntent>,
    pub booking_request: Option<BookingRequest>,
    pub replied: bool,
}

/// Runs detection on a customer message. A filled form or a confident
/// `confirm_booking` intent becomes a pending booking request; otherwise the
/// suggested reply (plus the form, when asked for) goes back to the customer.
pub async fn handle_inbound_message(
    state: &AppState,
    inbound: &InboundMessage,
) -> Result<InboundOutcome> {
    let content = inbound.content.trim();
    if content.is_empty() {
        return Ok(InboundOutcome::default());
    }

    if let Some(form) = booking::parse_booking_form(content) {
        info!(
            conversation_id = %inbound.conversation_id,
            "Booking form reply received"
        );
        let request = form.into_request(
            inbound.tenant_id,
            inbound.customer_id,
            Some(inbound.conversation_id),
        );
        let created = booking::create_request(state, request).await?;
        return Ok(InboundOutcome {
            booking_request: Some(created),
            ..Default::default()
        });
    }

    let language = resolve_language(state, inbound).await;
    let history = match state
        .store
        .recent_messages(inbound.conversation_id, HISTORY_LIMIT)
        .await
    {
        Ok(messages) => messages
            .into_iter()
            .filter(|m| m.id != inbound.message_id)
            .collect(),
        Err(e) => {
            warn!(conversation_id = %inbound.conversation_id, error = %e, "Failed to load history");
            Vec::new()
        }
    };

    let intent = detect(
        state.llm.as_ref(),
        &state.settings,
        content,
        &history,
        &language,
    )
    .await;

    info!(
        conversation_id = %inbound.conversation_id,
        detected = intent.detected,
        confidence = intent.confidence,
        intent_type = ?intent.intent_type,
        recommended_action = ?intent.recommended_action,
        source = ?intent.source,
        "Booking intent classified"
    );

    let mut outcome = InboundOutcome::default();
    if !intent.detected {
        outcome.intent = Some(intent);
        return Ok(outcome);
    }

    if intent.confidence >= state.settings.intent_confidence_threshold
        && intent.recommended_action == RecommendedAction::ConfirmBooking
    {
        let request = NewBookingRequest {
            tenant_id: inbound.tenant_id,
            customer_id: inbound.customer_id,
            conversation_id: Some(inbound.conversation_id),
            requested_date: intent.entities.date,
            requested_time: intent.entities.time,
            requested_date_text: intent.entities.date_text.clone(),
            treatment_type: intent.entities.treatment.clone(),
            special_requests: intent.entities.notes.clone(),
            metadata: Some(serde_json::json!({
                "source": "intent",
                "confidence": intent.confidence,
                "message_id": inbound.message_id,
            })),
        };
        outcome.booking_request = Some(booking::create_request(state, request).await?);
    }

    if state.settings.intent_auto_reply && !intent.suggested_response.trim().is_empty() {
        let mut reply = intent.suggested_response.clone();
        if intent.recommended_action == RecommendedAction::SendForm {
            reply.push_str("\n\n");
            reply.push_str(booking_form_prompt(&language));
        }
        outcome.replied = send_reply(state, inbound, reply).await?;
    }

    outcome.intent = Some(intent);
    Ok(outcome)
}

async fn resolve_language(state: &AppState, inbound: &InboundMessage) -> String {
    if let Some(lang) = inbound.language.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
        return lang.to_uppercase();
    }
    match state.store.customer(inbound.customer_id).await {
        Ok(Some(customer)) => customer
            .language
            .map(|l| l.trim().to_uppercase())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
        _ => DEFAULT_LANGUAGE.to_string(),
    }
}

async fn send_reply(state: &AppState, inbound: &InboundMessage, content: String) -> Result<bool> {
    let conversation = state
        .store
        .conversation(inbound.conversation_id)
        .await?
        .ok_or_else(|| anyhow!("conversation {} not found", inbound.conversation_id))?;

    let job = Job::now(JobKind::SendMessage(SendMessageJob {
        tenant_id: inbound.tenant_id,
        conversation_id: conversation.id,
        customer_id: Some(inbound.customer_id),
        channel_type: conversation.channel_type,
        channel_account_id: conversation.channel_account_id,
        recipient: conversation.external_user_id,
        content,
        translate_to: None,
    }));
    state.queue.enqueue(job).await?;
    Ok(true)
}
