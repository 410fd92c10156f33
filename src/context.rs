//! Loads the records a trigger refers to and derives what rules read from
//! them: the template variables and the condition fact bag.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use serde_json::{Map, Value, json};
use tracing::warn;
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::error::StoreError;
use crate::models::execution::ExecutionContext;
use crate::store::Store;

pub const DEFAULT_CUSTOMER_NAME: &str = "고객님";
pub const DEFAULT_LANGUAGE: &str = "KO";

/// Fills in missing entity snapshots, then recomputes `variables` and
/// `facts`. Lookups that fail or find nothing leave the snapshot empty.
pub async fn enrich(
    store: &dyn Store,
    settings: &EngineSettings,
    mut ctx: ExecutionContext,
) -> ExecutionContext {
    if ctx.conversation.is_none()
        && let Some(id) = ctx.event.conversation_id
    {
        ctx.conversation = lookup("conversation", id, store.conversation(id).await);
    }

    if ctx.customer.is_none()
        && let Some(id) = ctx.customer_id()
    {
        ctx.customer = lookup("customer", id, store.customer(id).await);
    }

    if ctx.message.is_none()
        && let Some(id) = ctx.event.message_id
    {
        ctx.message = lookup("message", id, store.message(id).await);
    }

    if ctx.booking.is_none()
        && let Some(id) = ctx.event.booking_id
    {
        ctx.booking = lookup("booking", id, store.booking(id).await);
    }

    ctx.variables = build_variables(&ctx, settings);
    ctx.facts = build_facts(&ctx, settings);
    ctx
}

/// Drops the conversation and customer snapshots, which actions may have
/// changed, and enriches again.
pub async fn reload(
    store: &dyn Store,
    settings: &EngineSettings,
    ctx: &ExecutionContext,
) -> ExecutionContext {
    let mut fresh = ctx.clone();
    fresh.conversation = None;
    fresh.customer = None;
    enrich(store, settings, fresh).await
}

fn lookup<T>(entity: &'static str, id: Uuid, result: Result<Option<T>, StoreError>) -> Option<T> {
    match result {
        Ok(found) => {
            if found.is_none() {
                warn!(entity, id = %id, "Referenced record not found");
            }
            found
        }
        Err(e) => {
            warn!(entity, id = %id, error = %e, "Failed to load record for context");
            None
        }
    }
}

pub fn build_variables(ctx: &ExecutionContext, settings: &EngineSettings) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    let customer = ctx.customer.as_ref();

    let name = customer
        .and_then(|c| c.name.as_deref())
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(DEFAULT_CUSTOMER_NAME);
    vars.insert("customer_name".to_string(), name.to_string());

    let language = customer_language(ctx);
    vars.insert("customer_language".to_string(), language.clone());

    if let Some(country) = customer.and_then(|c| c.country.clone()) {
        vars.insert("customer_country".to_string(), country);
    }
    if let Some(tag) = customer.and_then(|c| c.consultation_tag.clone()) {
        vars.insert("consultation_tag".to_string(), tag);
    }

    if let Some(conversation) = &ctx.conversation {
        vars.insert(
            "conversation_status".to_string(),
            conversation.status.as_str().to_string(),
        );
        vars.insert("channel_type".to_string(), conversation.channel_type.clone());
    }

    if let Some(message) = &ctx.message {
        vars.insert("message_content".to_string(), message.content.clone());
    }

    if let Some(booking) = &ctx.booking {
        vars.insert(
            "booking_date".to_string(),
            localized_datetime(booking.booking_date, settings.timezone, &language),
        );
        vars.insert("booking_type".to_string(), booking.booking_type.clone());
    }

    let local = ctx.triggered_at.with_timezone(&settings.timezone);
    vars.insert("current_date".to_string(), local.format("%Y-%m-%d").to_string());
    vars.insert("current_time".to_string(), local.format("%H:%M").to_string());

    vars
}

/// Customer language code, upper-cased, `KO` when unknown.
pub fn customer_language(ctx: &ExecutionContext) -> String {
    ctx.customer
        .as_ref()
        .and_then(|c| c.language.as_deref())
        .or_else(|| ctx.message.as_ref().and_then(|m| m.language.as_deref()))
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_uppercase)
        .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string())
}

pub fn build_facts(ctx: &ExecutionContext, settings: &EngineSettings) -> Value {
    let mut facts = Map::new();

    if let Some(customer) = &ctx.customer
        && let Ok(value) = serde_json::to_value(customer)
    {
        facts.insert("customer".to_string(), value);
    }
    if let Some(conversation) = &ctx.conversation
        && let Ok(value) = serde_json::to_value(conversation)
    {
        facts.insert("conversation".to_string(), value);
    }
    if let Some(message) = &ctx.message
        && let Ok(value) = serde_json::to_value(message)
    {
        facts.insert("message".to_string(), value);
    }
    if let Some(booking) = &ctx.booking
        && let Ok(value) = serde_json::to_value(booking)
    {
        facts.insert("booking".to_string(), value);
    }

    facts.insert(
        "trigger".to_string(),
        json!({
            "type": ctx.trigger.as_str(),
            "previous_status": ctx.event.previous_status,
            "new_status": ctx.event.new_status,
            "tag": ctx.event.tag,
        }),
    );
    facts.insert("time".to_string(), time_facts(ctx.triggered_at, settings));

    Value::Object(facts)
}

/// `time.*` facts in the clinic timezone. Weekdays run 1 (Monday) to 7.
pub fn time_facts(at: DateTime<Utc>, settings: &EngineSettings) -> Value {
    let local = at.with_timezone(&settings.timezone);
    let hour = local.hour();
    let day_of_week = local.weekday().number_from_monday();
    let is_working_hours = day_of_week <= 5
        && hour >= settings.working_hours_start
        && hour < settings.working_hours_end;

    json!({
        "hour": hour,
        "minute": local.minute(),
        "day_of_week": day_of_week,
        "is_working_hours": is_working_hours,
        "date": local.format("%Y-%m-%d").to_string(),
    })
}

/// Formats a timestamp the way each customer language writes dates.
pub fn localized_datetime(at: DateTime<Utc>, tz: Tz, language: &str) -> String {
    let local = at.with_timezone(&tz);
    let pattern = match language.to_uppercase().as_str() {
        "KO" => "%Y년 %-m월 %-d일 %H:%M",
        "JA" | "ZH" => "%Y年%-m月%-d日 %H:%M",
        "VI" | "TH" => "%d/%m/%Y %H:%M",
        "RU" => "%d.%m.%Y %H:%M",
        _ => "%B %-d, %Y %H:%M",
    };
    local.format(pattern).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::db::{Booking, Conversation, ConversationStatus, Customer};
    use crate::models::execution::TriggerContext;
    use crate::models::rule::TriggerType;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn customer(tenant_id: Uuid, name: Option<&str>, language: Option<&str>) -> Customer {
        Customer {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.map(str::to_string),
            language: language.map(str::to_string),
            country: Some("JP".to_string()),
            phone: None,
            tags: vec!["vip".to_string()],
            consultation_tag: None,
            crm_customer_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn conversation(tenant_id: Uuid, customer_id: Uuid) -> Conversation {
        Conversation {
            id: Uuid::new_v4(),
            tenant_id,
            customer_id,
            channel_type: "line".to_string(),
            channel_account_id: Some("acct-1".to_string()),
            external_user_id: Some("U123".to_string()),
            status: ConversationStatus::Active,
            assigned_to: None,
            last_customer_message_at: None,
            last_reply_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn customer_is_inferred_from_conversation() {
        let store = MemoryStore::new();
        let tenant = Uuid::new_v4();
        let cust = customer(tenant, Some("Yuki"), Some("ja"));
        let conv = conversation(tenant, cust.id);
        store.insert_customer(cust.clone());
        store.insert_conversation(conv.clone());

        let event = TriggerContext {
            tenant_id: Some(tenant),
            conversation_id: Some(conv.id),
            ..Default::default()
        };
        let ctx = ExecutionContext::new(TriggerType::MessageReceived, event, Utc::now());
        let ctx = enrich(&store, &EngineSettings::default(), ctx).await;

        assert_eq!(ctx.customer.as_ref().map(|c| c.id), Some(cust.id));
        assert_eq!(ctx.variables["customer_name"], "Yuki");
        assert_eq!(ctx.variables["customer_language"], "JA");
        assert_eq!(ctx.variables["channel_type"], "line");
        assert_eq!(ctx.facts["customer"]["country"], "JP");
        assert_eq!(ctx.facts["conversation"]["status"], "active");
    }

    #[tokio::test]
    async fn unknown_ids_leave_snapshots_empty() {
        let store = MemoryStore::new();
        let event = TriggerContext {
            tenant_id: Some(Uuid::new_v4()),
            conversation_id: Some(Uuid::new_v4()),
            message_id: Some(Uuid::new_v4()),
            ..Default::default()
        };
        let ctx = ExecutionContext::new(TriggerType::MessageReceived, event, Utc::now());
        let ctx = enrich(&store, &EngineSettings::default(), ctx).await;

        assert!(ctx.conversation.is_none());
        assert!(ctx.message.is_none());
        assert_eq!(ctx.variables["customer_name"], DEFAULT_CUSTOMER_NAME);
        assert_eq!(ctx.variables["customer_language"], DEFAULT_LANGUAGE);
        assert!(ctx.facts.get("customer").is_none());
    }

    #[tokio::test]
    async fn booking_date_is_localized_in_clinic_timezone() {
        let store = MemoryStore::new();
        let tenant = Uuid::new_v4();
        let cust = customer(tenant, None, Some("ko"));
        let booking = Booking {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            customer_id: cust.id,
            // 05:00 UTC is 14:00 in Seoul.
            booking_date: Utc.with_ymd_and_hms(2025, 3, 15, 5, 0, 0).unwrap(),
            booking_type: "lasik consultation".to_string(),
            status: "confirmed".to_string(),
            crm_booking_id: None,
            created_at: Utc::now(),
        };
        store.insert_customer(cust.clone());
        store.insert_booking(booking.clone());

        let event = TriggerContext {
            tenant_id: Some(tenant),
            customer_id: Some(cust.id),
            booking_id: Some(booking.id),
            ..Default::default()
        };
        let ctx = ExecutionContext::new(TriggerType::BookingConfirmed, event, Utc::now());
        let ctx = enrich(&store, &EngineSettings::default(), ctx).await;

        assert_eq!(ctx.variables["booking_date"], "2025년 3월 15일 14:00");
        assert_eq!(ctx.variables["booking_type"], "lasik consultation");
        assert_eq!(ctx.variables["customer_name"], DEFAULT_CUSTOMER_NAME);
    }

    #[test]
    fn working_hours_follow_clinic_timezone() {
        let settings = EngineSettings::default();
        // Monday 2025-03-17 01:00 UTC is 10:00 in Seoul.
        let monday_morning = Utc.with_ymd_and_hms(2025, 3, 17, 1, 0, 0).unwrap();
        let facts = time_facts(monday_morning, &settings);
        assert_eq!(facts["hour"], 10);
        assert_eq!(facts["day_of_week"], 1);
        assert_eq!(facts["is_working_hours"], true);

        // Saturday 2025-03-22 01:00 UTC.
        let saturday = Utc.with_ymd_and_hms(2025, 3, 22, 1, 0, 0).unwrap();
        let facts = time_facts(saturday, &settings);
        assert_eq!(facts["day_of_week"], 6);
        assert_eq!(facts["is_working_hours"], false);
    }

    #[test]
    fn english_is_the_fallback_date_format() {
        let at = Utc.with_ymd_and_hms(2025, 3, 15, 5, 0, 0).unwrap();
        assert_eq!(
            localized_datetime(at, chrono_tz::Asia::Seoul, "EN"),
            "March 15, 2025 14:00"
        );
        assert_eq!(
            localized_datetime(at, chrono_tz::Asia::Seoul, "ja"),
            "2025年3月15日 14:00"
        );
    }
}
