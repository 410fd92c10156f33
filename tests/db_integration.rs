//! Integration tests for the Postgres store against a real database.
//! Verifies sqlx row mapping and the guarded single-statement updates.
//!
//! Run with: cargo test --test db_integration -- --ignored

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use serde_json::json;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use clinic_automation::error::RuleError;
use clinic_automation::models::booking::{BookingApproval, BookingStatus, NewBookingRequest};
use clinic_automation::models::db::{EscalationPriority, NewEscalation};
use clinic_automation::models::rule::{ActionSpec, TriggerType};
use clinic_automation::store::{PgStore, Store};

async fn get_store() -> PgStore {
    dotenvy::dotenv().ok();
    let db_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&db_url)
        .await
        .expect("Failed to connect to Postgres");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    PgStore::new(pool)
}

async fn seed_conversation(pool: &PgPool, tenant_id: Uuid) -> Result<(Uuid, Uuid)> {
    let customer_id = Uuid::new_v4();
    let conversation_id = Uuid::new_v4();

    sqlx::query("INSERT INTO customers (id, tenant_id, name, language, country) VALUES ($1, $2, $3, 'KO', 'KR')")
        .bind(customer_id)
        .bind(tenant_id)
        .bind("테스트 고객")
        .execute(pool)
        .await?;
    sqlx::query(
        "INSERT INTO conversations (id, tenant_id, customer_id, channel_type, last_customer_message_at) VALUES ($1, $2, $3, 'line', NOW())",
    )
    .bind(conversation_id)
    .bind(tenant_id)
    .bind(customer_id)
    .execute(pool)
    .await?;

    Ok((customer_id, conversation_id))
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn test_rule_deserialization() -> Result<()> {
    let store = get_store().await;
    let tenant_id = Uuid::new_v4();
    let actions = json!([
        { "type": "send_internal_note", "config": { "note": "hello" } },
        { "type": "send_fax", "config": {} }
    ]);

    sqlx::query(
        r#"
        INSERT INTO automation_rules (id, tenant_id, name, priority, trigger_type, actions)
        VALUES ($1, $2, 'db test', 5, 'message_received', $3)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(&actions)
    .execute(store.pool())
    .await?;

    let rules = store.active_rules(tenant_id, TriggerType::MessageReceived).await?;
    println!("Fetched {} rules", rules.len());

    assert_eq!(rules.len(), 1);
    let rule = &rules[0];
    assert!(rule.conditions.is_none());
    assert_eq!(rule.actions.len(), 2);
    assert!(matches!(rule.actions[1], ActionSpec::Unsupported { .. }));
    assert!(rule.validate().is_ok());

    store.increment_rule_stats(rule.id, Utc::now()).await?;
    let rules = store.active_rules(tenant_id, TriggerType::MessageReceived).await?;
    assert_eq!(rules[0].execution_count, 1);

    Ok(())
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn test_malformed_rule_does_not_hide_siblings() -> Result<()> {
    let store = get_store().await;
    let tenant_id = Uuid::new_v4();
    let actions = json!([{ "type": "send_internal_note", "config": { "note": "hi" } }]);
    let bad_conditions = json!({
        "logic": "and",
        "conditions": [{ "field": "message.content", "operator": "fuzzy_match", "value": "x" }]
    });

    for (name, priority, conditions) in [
        ("broken", 1, bad_conditions),
        ("healthy", 2, serde_json::Value::Null),
    ] {
        sqlx::query(
            r#"
            INSERT INTO automation_rules (id, tenant_id, name, priority, trigger_type, conditions, actions)
            VALUES ($1, $2, $3, $4, 'message_received', $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(name)
        .bind(priority)
        .bind(&conditions)
        .bind(&actions)
        .execute(store.pool())
        .await?;
    }

    let rules = store.active_rules(tenant_id, TriggerType::MessageReceived).await?;

    assert_eq!(rules.len(), 2);
    assert_eq!(rules[0].name, "broken");
    assert!(matches!(rules[0].validate(), Err(RuleError::Malformed(_))));
    assert_eq!(rules[1].name, "healthy");
    assert!(rules[1].validate().is_ok());

    Ok(())
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn test_escalation_idempotency() -> Result<()> {
    let store = get_store().await;
    let tenant_id = Uuid::new_v4();
    let (customer_id, conversation_id) = seed_conversation(store.pool(), tenant_id).await?;

    let escalation = NewEscalation {
        tenant_id,
        conversation_id,
        message_id: None,
        customer_id: Some(customer_id),
        rule_id: None,
        reason: "refund request".to_string(),
        priority: EscalationPriority::High,
        idempotency_key: Some(format!("db-test:{conversation_id}:0")),
    };

    let first = store.create_escalation(escalation.clone(), Utc::now()).await?;
    let second = store.create_escalation(escalation, Utc::now()).await?;

    assert!(first.is_some());
    assert_eq!(first.unwrap().priority, EscalationPriority::High);
    assert!(second.is_none());

    Ok(())
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn test_booking_request_lifecycle() -> Result<()> {
    let store = get_store().await;
    let tenant_id = Uuid::new_v4();
    let (customer_id, conversation_id) = seed_conversation(store.pool(), tenant_id).await?;

    let created = store
        .create_booking_request(
            NewBookingRequest {
                tenant_id,
                customer_id,
                conversation_id: Some(conversation_id),
                requested_date_text: Some("다음 주 화요일".to_string()),
                treatment_type: Some("라식".to_string()),
                metadata: Some(json!({ "source": "db-test" })),
                ..Default::default()
            },
            Utc::now(),
        )
        .await?;
    assert_eq!(created.status, BookingStatus::Pending);

    store.record_booking_notification(created.id).await?;
    let pending = store.pending_booking_requests(Some(tenant_id)).await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].notification_count, 1);

    let approval = BookingApproval {
        confirmed_date: NaiveDate::from_ymd_opt(2025, 3, 25),
        alternative_dates: vec!["2025-03-26".to_string()],
        ..Default::default()
    };
    let approved = store
        .approve_booking_request(created.id, &approval, Utc::now())
        .await?
        .expect("pending request approves");
    assert_eq!(approved.status, BookingStatus::Approved);
    assert_eq!(approved.alternative_dates, vec!["2025-03-26".to_string()]);

    let again = store.approve_booking_request(created.id, &approval, Utc::now()).await?;
    assert!(again.is_none());

    let confirmed = store.confirm_booking_to_crm(created.id, "CRM-DB-1", Utc::now()).await?;
    assert!(confirmed.is_some());
    let twice = store.confirm_booking_to_crm(created.id, "CRM-DB-2", Utc::now()).await?;
    assert!(twice.is_none());

    let stored = store.booking_request(created.id).await?.unwrap();
    assert_eq!(stored.crm_booking_id.as_deref(), Some("CRM-DB-1"));
    assert!(store.pending_booking_requests(Some(tenant_id)).await?.is_empty());

    Ok(())
}
