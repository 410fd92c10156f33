//! Per rule + conversation execution cap and cooldown.
//!
//! Check-then-act against the audit log: two concurrent passes can both see
//! room under the cap. Escalations carry their own idempotency key for that.

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::error::StoreError;
use crate::models::execution::ExecutionContext;
use crate::models::rule::AutomationRule;
use crate::store::Store;

pub async fn can_execute(
    store: &dyn Store,
    rule: &AutomationRule,
    ctx: &ExecutionContext,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let Some(conversation_id) = ctx.conversation_id() else {
        return Ok(true);
    };

    if let Some(limit) = rule.max_executions_per_conversation.filter(|l| *l > 0) {
        let count = store
            .count_successful_executions(rule.id, conversation_id)
            .await?;
        if count >= i64::from(limit) {
            info!(
                rule_id = %rule.id,
                conversation_id = %conversation_id,
                count,
                limit,
                "Execution cap reached"
            );
            return Ok(false);
        }
    }

    if let Some(minutes) = rule.cooldown_minutes.filter(|m| *m > 0)
        && let Some(last) = store.last_execution_at(rule.id, conversation_id).await?
    {
        let elapsed = now.signed_duration_since(last);
        if elapsed < Duration::minutes(i64::from(minutes)) {
            info!(
                rule_id = %rule.id,
                conversation_id = %conversation_id,
                elapsed_secs = elapsed.num_seconds(),
                cooldown_minutes = minutes,
                "Cooldown active"
            );
            return Ok(false);
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::execution::{ExecutionResult, TriggerContext};
    use crate::models::rule::{AutomationAction, TagConfig, TriggerConfig, TriggerType};
    use crate::store::MemoryStore;
    use uuid::Uuid;

    fn rule(max: Option<i32>, cooldown: Option<i32>) -> AutomationRule {
        AutomationRule {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "limited".to_string(),
            description: None,
            is_active: true,
            priority: 1,
            trigger_type: TriggerType::MessageReceived,
            trigger_config: TriggerConfig::default(),
            conditions: None,
            actions: vec![
                AutomationAction::AddCustomerTag(TagConfig {
                    tag: "x".to_string(),
                })
                .into(),
            ],
            max_executions_per_conversation: max,
            cooldown_minutes: cooldown,
            execution_count: 0,
            last_executed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            load_error: None,
        }
    }

    fn ctx(conversation_id: Option<Uuid>) -> ExecutionContext {
        ExecutionContext::new(
            TriggerType::MessageReceived,
            TriggerContext {
                tenant_id: Some(Uuid::new_v4()),
                conversation_id,
                ..Default::default()
            },
            Utc::now(),
        )
    }

    fn execution(rule: &AutomationRule, conversation_id: Uuid, success: bool, at: DateTime<Utc>) -> ExecutionResult {
        ExecutionResult {
            id: Uuid::new_v4(),
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            tenant_id: rule.tenant_id,
            conversation_id: Some(conversation_id),
            customer_id: None,
            trigger_type: rule.trigger_type,
            success,
            actions_executed: 1,
            action_results: vec![],
            duration_ms: 1,
            error: None,
            executed_at: at,
        }
    }

    #[tokio::test]
    async fn no_conversation_means_no_limit() {
        let store = MemoryStore::new();
        let rule = rule(Some(1), Some(10));
        assert!(can_execute(&store, &rule, &ctx(None), Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn cap_counts_only_successful_runs() {
        let store = MemoryStore::new();
        let rule = rule(Some(2), None);
        let conv = Uuid::new_v4();
        let now = Utc::now();

        store.insert_execution(&execution(&rule, conv, true, now)).await.unwrap();
        store.insert_execution(&execution(&rule, conv, false, now)).await.unwrap();
        assert!(can_execute(&store, &rule, &ctx(Some(conv)), now).await.unwrap());

        store.insert_execution(&execution(&rule, conv, true, now)).await.unwrap();
        assert!(!can_execute(&store, &rule, &ctx(Some(conv)), now).await.unwrap());
    }

    #[tokio::test]
    async fn cooldown_window_is_measured_from_last_run() {
        let store = MemoryStore::new();
        let rule = rule(None, Some(10));
        let conv = Uuid::new_v4();
        let t0 = Utc::now();

        store.insert_execution(&execution(&rule, conv, false, t0)).await.unwrap();

        let at_5 = t0 + Duration::minutes(5);
        let at_11 = t0 + Duration::minutes(11);
        assert!(!can_execute(&store, &rule, &ctx(Some(conv)), at_5).await.unwrap());
        assert!(can_execute(&store, &rule, &ctx(Some(conv)), at_11).await.unwrap());
    }

    #[tokio::test]
    async fn store_errors_propagate() {
        let store = MemoryStore::new();
        let rule = rule(Some(1), None);
        store.fail_rule(rule.id);
        let result = can_execute(&store, &rule, &ctx(Some(Uuid::new_v4())), Utc::now()).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
