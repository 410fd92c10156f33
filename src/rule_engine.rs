use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::actions;
use crate::conditions;
use crate::context;
use crate::limiter;
use crate::models::execution::{ActionOutcome, ExecutionContext, ExecutionResult, TriggerContext};
use crate::models::rule::{AutomationRule, TriggerConfig, TriggerType};

/// One trigger-processing pass: loads the tenant's active rules for
/// `trigger`, enriches the context once, then runs every eligible rule in
/// priority order. Returns one result per rule that fired or failed.
pub async fn process_trigger(
    state: &AppState,
    trigger: TriggerType,
    event: TriggerContext,
) -> Vec<ExecutionResult> {
    let Some(tenant_id) = event.tenant_id else {
        warn!(trigger = trigger.as_str(), "Trigger without tenant_id ignored");
        return Vec::new();
    };

    let rules = match state.store.active_rules(tenant_id, trigger).await {
        Ok(rules) => rules,
        Err(e) => {
            error!(
                tenant_id = %tenant_id,
                trigger = trigger.as_str(),
                error = %e,
                "Failed to fetch active rules"
            );
            return Vec::new();
        }
    };

    if rules.is_empty() {
        return Vec::new();
    }

    let ctx = ExecutionContext::new(trigger, event, state.clock.now());
    let ctx = context::enrich(state.store.as_ref(), &state.settings, ctx).await;

    info!(
        tenant_id = %tenant_id,
        trigger = trigger.as_str(),
        rules = rules.len(),
        conversation_id = ?ctx.conversation_id(),
        "Processing trigger"
    );

    let mut results = Vec::new();
    for rule in &rules {
        if !trigger_config_matches(&rule.trigger_config, trigger, &ctx.event) {
            debug!(rule_id = %rule.id, "Trigger config does not match event");
            continue;
        }
        if let Some(result) = run_rule(state, rule, &ctx).await {
            results.push(result);
        }
    }

    results
}

/// Narrows `status_changed` and `tag_added` rules to the configured statuses
/// or tag. Unset fields accept anything.
pub fn trigger_config_matches(
    config: &TriggerConfig,
    trigger: TriggerType,
    event: &TriggerContext,
) -> bool {
    match trigger {
        TriggerType::StatusChanged => {
            expected(&config.from_status, event.previous_status.as_deref())
                && expected(&config.to_status, event.new_status.as_deref())
        }
        TriggerType::TagAdded => expected(&config.tag, event.tag.as_deref()),
        _ => true,
    }
}

fn expected(configured: &Option<String>, actual: Option<&str>) -> bool {
    match configured.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        None => true,
        Some(want) => actual.is_some_and(|got| got.trim().eq_ignore_ascii_case(want)),
    }
}

async fn run_rule(
    state: &AppState,
    rule: &AutomationRule,
    ctx: &ExecutionContext,
) -> Option<ExecutionResult> {
    let started = Instant::now();

    if let Err(e) = rule.validate() {
        warn!(rule_id = %rule.id, error = %e, "Rule failed validation");
        let result = failed_result(rule, ctx, format!("invalid rule: {e}"), started, state);
        return Some(record(state, result, false).await);
    }

    match limiter::can_execute(state.store.as_ref(), rule, ctx, state.clock.now()).await {
        Ok(true) => {}
        Ok(false) => return None,
        Err(e) => {
            error!(rule_id = %rule.id, error = %e, "Execution limit check failed");
            let result = failed_result(rule, ctx, format!("limit check failed: {e}"), started, state);
            return Some(record(state, result, false).await);
        }
    }

    if !conditions::matches(rule.conditions.as_ref(), &ctx.facts) {
        debug!(rule_id = %rule.id, "Conditions not met");
        return None;
    }

    info!(
        rule_id = %rule.id,
        rule_name = rule.name,
        priority = rule.priority,
        "Rule matched -> executing actions"
    );

    let outcomes = actions::execute_actions(state, rule, ctx).await;
    let failed = outcomes.iter().filter(|o| !o.success).count();
    let result = ExecutionResult {
        success: failed == 0,
        actions_executed: count_executed(&outcomes),
        error: (failed > 0).then(|| format!("{failed} of {} actions failed", outcomes.len())),
        action_results: outcomes,
        ..failed_result(rule, ctx, String::new(), started, state)
    };

    Some(record(state, result, true).await)
}

/// Actions that actually ran: successful and not skipped.
fn count_executed(outcomes: &[ActionOutcome]) -> i32 {
    outcomes.iter().filter(|o| o.success && !o.skipped).count() as i32
}

fn failed_result(
    rule: &AutomationRule,
    ctx: &ExecutionContext,
    error: String,
    started: Instant,
    state: &AppState,
) -> ExecutionResult {
    ExecutionResult {
        id: Uuid::new_v4(),
        rule_id: rule.id,
        rule_name: rule.name.clone(),
        tenant_id: rule.tenant_id,
        conversation_id: ctx.conversation_id(),
        customer_id: ctx.customer_id(),
        trigger_type: ctx.trigger,
        success: false,
        actions_executed: 0,
        action_results: Vec::new(),
        duration_ms: started.elapsed().as_millis() as i64,
        error: Some(error),
        executed_at: state.clock.now(),
    }
}

/// Persists the audit row and, for rules whose actions ran, bumps the rule's
/// counters. A failed write turns the result into a failure for this rule only.
async fn record(state: &AppState, mut result: ExecutionResult, fired: bool) -> ExecutionResult {
    result.duration_ms = result.duration_ms.max(0);

    if let Err(e) = state.store.insert_execution(&result).await {
        error!(
            rule_id = %result.rule_id,
            execution_id = %result.id,
            error = %e,
            "Failed to record execution"
        );
        result.success = false;
        result.error = Some(match result.error.take() {
            Some(prev) => format!("{prev}; audit write failed: {e}"),
            None => format!("audit write failed: {e}"),
        });
    }

    if fired
        && let Err(e) = state
            .store
            .increment_rule_stats(result.rule_id, result.executed_at)
            .await
    {
        error!(rule_id = %result.rule_id, error = %e, "Failed to update rule stats");
    }

    info!(
        rule_id = %result.rule_id,
        execution_id = %result.id,
        success = result.success,
        actions_executed = result.actions_executed,
        duration_ms = result.duration_ms,
        "Rule execution finished"
    );

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(previous: Option<&str>, new: Option<&str>, tag: Option<&str>) -> TriggerContext {
        TriggerContext {
            previous_status: previous.map(str::to_string),
            new_status: new.map(str::to_string),
            tag: tag.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn empty_config_matches_every_event() {
        let config = TriggerConfig::default();
        assert!(trigger_config_matches(
            &config,
            TriggerType::StatusChanged,
            &event(Some("active"), Some("resolved"), None)
        ));
        assert!(trigger_config_matches(&config, TriggerType::TagAdded, &event(None, None, None)));
    }

    #[test]
    fn status_change_is_narrowed_by_config() {
        let config = TriggerConfig {
            to_status: Some("resolved".to_string()),
            ..Default::default()
        };
        assert!(trigger_config_matches(
            &config,
            TriggerType::StatusChanged,
            &event(Some("active"), Some("Resolved"), None)
        ));
        assert!(!trigger_config_matches(
            &config,
            TriggerType::StatusChanged,
            &event(Some("active"), Some("escalated"), None)
        ));
        assert!(!trigger_config_matches(
            &config,
            TriggerType::StatusChanged,
            &event(Some("active"), None, None)
        ));
    }

    #[test]
    fn tag_config_only_applies_to_tag_added() {
        let config = TriggerConfig {
            tag: Some("vip".to_string()),
            ..Default::default()
        };
        assert!(trigger_config_matches(&config, TriggerType::TagAdded, &event(None, None, Some("VIP"))));
        assert!(!trigger_config_matches(&config, TriggerType::TagAdded, &event(None, None, Some("new"))));
        assert!(trigger_config_matches(&config, TriggerType::MessageReceived, &event(None, None, None)));
    }

    #[test]
    fn skipped_actions_do_not_count_as_executed() {
        let outcomes = vec![
            ActionOutcome::ok("send_message"),
            ActionOutcome::skipped("send_fax", "unsupported action type"),
            ActionOutcome::failed("trigger_webhook", "HTTP 500"),
        ];
        assert_eq!(count_executed(&outcomes), 1);
    }
}
