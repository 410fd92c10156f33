use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::booking;
use crate::conditions;
use crate::context::{self, customer_language};
use crate::models::booking::NewBookingRequest;
use crate::models::db::{Conversation, ConversationStatus, Customer, NewEscalation};
use crate::models::execution::{ActionOutcome, ExecutionContext};
use crate::models::payloads::{
    CrmOperation, CrmSyncJob, Job, JobKind, NotificationJob, SendMessageJob, SurveyJob,
};
use crate::models::rule::{
    ActionSpec, AutomationAction, AutomationRule, BranchConfig, CrmBookingConfig, DelayConfig,
    EscalationConfig, SendMessageConfig, SurveyConfig, WebhookConfig,
};
use crate::template::{interpolate, interpolate_json};
use crate::webhook::WebhookRequest;

enum Done {
    Completed,
    Skipped(String),
}

/// Runs a rule's pipeline in order. Failures are recorded and the pipeline
/// moves on; branches splice their chosen list in place of themselves.
/// After an action changes the conversation or customer, the context is
/// reloaded so later actions and branches see the new state.
pub async fn execute_actions(
    state: &AppState,
    rule: &AutomationRule,
    ctx: &ExecutionContext,
) -> Vec<ActionOutcome> {
    let mut outcomes = Vec::with_capacity(rule.actions.len());
    let mut work: Vec<&ActionSpec> = rule.actions.iter().rev().collect();
    let mut reloaded: Option<ExecutionContext> = None;
    let mut stale = false;

    while let Some(spec) = work.pop() {
        if stale {
            let current = reloaded.as_ref().unwrap_or(ctx);
            reloaded = Some(context::reload(state.store.as_ref(), &state.settings, current).await);
            stale = false;
        }
        let ctx = reloaded.as_ref().unwrap_or(ctx);

        if let ActionSpec::Known(AutomationAction::Branch(branch)) = spec {
            let (matched, chosen) = choose_branch(branch, ctx);
            info!(
                rule_id = %rule.id,
                matched,
                actions = chosen.len(),
                "Branch evaluated"
            );
            outcomes.push(ActionOutcome::ok("branch"));
            work.extend(chosen.iter().rev());
            continue;
        }

        let outcome = execute_action(state, rule, spec, ctx).await;
        stale = outcome.success && !outcome.skipped && spec.mutates_snapshot();
        outcomes.push(outcome);
    }

    outcomes
}

fn choose_branch<'a>(branch: &'a BranchConfig, ctx: &ExecutionContext) -> (bool, &'a [ActionSpec]) {
    if conditions::evaluate(&branch.conditions, &ctx.facts) {
        (true, &branch.then_actions)
    } else {
        (false, &branch.else_actions)
    }
}

/// Executes one action and reports its outcome. Never returns an error:
/// failures become a failed outcome.
pub async fn execute_action(
    state: &AppState,
    rule: &AutomationRule,
    spec: &ActionSpec,
    ctx: &ExecutionContext,
) -> ActionOutcome {
    let action_type = spec.type_name().to_string();

    let action = match spec {
        ActionSpec::Known(action) => action,
        ActionSpec::Unsupported { action_type, .. } => {
            warn!(rule_id = %rule.id, action_type, "Unsupported action type, skipping");
            return ActionOutcome::skipped(action_type.as_str(), "unsupported action type");
        }
        ActionSpec::Invalid { action_type, error, .. } => {
            error!(
                rule_id = %rule.id,
                action_type = %action_type,
                error = %error,
                "Action config does not parse"
            );
            return ActionOutcome::failed(
                action_type.as_str(),
                format!("invalid {action_type} config: {error}"),
            );
        }
    };

    let result = match action {
        AutomationAction::SendMessage(cfg) => send_message(state, cfg, ctx).await,
        AutomationAction::SendInternalNote(cfg) => {
            internal_note(state, &interpolate(&cfg.note, &ctx.variables), ctx).await
        }
        AutomationAction::SendNotification(cfg) => {
            let job = JobKind::SendNotification(NotificationJob {
                tenant_id: rule.tenant_id,
                channels: cfg.channels.clone(),
                recipients: cfg.recipients.clone(),
                message: interpolate(&cfg.message, &ctx.variables),
                conversation_id: ctx.conversation_id(),
            });
            enqueue(state, Job::now(job)).await
        }
        AutomationAction::AssignConversation(cfg) => assign(state, cfg.agent_id, ctx).await,
        AutomationAction::UpdateConversationStatus(cfg) => {
            update_status(state, cfg.status, ctx).await
        }
        AutomationAction::AddCustomerTag(cfg) => {
            edit_tags(state, &interpolate(&cfg.tag, &ctx.variables), true, ctx).await
        }
        AutomationAction::RemoveCustomerTag(cfg) => {
            edit_tags(state, &interpolate(&cfg.tag, &ctx.variables), false, ctx).await
        }
        AutomationAction::UpdateConsultationTag(cfg) => {
            consultation_tag(state, &interpolate(&cfg.tag, &ctx.variables), ctx).await
        }
        AutomationAction::CreateCrmBooking(cfg) => crm_booking(state, rule, cfg, ctx).await,
        AutomationAction::UpdateCrmCustomer(cfg) => {
            let fields = cfg
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), interpolate(v, &ctx.variables)))
                .collect();
            crm_sync(state, CrmOperation::UpdateCustomer { fields }, ctx).await
        }
        AutomationAction::AddCrmNote(cfg) => {
            let note = interpolate(&cfg.note, &ctx.variables);
            crm_sync(state, CrmOperation::AddNote { note }, ctx).await
        }
        AutomationAction::SendSatisfactionSurvey(cfg) => survey(state, cfg, ctx).await,
        AutomationAction::CreateEscalation(cfg) => escalate(state, rule, cfg, ctx).await,
        AutomationAction::TriggerWebhook(cfg) => webhook(state, cfg, ctx).await,
        AutomationAction::Delay(cfg) => delay(state, cfg).await,
        // Branches are expanded by `execute_actions`; a bare call just reports
        // which side would run.
        AutomationAction::Branch(branch) => {
            let (matched, chosen) = choose_branch(branch, ctx);
            Ok(Done::Skipped(format!(
                "branch matched={matched} resolved to {} actions",
                chosen.len()
            )))
        }
    };

    match result {
        Ok(Done::Completed) => {
            info!(rule_id = %rule.id, action_type, "Action executed");
            ActionOutcome::ok(action_type)
        }
        Ok(Done::Skipped(reason)) => {
            info!(rule_id = %rule.id, action_type, reason, "Action skipped");
            ActionOutcome::skipped(action_type, reason)
        }
        Err(e) => {
            error!(rule_id = %rule.id, action_type, error = %e, "Action failed");
            ActionOutcome::failed(action_type, format!("{e:#}"))
        }
    }
}

fn require_conversation(ctx: &ExecutionContext) -> Result<&Conversation> {
    ctx.conversation
        .as_ref()
        .ok_or_else(|| anyhow!("no conversation in context"))
}

fn require_conversation_id(ctx: &ExecutionContext) -> Result<Uuid> {
    ctx.conversation_id()
        .ok_or_else(|| anyhow!("no conversation in context"))
}

fn require_customer_id(ctx: &ExecutionContext) -> Result<Uuid> {
    ctx.customer_id()
        .ok_or_else(|| anyhow!("no customer in context"))
}

async fn enqueue(state: &AppState, job: Job) -> Result<Done> {
    state
        .queue
        .enqueue(job)
        .await
        .context("Failed to enqueue job")?;
    Ok(Done::Completed)
}

async fn send_message(
    state: &AppState,
    cfg: &SendMessageConfig,
    ctx: &ExecutionContext,
) -> Result<Done> {
    let conversation = require_conversation(ctx)?;
    let job = JobKind::SendMessage(SendMessageJob {
        tenant_id: conversation.tenant_id,
        conversation_id: conversation.id,
        customer_id: ctx.customer_id(),
        channel_type: conversation.channel_type.clone(),
        channel_account_id: conversation.channel_account_id.clone(),
        recipient: conversation.external_user_id.clone(),
        content: interpolate(&cfg.message, &ctx.variables),
        translate_to: cfg.translate.then(|| customer_language(ctx)),
    });
    enqueue(state, Job::now(job)).await
}

async fn internal_note(state: &AppState, note: &str, ctx: &ExecutionContext) -> Result<Done> {
    let conversation = require_conversation(ctx)?;
    state
        .store
        .insert_internal_note(conversation, note, state.clock.now())
        .await?;
    Ok(Done::Completed)
}

async fn assign(state: &AppState, agent_id: Option<Uuid>, ctx: &ExecutionContext) -> Result<Done> {
    let conversation_id = require_conversation_id(ctx)?;
    state
        .store
        .assign_conversation(conversation_id, agent_id, state.clock.now())
        .await?;
    Ok(Done::Completed)
}

async fn update_status(
    state: &AppState,
    status: ConversationStatus,
    ctx: &ExecutionContext,
) -> Result<Done> {
    let conversation_id = require_conversation_id(ctx)?;
    state
        .store
        .update_conversation_status(conversation_id, status, state.clock.now())
        .await?;
    Ok(Done::Completed)
}

async fn load_customer(state: &AppState, ctx: &ExecutionContext) -> Result<Customer> {
    let customer_id = require_customer_id(ctx)?;
    state
        .store
        .customer(customer_id)
        .await?
        .ok_or_else(|| anyhow!("customer {customer_id} not found"))
}

/// Read-modify-write on the tag set. Adding a present tag or removing an
/// absent one writes nothing.
async fn edit_tags(state: &AppState, tag: &str, add: bool, ctx: &ExecutionContext) -> Result<Done> {
    let tag = tag.trim();
    if tag.is_empty() {
        return Err(anyhow!("tag is empty"));
    }

    let customer = load_customer(state, ctx).await?;
    let present = customer.tags.iter().any(|t| t == tag);
    if present == add {
        return Ok(Done::Completed);
    }

    let tags: Vec<String> = if add {
        customer
            .tags
            .iter()
            .cloned()
            .chain(std::iter::once(tag.to_string()))
            .collect()
    } else {
        customer.tags.iter().filter(|t| *t != tag).cloned().collect()
    };

    state
        .store
        .set_customer_tags(customer.id, &tags, state.clock.now())
        .await?;
    Ok(Done::Completed)
}

async fn consultation_tag(state: &AppState, tag: &str, ctx: &ExecutionContext) -> Result<Done> {
    let customer_id = require_customer_id(ctx)?;
    state
        .store
        .set_consultation_tag(customer_id, tag, state.clock.now())
        .await?;
    Ok(Done::Completed)
}

async fn crm_booking(
    state: &AppState,
    rule: &AutomationRule,
    cfg: &CrmBookingConfig,
    ctx: &ExecutionContext,
) -> Result<Done> {
    let customer_id = require_customer_id(ctx)?;
    let conversation_id = ctx.conversation_id();

    let form = ctx
        .message
        .as_ref()
        .and_then(|m| booking::parse_booking_form(&m.content));

    let mut request = match form {
        Some(form) => form.into_request(rule.tenant_id, customer_id, conversation_id),
        None => NewBookingRequest {
            tenant_id: rule.tenant_id,
            customer_id,
            conversation_id,
            ..Default::default()
        },
    };

    if request.treatment_type.is_none() {
        request.treatment_type = cfg
            .treatment_type
            .as_deref()
            .map(|t| interpolate(t, &ctx.variables));
    }
    if let Some(notes) = &cfg.notes {
        let notes = interpolate(notes, &ctx.variables);
        request.special_requests = Some(match request.special_requests.take() {
            Some(existing) => format!("{existing}\n{notes}"),
            None => notes,
        });
    }
    request.metadata = Some(serde_json::json!({
        "source": "automation",
        "rule_id": rule.id,
        "message_id": ctx.message_id(),
    }));

    let created = booking::create_request(state, request).await?;
    info!(rule_id = %rule.id, booking_request_id = %created.id, "Booking request created by rule");
    Ok(Done::Completed)
}

async fn crm_sync(state: &AppState, operation: CrmOperation, ctx: &ExecutionContext) -> Result<Done> {
    let customer_id = require_customer_id(ctx)?;
    let tenant_id = ctx
        .tenant_id()
        .ok_or_else(|| anyhow!("no tenant in context"))?;
    let job = JobKind::CrmSync(CrmSyncJob {
        tenant_id,
        customer_id,
        crm_customer_id: ctx.customer.as_ref().and_then(|c| c.crm_customer_id.clone()),
        operation,
    });
    enqueue(state, Job::now(job)).await
}

async fn survey(state: &AppState, cfg: &SurveyConfig, ctx: &ExecutionContext) -> Result<Done> {
    let conversation = require_conversation(ctx)?;
    let kind = JobKind::SendSatisfactionSurvey(SurveyJob {
        tenant_id: conversation.tenant_id,
        conversation_id: conversation.id,
        customer_id: ctx.customer_id(),
        language: customer_language(ctx),
        message: cfg.message.as_deref().map(|m| interpolate(m, &ctx.variables)),
    });

    let job = match u64::from(cfg.delay_minutes) * 60_000 {
        0 => Job::now(kind),
        delay_ms => Job::delayed(kind, delay_ms),
    };
    enqueue(state, job).await
}

/// `rule:conversation:bucket`, where the bucket is the index of the
/// `bucket_minutes`-wide window containing `at`.
pub fn escalation_key(
    rule_id: Uuid,
    conversation_id: Uuid,
    at: DateTime<Utc>,
    bucket_minutes: i64,
) -> String {
    let bucket = at
        .timestamp()
        .div_euclid(bucket_minutes.max(1).saturating_mul(60));
    format!("{rule_id}:{conversation_id}:{bucket}")
}

async fn escalate(
    state: &AppState,
    rule: &AutomationRule,
    cfg: &EscalationConfig,
    ctx: &ExecutionContext,
) -> Result<Done> {
    let conversation_id = require_conversation_id(ctx)?;
    let now = state.clock.now();
    let key = escalation_key(
        rule.id,
        conversation_id,
        now,
        state.settings.escalation_dedup_minutes,
    );

    let created = state
        .store
        .create_escalation(
            NewEscalation {
                tenant_id: rule.tenant_id,
                conversation_id,
                message_id: ctx.message_id(),
                customer_id: ctx.customer_id(),
                rule_id: Some(rule.id),
                reason: interpolate(&cfg.reason, &ctx.variables),
                priority: cfg.priority,
                idempotency_key: Some(key.clone()),
            },
            now,
        )
        .await?;

    let Some(escalation) = created else {
        return Ok(Done::Skipped(format!("duplicate escalation {key}")));
    };

    info!(
        escalation_id = %escalation.id,
        conversation_id = %conversation_id,
        priority = escalation.priority.as_str(),
        "Escalation created"
    );

    state
        .store
        .update_conversation_status(conversation_id, ConversationStatus::Escalated, now)
        .await?;
    Ok(Done::Completed)
}

async fn webhook(state: &AppState, cfg: &WebhookConfig, ctx: &ExecutionContext) -> Result<Done> {
    let request = WebhookRequest {
        url: interpolate(&cfg.url, &ctx.variables),
        method: cfg.method,
        headers: cfg
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), interpolate(v, &ctx.variables)))
            .collect(),
        body: cfg.body.as_ref().map(|b| interpolate_json(b, &ctx.variables)),
    };

    let status = state.webhooks.deliver(&request).await?;
    if !(200..300).contains(&status) {
        return Err(anyhow!("webhook {} returned HTTP {status}", request.url));
    }
    Ok(Done::Completed)
}

async fn delay(state: &AppState, cfg: &DelayConfig) -> Result<Done> {
    let requested = cfg.as_duration();
    let max = state.settings.max_inline_delay;
    if requested > max {
        warn!(
            requested_secs = requested.as_secs(),
            max_secs = max.as_secs(),
            "Delay clamped to maximum inline delay"
        );
    }
    tokio::time::sleep(requested.min(max)).await;
    Ok(Done::Completed)
}
