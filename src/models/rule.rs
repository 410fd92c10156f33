use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{RuleError, UnknownVariant};
use crate::models::db::{ConversationStatus, EscalationPriority};

pub const MAX_CONDITION_DEPTH: usize = 8;
pub const MAX_CONDITION_NODES: usize = 256;
pub const MAX_BRANCH_DEPTH: usize = 4;
pub const MAX_ACTIONS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerType {
    #[serde(rename = "message_received")]
    MessageReceived,
    #[serde(rename = "conversation_created")]
    ConversationCreated,
    #[serde(rename = "status_changed")]
    StatusChanged,
    #[serde(rename = "booking_confirmed")]
    BookingConfirmed,
    #[serde(rename = "booking_cancelled")]
    BookingCancelled,
    #[serde(rename = "no_response_24h")]
    NoResponse24h,
    #[serde(rename = "no_response_48h")]
    NoResponse48h,
    #[serde(rename = "customer_idle_7d")]
    CustomerIdle7d,
    #[serde(rename = "escalation_created")]
    EscalationCreated,
    #[serde(rename = "escalation_resolved")]
    EscalationResolved,
    #[serde(rename = "tag_added")]
    TagAdded,
    #[serde(rename = "schedule_cron")]
    ScheduleCron,
}

impl TriggerType {
    pub const ALL: [TriggerType; 12] = [
        Self::MessageReceived,
        Self::ConversationCreated,
        Self::StatusChanged,
        Self::BookingConfirmed,
        Self::BookingCancelled,
        Self::NoResponse24h,
        Self::NoResponse48h,
        Self::CustomerIdle7d,
        Self::EscalationCreated,
        Self::EscalationResolved,
        Self::TagAdded,
        Self::ScheduleCron,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageReceived => "message_received",
            Self::ConversationCreated => "conversation_created",
            Self::StatusChanged => "status_changed",
            Self::BookingConfirmed => "booking_confirmed",
            Self::BookingCancelled => "booking_cancelled",
            Self::NoResponse24h => "no_response_24h",
            Self::NoResponse48h => "no_response_48h",
            Self::CustomerIdle7d => "customer_idle_7d",
            Self::EscalationCreated => "escalation_created",
            Self::EscalationResolved => "escalation_resolved",
            Self::TagAdded => "tag_added",
            Self::ScheduleCron => "schedule_cron",
        }
    }
}

impl TryFrom<String> for TriggerType {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == value)
            .ok_or_else(|| UnknownVariant::new("trigger type", value))
    }
}

/// Optional narrowing of a trigger. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
    InList,
    NotInList,
    IsEmpty,
    IsNotEmpty,
    RegexMatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl Condition {
    pub fn new(field: &str, operator: Operator, value: serde_json::Value) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionNode {
    Group(ConditionGroup),
    Leaf(Condition),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub logic: Logic,
    #[serde(default)]
    pub conditions: Vec<ConditionNode>,
}

impl ConditionGroup {
    pub fn and(conditions: Vec<ConditionNode>) -> Self {
        Self {
            logic: Logic::And,
            conditions,
        }
    }

    pub fn or(conditions: Vec<ConditionNode>) -> Self {
        Self {
            logic: Logic::Or,
            conditions,
        }
    }

    pub fn all_of(conditions: Vec<Condition>) -> Self {
        Self::and(conditions.into_iter().map(ConditionNode::Leaf).collect())
    }

    pub fn any_of(conditions: Vec<Condition>) -> Self {
        Self::or(conditions.into_iter().map(ConditionNode::Leaf).collect())
    }

    /// Checks depth and node-count bounds without recursing.
    pub fn validate(&self) -> Result<(), RuleError> {
        let mut pending: Vec<(&ConditionGroup, usize)> = vec![(self, 1)];
        let mut nodes = 0usize;

        while let Some((group, depth)) = pending.pop() {
            if depth > MAX_CONDITION_DEPTH {
                return Err(RuleError::ConditionTooDeep {
                    max: MAX_CONDITION_DEPTH,
                });
            }
            nodes += 1 + group.conditions.len();
            if nodes > MAX_CONDITION_NODES {
                return Err(RuleError::ConditionTooLarge {
                    max: MAX_CONDITION_NODES,
                });
            }
            for child in &group.conditions {
                if let ConditionNode::Group(nested) = child {
                    pending.push((nested, depth + 1));
                }
            }
        }

        Ok(())
    }
}

impl From<Condition> for ConditionNode {
    fn from(condition: Condition) -> Self {
        ConditionNode::Leaf(condition)
    }
}

impl From<ConditionGroup> for ConditionNode {
    fn from(group: ConditionGroup) -> Self {
        ConditionNode::Group(group)
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageConfig {
    pub message: String,
    #[serde(default)]
    pub translate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalNoteConfig {
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub message: String,
    /// e.g. "slack", "sms", "email"
    pub channels: Vec<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignConfig {
    pub agent_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusConfig {
    pub status: ConversationStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagConfig {
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmBookingConfig {
    #[serde(default)]
    pub treatment_type: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmCustomerConfig {
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmNoteConfig {
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyConfig {
    #[serde(default)]
    pub delay_minutes: u32,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationConfig {
    pub reason: String,
    #[serde(default = "default_escalation_priority")]
    pub priority: EscalationPriority,
}

fn default_escalation_priority() -> EscalationPriority {
    EscalationPriority::Medium
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayConfig {
    pub duration: u64,
    pub unit: DelayUnit,
}

impl DelayConfig {
    pub fn as_duration(&self) -> std::time::Duration {
        let seconds = match self.unit {
            DelayUnit::Seconds => self.duration,
            DelayUnit::Minutes => self.duration.saturating_mul(60),
            DelayUnit::Hours => self.duration.saturating_mul(3_600),
            DelayUnit::Days => self.duration.saturating_mul(86_400),
        };
        std::time::Duration::from_secs(seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchConfig {
    pub conditions: ConditionGroup,
    #[serde(default)]
    pub then_actions: Vec<ActionSpec>,
    #[serde(default)]
    pub else_actions: Vec<ActionSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum AutomationAction {
    SendMessage(SendMessageConfig),
    SendInternalNote(InternalNoteConfig),
    SendNotification(NotificationConfig),
    AssignConversation(AssignConfig),
    UpdateConversationStatus(StatusConfig),
    AddCustomerTag(TagConfig),
    RemoveCustomerTag(TagConfig),
    UpdateConsultationTag(TagConfig),
    CreateCrmBooking(CrmBookingConfig),
    UpdateCrmCustomer(CrmCustomerConfig),
    AddCrmNote(CrmNoteConfig),
    SendSatisfactionSurvey(SurveyConfig),
    CreateEscalation(EscalationConfig),
    TriggerWebhook(WebhookConfig),
    Delay(DelayConfig),
    Branch(BranchConfig),
}

impl AutomationAction {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SendMessage(_) => "send_message",
            Self::SendInternalNote(_) => "send_internal_note",
            Self::SendNotification(_) => "send_notification",
            Self::AssignConversation(_) => "assign_conversation",
            Self::UpdateConversationStatus(_) => "update_conversation_status",
            Self::AddCustomerTag(_) => "add_customer_tag",
            Self::RemoveCustomerTag(_) => "remove_customer_tag",
            Self::UpdateConsultationTag(_) => "update_consultation_tag",
            Self::CreateCrmBooking(_) => "create_crm_booking",
            Self::UpdateCrmCustomer(_) => "update_crm_customer",
            Self::AddCrmNote(_) => "add_crm_note",
            Self::SendSatisfactionSurvey(_) => "send_satisfaction_survey",
            Self::CreateEscalation(_) => "create_escalation",
            Self::TriggerWebhook(_) => "trigger_webhook",
            Self::Delay(_) => "delay",
            Self::Branch(_) => "branch",
        }
    }
}

/// Every action type name this build can run.
pub const ACTION_TYPES: [&str; 16] = [
    "send_message",
    "send_internal_note",
    "send_notification",
    "assign_conversation",
    "update_conversation_status",
    "add_customer_tag",
    "remove_customer_tag",
    "update_consultation_tag",
    "create_crm_booking",
    "update_crm_customer",
    "add_crm_note",
    "send_satisfaction_survey",
    "create_escalation",
    "trigger_webhook",
    "delay",
    "branch",
];

/// A stored action. Types this build does not know about land in
/// `Unsupported` so the rest of the rule still loads; a known type whose
/// config does not parse lands in `Invalid` with the decode error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ActionSpec {
    Known(AutomationAction),
    Invalid {
        #[serde(rename = "type")]
        action_type: String,
        config: serde_json::Value,
        #[serde(skip_serializing)]
        error: String,
    },
    Unsupported {
        #[serde(rename = "type")]
        action_type: String,
        config: serde_json::Value,
    },
}

impl<'de> Deserialize<'de> for ActionSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(rename = "type")]
            action_type: String,
            #[serde(default)]
            config: serde_json::Value,
        }

        let raw = Raw::deserialize(deserializer)?;
        if !ACTION_TYPES.contains(&raw.action_type.as_str()) {
            return Ok(ActionSpec::Unsupported {
                action_type: raw.action_type,
                config: raw.config,
            });
        }

        let tagged = serde_json::json!({ "type": raw.action_type, "config": raw.config });
        Ok(match serde_json::from_value::<AutomationAction>(tagged) {
            Ok(action) => ActionSpec::Known(action),
            Err(e) => ActionSpec::Invalid {
                action_type: raw.action_type,
                config: raw.config,
                error: e.to_string(),
            },
        })
    }
}

impl ActionSpec {
    pub fn type_name(&self) -> &str {
        match self {
            Self::Known(action) => action.type_name(),
            Self::Invalid { action_type, .. } | Self::Unsupported { action_type, .. } => {
                action_type
            }
        }
    }

    /// Whether a successful run changes the conversation or customer records
    /// that later actions read.
    pub fn mutates_snapshot(&self) -> bool {
        matches!(
            self,
            Self::Known(
                AutomationAction::AssignConversation(_)
                    | AutomationAction::UpdateConversationStatus(_)
                    | AutomationAction::AddCustomerTag(_)
                    | AutomationAction::RemoveCustomerTag(_)
                    | AutomationAction::UpdateConsultationTag(_)
                    | AutomationAction::CreateEscalation(_)
            )
        )
    }
}

impl From<AutomationAction> for ActionSpec {
    fn from(action: AutomationAction) -> Self {
        ActionSpec::Known(action)
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub priority: i32,
    pub trigger_type: TriggerType,
    pub trigger_config: TriggerConfig,
    pub conditions: Option<ConditionGroup>,
    pub actions: Vec<ActionSpec>,
    pub max_executions_per_conversation: Option<i32>,
    pub cooldown_minutes: Option<i32>,
    pub execution_count: i64,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the stored row could not be decoded. Such a rule loads with
    /// empty settings and always fails validation.
    #[serde(skip)]
    pub load_error: Option<String>,
}

impl AutomationRule {
    /// Rejects rules the engine refuses to run: undecodable rows, empty
    /// pipelines and trees beyond the depth/size bounds.
    pub fn validate(&self) -> Result<(), RuleError> {
        if let Some(e) = &self.load_error {
            return Err(RuleError::Malformed(e.clone()));
        }
        if self.actions.is_empty() {
            return Err(RuleError::NoActions);
        }
        if let Some(group) = &self.conditions {
            group.validate()?;
        }

        let mut pending: Vec<(&ActionSpec, usize)> =
            self.actions.iter().map(|a| (a, 1)).collect();
        let mut total = 0usize;

        while let Some((spec, depth)) = pending.pop() {
            total += 1;
            if total > MAX_ACTIONS {
                return Err(RuleError::TooManyActions { max: MAX_ACTIONS });
            }
            if let ActionSpec::Known(AutomationAction::Branch(branch)) = spec {
                if depth > MAX_BRANCH_DEPTH {
                    return Err(RuleError::BranchTooDeep {
                        max: MAX_BRANCH_DEPTH,
                    });
                }
                branch.conditions.validate()?;
                pending.extend(
                    branch
                        .then_actions
                        .iter()
                        .chain(branch.else_actions.iter())
                        .map(|a| (a, depth + 1)),
                );
            }
        }

        Ok(())
    }
}

/// An `automation_rules` row with its JSON columns left untyped, so one
/// malformed rule does not fail the query for its siblings.
#[derive(Debug, Clone, FromRow)]
pub struct RuleRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub priority: i32,
    pub trigger_type: String,
    pub trigger_config: Option<serde_json::Value>,
    pub conditions: Option<serde_json::Value>,
    pub actions: serde_json::Value,
    pub max_executions_per_conversation: Option<i32>,
    pub cooldown_minutes: Option<i32>,
    pub execution_count: i64,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RuleRow {
    /// Decodes the JSON columns. `trigger` is the trigger the row was
    /// selected for. A column that fails to decode leaves its field empty and
    /// sets `load_error`.
    pub fn into_rule(self, trigger: TriggerType) -> AutomationRule {
        let mut errors = Vec::new();

        let trigger_type = TriggerType::try_from(self.trigger_type).unwrap_or_else(|e| {
            errors.push(e.to_string());
            trigger
        });
        let trigger_config = decode_column("trigger_config", self.trigger_config, &mut errors);
        let conditions = decode_column("conditions", self.conditions, &mut errors);
        let actions = decode_column("actions", Some(self.actions), &mut errors);

        AutomationRule {
            id: self.id,
            tenant_id: self.tenant_id,
            name: self.name,
            description: self.description,
            is_active: self.is_active,
            priority: self.priority,
            trigger_type,
            trigger_config,
            conditions,
            actions,
            max_executions_per_conversation: self.max_executions_per_conversation,
            cooldown_minutes: self.cooldown_minutes,
            execution_count: self.execution_count,
            last_executed_at: self.last_executed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            load_error: (!errors.is_empty()).then(|| errors.join("; ")),
        }
    }
}

fn decode_column<T>(column: &str, value: Option<serde_json::Value>, errors: &mut Vec<String>) -> T
where
    T: serde::de::DeserializeOwned + Default,
{
    match value {
        None | Some(serde_json::Value::Null) => T::default(),
        Some(raw) => serde_json::from_value(raw).unwrap_or_else(|e| {
            errors.push(format!("{column}: {e}"));
            T::default()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule_with(actions: Vec<ActionSpec>, conditions: Option<ConditionGroup>) -> AutomationRule {
        AutomationRule {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "test".to_string(),
            description: None,
            is_active: true,
            priority: 1,
            trigger_type: TriggerType::MessageReceived,
            trigger_config: TriggerConfig::default(),
            conditions,
            actions,
            max_executions_per_conversation: None,
            cooldown_minutes: None,
            execution_count: 0,
            last_executed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            load_error: None,
        }
    }

    fn tag_action() -> ActionSpec {
        AutomationAction::AddCustomerTag(TagConfig {
            tag: "vip".to_string(),
        })
        .into()
    }

    #[test]
    fn trigger_names_round_trip_through_serde() {
        for trigger in TriggerType::ALL {
            let encoded = serde_json::to_value(trigger).unwrap();
            assert_eq!(encoded, json!(trigger.as_str()));
            assert_eq!(TriggerType::try_from(trigger.as_str().to_string()).unwrap(), trigger);
        }
    }

    #[test]
    fn unknown_trigger_is_rejected() {
        assert!(TriggerType::try_from("on_full_moon".to_string()).is_err());
    }

    #[test]
    fn action_parses_from_type_and_config() {
        let spec: ActionSpec = serde_json::from_value(json!({
            "type": "create_escalation",
            "config": { "reason": "refund: {{message_content}}", "priority": "high" }
        }))
        .unwrap();

        match spec {
            ActionSpec::Known(AutomationAction::CreateEscalation(cfg)) => {
                assert_eq!(cfg.priority, EscalationPriority::High);
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn unknown_action_type_is_kept_as_unsupported() {
        let spec: ActionSpec = serde_json::from_value(json!({
            "type": "send_fax",
            "config": { "number": "123" }
        }))
        .unwrap();

        assert!(matches!(spec, ActionSpec::Unsupported { ref action_type, .. } if action_type == "send_fax"));
        assert_eq!(spec.type_name(), "send_fax");
    }

    #[test]
    fn known_action_with_bad_config_keeps_the_decode_error() {
        let spec: ActionSpec = serde_json::from_value(json!({
            "type": "create_escalation",
            "config": { "reasons": "refund" }
        }))
        .unwrap();

        match &spec {
            ActionSpec::Invalid { action_type, error, .. } => {
                assert_eq!(action_type, "create_escalation");
                assert!(error.contains("reason"), "error was {error}");
            }
            other => panic!("unexpected action: {other:?}"),
        }
        assert_eq!(spec.type_name(), "create_escalation");
    }

    #[test]
    fn undecodable_row_fails_validation_alone() {
        let row = |conditions: serde_json::Value| RuleRow {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "row".to_string(),
            description: None,
            is_active: true,
            priority: 1,
            trigger_type: "message_received".to_string(),
            trigger_config: Some(json!({})),
            conditions: Some(conditions),
            actions: json!([{ "type": "add_customer_tag", "config": { "tag": "vip" } }]),
            max_executions_per_conversation: None,
            cooldown_minutes: None,
            execution_count: 0,
            last_executed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let good = row(serde_json::Value::Null).into_rule(TriggerType::MessageReceived);
        assert!(good.validate().is_ok());
        assert_eq!(good.actions.len(), 1);

        let bad = row(json!({
            "logic": "and",
            "conditions": [{ "field": "message.content", "operator": "fuzzy_match", "value": "x" }]
        }))
        .into_rule(TriggerType::MessageReceived);
        assert!(bad.conditions.is_none());
        match bad.validate() {
            Err(RuleError::Malformed(e)) => assert!(e.starts_with("conditions:"), "error was {e}"),
            other => panic!("unexpected validation: {other:?}"),
        }
    }

    #[test]
    fn nested_condition_groups_parse() {
        let group: ConditionGroup = serde_json::from_value(json!({
            "logic": "and",
            "conditions": [
                { "field": "customer.country", "operator": "equals", "value": "JP" },
                { "logic": "or", "conditions": [
                    { "field": "message.content", "operator": "contains", "value": "lasik" },
                    { "field": "customer.tags", "operator": "is_empty" }
                ]}
            ]
        }))
        .unwrap();

        assert_eq!(group.conditions.len(), 2);
        assert!(matches!(group.conditions[1], ConditionNode::Group(_)));
        assert!(group.validate().is_ok());
    }

    #[test]
    fn overly_deep_condition_tree_fails_validation() {
        let mut group = ConditionGroup::and(vec![]);
        for _ in 0..MAX_CONDITION_DEPTH {
            group = ConditionGroup::and(vec![group.into()]);
        }
        assert!(matches!(group.validate(), Err(RuleError::ConditionTooDeep { .. })));
    }

    #[test]
    fn rule_without_actions_is_invalid() {
        let rule = rule_with(vec![], None);
        assert!(matches!(rule.validate(), Err(RuleError::NoActions)));
    }

    #[test]
    fn nested_branches_beyond_limit_are_invalid() {
        let mut action = tag_action();
        for _ in 0..=MAX_BRANCH_DEPTH {
            action = AutomationAction::Branch(BranchConfig {
                conditions: ConditionGroup::and(vec![]),
                then_actions: vec![action],
                else_actions: vec![],
            })
            .into();
        }
        let rule = rule_with(vec![action], None);
        assert!(matches!(rule.validate(), Err(RuleError::BranchTooDeep { .. })));
    }

    #[test]
    fn delay_converts_units() {
        let delay = DelayConfig {
            duration: 2,
            unit: DelayUnit::Hours,
        };
        assert_eq!(delay.as_duration().as_secs(), 7_200);
    }
}
