//! Condition-tree evaluation against an execution context's fact bag.
//!
//! Pure: no I/O, never panics on malformed input. String comparisons are
//! case-insensitive; a missing field (absent or JSON `null`) only satisfies
//! `is_empty` and `not_equals`.

use regex::RegexBuilder;
use serde_json::Value;

use crate::models::rule::{Condition, ConditionGroup, ConditionNode, Logic, Operator};

const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Evaluates an optional rule condition tree; no tree means "always".
pub fn matches(conditions: Option<&ConditionGroup>, facts: &Value) -> bool {
    conditions.is_none_or(|group| evaluate(group, facts))
}

struct Frame<'a> {
    group: &'a ConditionGroup,
    next: usize,
    acc: bool,
}

impl<'a> Frame<'a> {
    fn new(group: &'a ConditionGroup) -> Self {
        Self {
            group,
            next: 0,
            acc: group.logic == Logic::And,
        }
    }

    fn absorb(&mut self, value: bool) {
        self.acc = match self.group.logic {
            Logic::And => self.acc && value,
            Logic::Or => self.acc || value,
        };
    }

    /// Result can no longer change: an `and` saw false or an `or` saw true.
    fn settled(&self) -> bool {
        match self.group.logic {
            Logic::And => !self.acc,
            Logic::Or => self.acc,
        }
    }

    fn next_child(&mut self) -> Option<&'a ConditionNode> {
        let group: &'a ConditionGroup = self.group;
        let child = group.conditions.get(self.next)?;
        self.next += 1;
        Some(child)
    }
}

/// Evaluates a condition group with an explicit stack, short-circuiting
/// `and`/`or` the usual way. Empty `and` is true, empty `or` is false.
pub fn evaluate(root: &ConditionGroup, facts: &Value) -> bool {
    let mut stack = vec![Frame::new(root)];
    let mut child_result: Option<bool> = None;

    while let Some(frame) = stack.last_mut() {
        if let Some(value) = child_result.take() {
            frame.absorb(value);
        }

        let next = if frame.settled() {
            None
        } else {
            frame.next_child()
        };

        match next {
            None => {
                let value = frame.acc;
                stack.pop();
                child_result = Some(value);
            }
            Some(ConditionNode::Leaf(condition)) => {
                child_result = Some(evaluate_condition(condition, facts));
            }
            Some(ConditionNode::Group(group)) => stack.push(Frame::new(group)),
        }
    }

    child_result.unwrap_or(true)
}

/// Looks up a dotted path (`customer.country`). JSON `null` counts as missing.
pub fn resolve<'a>(facts: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = facts;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    if current.is_null() { None } else { Some(current) }
}

pub fn evaluate_condition(condition: &Condition, facts: &Value) -> bool {
    let field = resolve(facts, &condition.field);
    let expected = &condition.value;

    let Some(actual) = field else {
        return matches!(condition.operator, Operator::IsEmpty | Operator::NotEquals);
    };

    match condition.operator {
        Operator::Equals => loosely_equal(actual, expected),
        Operator::NotEquals => !loosely_equal(actual, expected),
        Operator::Contains => contains(actual, expected),
        Operator::NotContains => !contains(actual, expected),
        Operator::StartsWith => text_pair(actual, expected)
            .is_some_and(|(a, e)| a.starts_with(&e)),
        Operator::EndsWith => text_pair(actual, expected)
            .is_some_and(|(a, e)| a.ends_with(&e)),
        Operator::GreaterThan => number_pair(actual, expected).is_some_and(|(a, e)| a > e),
        Operator::LessThan => number_pair(actual, expected).is_some_and(|(a, e)| a < e),
        Operator::InList => in_list(actual, expected),
        Operator::NotInList => expected.is_array() && !in_list(actual, expected),
        Operator::IsEmpty => is_empty(actual),
        Operator::IsNotEmpty => !is_empty(actual),
        Operator::RegexMatch => regex_match(actual, expected),
    }
}

fn normalized(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_lowercase()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    if let (Value::Number(_), _) | (_, Value::Number(_)) = (actual, expected) {
        if let (Some(a), Some(e)) = (as_number(actual), as_number(expected)) {
            return a == e;
        }
    }
    match (normalized(actual), normalized(expected)) {
        (Some(a), Some(e)) => a == e,
        _ => actual == expected,
    }
}

fn text_pair(actual: &Value, expected: &Value) -> Option<(String, String)> {
    Some((normalized(actual)?, normalized(expected)?))
}

fn number_pair(actual: &Value, expected: &Value) -> Option<(f64, f64)> {
    Some((as_number(actual)?, as_number(expected)?))
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, expected)),
        _ => text_pair(actual, expected).is_some_and(|(a, e)| a.contains(&e)),
    }
}

fn in_list(actual: &Value, expected: &Value) -> bool {
    match expected {
        Value::Array(options) => options.iter().any(|option| loosely_equal(actual, option)),
        _ => false,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn regex_match(actual: &Value, pattern: &Value) -> bool {
    let (Some(text), Value::String(pattern)) = (field_text(actual), pattern) else {
        return false;
    };
    match RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
    {
        Ok(re) => re.is_match(&text),
        Err(e) => {
            tracing::debug!(pattern = pattern.as_str(), error = %e, "Invalid regex in condition");
            false
        }
    }
}

fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
