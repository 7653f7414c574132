//! Connection condition parsing and evaluation.
//!
//! Grammar: `<left> <op> <literal>` with one operator out of
//! `== != >= <= > < =`. The left side is `deviceSelector.propertyName`,
//! where the selector is `source`, `target`, or an explicit device id and
//! defaults to `source` when absent. An empty condition is always true;
//! missing properties and unsupported comparisons are always false.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use verdant_core::PropertyValue;

/// Read access to current device property values.
///
/// Implemented by the persistence service (reads come from its hot set, not
/// the store).
#[async_trait]
pub trait PropertySource: Send + Sync {
    async fn property(
        &self,
        device_id: Uuid,
        name: &str,
        token: &CancellationToken,
    ) -> Option<PropertyValue>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

/// Two-character operators first so `>=` is not read as `>` followed by `=`.
const OPERATORS: [(&str, Operator); 7] = [
    ("==", Operator::Eq),
    ("!=", Operator::Ne),
    (">=", Operator::Ge),
    ("<=", Operator::Le),
    (">", Operator::Gt),
    ("<", Operator::Lt),
    ("=", Operator::Eq),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceSelector {
    Source,
    Target,
    Explicit(Uuid),
}

#[derive(Debug)]
struct ParsedCondition<'a> {
    selector: DeviceSelector,
    property: &'a str,
    operator: Operator,
    literal: &'a str,
}

fn parse(condition: &str) -> Option<ParsedCondition<'_>> {
    let (index, token, operator) = OPERATORS
        .iter()
        .filter_map(|(token, op)| condition.find(token).map(|index| (index, *token, *op)))
        .min_by_key(|(index, token, _)| (*index, std::cmp::Reverse(token.len())))?;

    let left = condition[..index].trim();
    let right = condition[index + token.len()..].trim();
    if left.is_empty() || right.is_empty() {
        return None;
    }

    let (selector, property) = split_selector(left);
    Some(ParsedCondition {
        selector,
        property,
        operator,
        literal: strip_quotes(right),
    })
}

/// Splits `deviceSelector.propertyName`; without a `.` the whole left side is
/// the property name and the device defaults to source.
fn split_selector(left: &str) -> (DeviceSelector, &str) {
    match left.split_once('.') {
        None => (DeviceSelector::Source, left),
        Some((head, rest)) => match head.trim() {
            "source" => (DeviceSelector::Source, rest.trim()),
            "target" => (DeviceSelector::Target, rest.trim()),
            other => match Uuid::parse_str(other) {
                Ok(id) => (DeviceSelector::Explicit(id), rest.trim()),
                // Not a selector: the dot belongs to the property name.
                Err(_) => (DeviceSelector::Source, left),
            },
        },
    }
}

fn strip_quotes(literal: &str) -> &str {
    let bytes = literal.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
    {
        &literal[1..literal.len() - 1]
    } else {
        literal
    }
}

/// Evaluates connection conditions against live property values.
pub struct ConditionEvaluator {
    properties: Arc<dyn PropertySource>,
}

impl ConditionEvaluator {
    #[must_use]
    pub fn new(properties: Arc<dyn PropertySource>) -> Self {
        Self { properties }
    }

    /// Evaluates `condition` for a `source -> target` connection.
    pub async fn evaluate(
        &self,
        source_id: Uuid,
        target_id: Uuid,
        condition: &str,
        token: &CancellationToken,
    ) -> bool {
        if condition.trim().is_empty() {
            return true;
        }
        let Some(parsed) = parse(condition) else {
            tracing::debug!(condition, "unparseable connection condition");
            return false;
        };

        let device_id = match parsed.selector {
            DeviceSelector::Source => source_id,
            DeviceSelector::Target => target_id,
            DeviceSelector::Explicit(id) => id,
        };

        let Some(value) = self
            .properties
            .property(device_id, parsed.property, token)
            .await
        else {
            return false;
        };

        compare(&value, parsed.operator, parsed.literal)
    }
}

/// Type-directed comparison: numerics compare numerically, booleans and
/// strings support equality only.
fn compare(value: &PropertyValue, operator: Operator, literal: &str) -> bool {
    match value {
        PropertyValue::Int(_) | PropertyValue::Float(_) => {
            let Some(left) = value.as_f64() else {
                return false;
            };
            let Ok(right) = literal.parse::<f64>() else {
                return false;
            };
            let Some(ordering) = left.partial_cmp(&right) else {
                return false;
            };
            match operator {
                Operator::Eq => ordering == Ordering::Equal,
                Operator::Ne => ordering != Ordering::Equal,
                Operator::Gt => ordering == Ordering::Greater,
                Operator::Lt => ordering == Ordering::Less,
                Operator::Ge => ordering != Ordering::Less,
                Operator::Le => ordering != Ordering::Greater,
            }
        }
        PropertyValue::Bool(left) => {
            let Ok(right) = literal.parse::<bool>() else {
                return false;
            };
            match operator {
                Operator::Eq => *left == right,
                Operator::Ne => *left != right,
                _ => false,
            }
        }
        PropertyValue::Text(left) => match operator {
            Operator::Eq => left == literal,
            Operator::Ne => left != literal,
            _ => false,
        },
        _ => false,
    }
}
