//! Property value types for the component model.
//!
//! Defines [`PropertyValue`], the tagged variant every component property is
//! stored as, [`PropertyKind`] (the recorded effective type), and
//! [`ComponentState`] (the component lifecycle). The JSON mapping used by the
//! store format and the event wire shape lives here as well.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Discriminant for [`PropertyValue`] variants.
///
/// Recorded alongside values in property-changed events so consumers can
/// branch on the effective type without inspecting the value itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PropertyKind {
    Null,
    Bool,
    Int,
    Float,
    Text,
    Timestamp,
    Id,
    Map,
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Text => "text",
            Self::Timestamp => "timestamp",
            Self::Id => "id",
            Self::Map => "map",
        };
        f.write_str(name)
    }
}

/// Heterogeneous typed value held by a component property.
///
/// Values form an owned tree (nested maps contain values, never references),
/// so cycles are not constructible. `None`/missing is modeled by [`Self::Null`].
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Id(Uuid),
    Map(BTreeMap<String, PropertyValue>),
}

impl PropertyValue {
    /// Returns the effective type tag of this value.
    #[must_use]
    pub fn kind(&self) -> PropertyKind {
        match self {
            Self::Null => PropertyKind::Null,
            Self::Bool(_) => PropertyKind::Bool,
            Self::Int(_) => PropertyKind::Int,
            Self::Float(_) => PropertyKind::Float,
            Self::Text(_) => PropertyKind::Text,
            Self::Timestamp(_) => PropertyKind::Timestamp,
            Self::Id(_) => PropertyKind::Id,
            Self::Map(_) => PropertyKind::Map,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the numeric value, widening `Int` to `f64`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_id(&self) -> Option<Uuid> {
        match self {
            Self::Id(id) => Some(*id),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, PropertyValue>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Converts to the store/wire JSON representation.
    ///
    /// Normalizations applied on write: strings are trimmed, floats with an
    /// exact integral value collapse to JSON integers, timestamps serialize
    /// as RFC 3339 strings, and ids as canonical 36-char hyphenated strings.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => {
                if let Some(exact) = exact_i64(*f) {
                    serde_json::Value::from(exact)
                } else {
                    serde_json::Value::from(*f)
                }
            }
            Self::Text(s) => serde_json::Value::String(s.trim().to_string()),
            Self::Timestamp(t) => serde_json::Value::String(t.to_rfc3339()),
            Self::Id(id) => serde_json::Value::String(id.to_string()),
            Self::Map(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Reconstructs a value from the store/wire JSON representation.
    ///
    /// Applies the inverse mapping: integral numbers become `Int`, fractional
    /// become `Float`; strings that parse as RFC 3339 become `Timestamp`, as
    /// a UUID become `Id`, otherwise `Text`. JSON arrays are not part of the
    /// property model and map to `Null`.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null | serde_json::Value::Array(_) => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Self::from_string_repr(s),
            serde_json::Value::Object(m) => Self::Map(
                m.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Sniffs the richer kinds out of a persisted string.
    fn from_string_repr(s: &str) -> Self {
        if let Ok(id) = Uuid::parse_str(s) {
            return Self::Id(id);
        }
        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
            return Self::Timestamp(ts.with_timezone(&Utc));
        }
        Self::Text(s.to_string())
    }
}

/// Returns `Some(i)` when `f` is finite and exactly representable as `i64`.
fn exact_i64(f: f64) -> Option<i64> {
    if !f.is_finite() || f.fract() != 0.0 {
        return None;
    }
    // i64::MAX is not exactly representable as f64; stay inside the safe band.
    if f >= -9_007_199_254_740_992.0 && f <= 9_007_199_254_740_992.0 {
        #[allow(clippy::cast_possible_truncation)]
        return Some(f as i64);
    }
    None
}

impl Serialize for PropertyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PropertyValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(Self::from_json(&raw))
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for PropertyValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(t: DateTime<Utc>) -> Self {
        Self::Timestamp(t)
    }
}

impl From<Uuid> for PropertyValue {
    fn from(id: Uuid) -> Self {
        Self::Id(id)
    }
}

impl From<BTreeMap<String, PropertyValue>> for PropertyValue {
    fn from(m: BTreeMap<String, PropertyValue>) -> Self {
        Self::Map(m)
    }
}

/// Extraction of a typed value out of a [`PropertyValue`].
///
/// The typed-getter counterpart to the `From` conversions: `None` on tag
/// mismatch, so callers get the empty value instead of a panic. Replaces the
/// reflection-driven generic accessors of dynamically typed runtimes.
/// Strict readers use [`Self::expected_kind`] to name the kind a mismatch
/// was expected to carry.
pub trait FromPropertyValue: Sized {
    /// The kind a strict read expects the stored value to have.
    fn expected_kind() -> PropertyKind;

    fn from_value(value: &PropertyValue) -> Option<Self>;
}

impl FromPropertyValue for bool {
    fn expected_kind() -> PropertyKind {
        PropertyKind::Bool
    }

    fn from_value(value: &PropertyValue) -> Option<Self> {
        value.as_bool()
    }
}

impl FromPropertyValue for i64 {
    fn expected_kind() -> PropertyKind {
        PropertyKind::Int
    }

    fn from_value(value: &PropertyValue) -> Option<Self> {
        value.as_i64()
    }
}

impl FromPropertyValue for f64 {
    fn expected_kind() -> PropertyKind {
        PropertyKind::Float
    }

    fn from_value(value: &PropertyValue) -> Option<Self> {
        value.as_f64()
    }
}

impl FromPropertyValue for String {
    fn expected_kind() -> PropertyKind {
        PropertyKind::Text
    }

    fn from_value(value: &PropertyValue) -> Option<Self> {
        value.as_text().map(ToString::to_string)
    }
}

impl FromPropertyValue for DateTime<Utc> {
    fn expected_kind() -> PropertyKind {
        PropertyKind::Timestamp
    }

    fn from_value(value: &PropertyValue) -> Option<Self> {
        value.as_timestamp()
    }
}

impl FromPropertyValue for Uuid {
    fn expected_kind() -> PropertyKind {
        PropertyKind::Id
    }

    fn from_value(value: &PropertyValue) -> Option<Self> {
        value.as_id()
    }
}

impl FromPropertyValue for BTreeMap<String, PropertyValue> {
    fn expected_kind() -> PropertyKind {
        PropertyKind::Map
    }

    fn from_value(value: &PropertyValue) -> Option<Self> {
        value.as_map().cloned()
    }
}

/// Component lifecycle state.
///
/// Transitions: Created -> Initializing -> Ready -> Running -> Stopping ->
/// Ready | Error -> Disposed. Published as a read-only `State` property on
/// every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentState {
    Created,
    Initializing,
    Ready,
    Running,
    Stopping,
    Error,
    Disposed,
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "Created",
            Self::Initializing => "Initializing",
            Self::Ready => "Ready",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Error => "Error",
            Self::Disposed => "Disposed",
        };
        f.write_str(name)
    }
}
