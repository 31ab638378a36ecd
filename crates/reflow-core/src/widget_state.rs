#![forbid(unsafe_code)]

//! Client-supplied widget snapshots and their coalescing rule.
//!
//! Every interaction carries the client's full [`WidgetStates`] snapshot.
//! When two interactions arrive before the script thread picks up the first,
//! [`coalesce_widget_states`] merges them so that a button press in the
//! older snapshot is not lost to the newer one.

use std::fmt;
use std::mem;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable identifier of a widget across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WidgetId(String);

impl WidgetId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WidgetId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for WidgetId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for WidgetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The value a widget holds.
///
/// `Trigger` and `StringTrigger` are momentary: they are active for exactly
/// one run and reset to their unset value when that run finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum WidgetValue {
    Trigger(bool),
    StringTrigger(Option<String>),
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    IntArray(Vec<i64>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
    Json(Value),
    Bytes(Vec<u8>),
}

impl WidgetValue {
    /// True for the momentary variants.
    #[must_use]
    pub fn is_trigger(&self) -> bool {
        matches!(self, Self::Trigger(_) | Self::StringTrigger(_))
    }

    /// True for a trigger that fired in this snapshot.
    #[must_use]
    pub fn is_active_trigger(&self) -> bool {
        matches!(self, Self::Trigger(true) | Self::StringTrigger(Some(_)))
    }

    /// The unset form of a trigger; `None` for non-trigger values.
    #[must_use]
    pub fn reset_trigger(&self) -> Option<Self> {
        match self {
            Self::Trigger(_) => Some(Self::Trigger(false)),
            Self::StringTrigger(_) => Some(Self::StringTrigger(None)),
            _ => None,
        }
    }

    #[must_use]
    pub fn same_kind(&self, other: &Self) -> bool {
        mem::discriminant(self) == mem::discriminant(other)
    }

    /// JSON view used by session-state lookups.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Trigger(b) | Self::Bool(b) => Value::Bool(*b),
            Self::StringTrigger(s) => s.clone().map_or(Value::Null, Value::String),
            Self::Int(i) => Value::from(*i),
            Self::Double(d) => serde_json::Number::from_f64(*d).map_or(Value::Null, Value::Number),
            Self::String(s) => Value::String(s.clone()),
            Self::IntArray(v) => Value::from(v.clone()),
            Self::DoubleArray(v) => Value::Array(
                v.iter()
                    .map(|d| serde_json::Number::from_f64(*d).map_or(Value::Null, Value::Number))
                    .collect(),
            ),
            Self::StringArray(v) => Value::from(v.clone()),
            Self::Json(v) => v.clone(),
            Self::Bytes(b) => Value::from(b.clone()),
        }
    }

    /// Interpret `value` as the same variant as `self`.
    ///
    /// Returns `None` when the JSON shape does not fit.
    #[must_use]
    pub fn coerce_json(&self, value: &Value) -> Option<Self> {
        match self {
            Self::Trigger(_) => value.as_bool().map(Self::Trigger),
            Self::StringTrigger(_) => match value {
                Value::Null => Some(Self::StringTrigger(None)),
                Value::String(s) => Some(Self::StringTrigger(Some(s.clone()))),
                _ => None,
            },
            Self::Bool(_) => value.as_bool().map(Self::Bool),
            Self::Int(_) => value.as_i64().map(Self::Int),
            Self::Double(_) => value.as_f64().map(Self::Double),
            Self::String(_) => value.as_str().map(|s| Self::String(s.to_owned())),
            Self::IntArray(_) => serde_json::from_value(value.clone()).ok().map(Self::IntArray),
            Self::DoubleArray(_) => serde_json::from_value(value.clone())
                .ok()
                .map(Self::DoubleArray),
            Self::StringArray(_) => serde_json::from_value(value.clone())
                .ok()
                .map(Self::StringArray),
            Self::Json(_) => Some(Self::Json(value.clone())),
            Self::Bytes(_) => serde_json::from_value(value.clone()).ok().map(Self::Bytes),
        }
    }
}

/// One widget's value in a client snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetState {
    pub id: WidgetId,
    pub value: WidgetValue,
}

/// A client's full widget snapshot. Ids are unique; insertion order is kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WidgetStates {
    widgets: Vec<WidgetState>,
}

impl WidgetStates {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `id` to `value`, replacing an existing entry in place.
    pub fn set(&mut self, id: impl Into<WidgetId>, value: WidgetValue) {
        let id = id.into();
        match self.widgets.iter_mut().find(|w| w.id == id) {
            Some(existing) => existing.value = value,
            None => self.widgets.push(WidgetState { id, value }),
        }
    }

    /// Builder form of [`set`](Self::set).
    #[must_use]
    pub fn with(mut self, id: impl Into<WidgetId>, value: WidgetValue) -> Self {
        self.set(id, value);
        self
    }

    #[must_use]
    pub fn get(&self, id: &WidgetId) -> Option<&WidgetValue> {
        self.widgets.iter().find(|w| &w.id == id).map(|w| &w.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WidgetState> {
        self.widgets.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.widgets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.widgets.is_empty()
    }
}

impl FromIterator<WidgetState> for WidgetStates {
    fn from_iter<I: IntoIterator<Item = WidgetState>>(iter: I) -> Self {
        let mut states = Self::new();
        for state in iter {
            states.set(state.id, state.value);
        }
        states
    }
}

impl IntoIterator for WidgetStates {
    type Item = WidgetState;
    type IntoIter = std::vec::IntoIter<WidgetState>;

    fn into_iter(self) -> Self::IntoIter {
        self.widgets.into_iter()
    }
}

/// Merge an older pending snapshot with a newer one.
///
/// - A missing newer snapshot inherits the older one.
/// - Otherwise the newer snapshot wins per widget, except that an active
///   trigger in the older snapshot survives when the newer snapshot lacks
///   the widget or holds an unset trigger of the same kind.
#[must_use]
pub fn coalesce_widget_states(
    older: Option<&WidgetStates>,
    newer: Option<&WidgetStates>,
) -> Option<WidgetStates> {
    let (older, newer) = match (older, newer) {
        (None, None) => return None,
        (Some(older), None) => return Some(older.clone()),
        (None, Some(newer)) => return Some(newer.clone()),
        (Some(older), Some(newer)) => (older, newer),
    };

    let mut merged = newer.clone();
    for old in older.iter().filter(|w| w.value.is_active_trigger()) {
        let superseded = merged
            .get(&old.id)
            .is_some_and(|new| !new.same_kind(&old.value) || new.is_active_trigger());
        if !superseded {
            merged.set(old.id.clone(), old.value.clone());
        }
    }
    Some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states(entries: &[(&str, WidgetValue)]) -> WidgetStates {
        entries
            .iter()
            .map(|(id, value)| WidgetState {
                id: WidgetId::from(*id),
                value: value.clone(),
            })
            .collect()
    }

    #[test]
    fn missing_newer_snapshot_inherits_older() {
        let older = states(&[("slider", WidgetValue::Int(3))]);
        assert_eq!(coalesce_widget_states(Some(&older), None), Some(older));
        assert_eq!(coalesce_widget_states(None, None), None);
    }

    #[test]
    fn newer_value_wins_for_plain_widgets() {
        let older = states(&[("slider", WidgetValue::Int(3))]);
        let newer = states(&[("slider", WidgetValue::Int(9))]);
        let merged = coalesce_widget_states(Some(&older), Some(&newer)).unwrap();
        assert_eq!(merged.get(&"slider".into()), Some(&WidgetValue::Int(9)));
    }

    #[test]
    fn fired_trigger_survives_newer_unset_trigger() {
        let older = states(&[("button", WidgetValue::Trigger(true))]);
        let newer = states(&[("button", WidgetValue::Trigger(false))]);
        let merged = coalesce_widget_states(Some(&older), Some(&newer)).unwrap();
        assert_eq!(merged.get(&"button".into()), Some(&WidgetValue::Trigger(true)));
    }

    #[test]
    fn fired_trigger_survives_when_absent_from_newer() {
        let older = states(&[
            ("button", WidgetValue::Trigger(true)),
            ("text", WidgetValue::String("old".into())),
        ]);
        let newer = states(&[("text", WidgetValue::String("new".into()))]);
        let merged = coalesce_widget_states(Some(&older), Some(&newer)).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.get(&"button".into()), Some(&WidgetValue::Trigger(true)));
        assert_eq!(
            merged.get(&"text".into()),
            Some(&WidgetValue::String("new".into()))
        );
    }

    #[test]
    fn newer_string_trigger_is_kept() {
        let older = states(&[("chat", WidgetValue::StringTrigger(Some("hi".into())))]);
        let newer = states(&[("chat", WidgetValue::StringTrigger(Some("bye".into())))]);
        let merged = coalesce_widget_states(Some(&older), Some(&newer)).unwrap();
        assert_eq!(
            merged.get(&"chat".into()),
            Some(&WidgetValue::StringTrigger(Some("bye".into())))
        );
    }

    #[test]
    fn widget_that_changed_kind_takes_newer_value() {
        let older = states(&[("w", WidgetValue::Trigger(true))]);
        let newer = states(&[("w", WidgetValue::Int(4))]);
        let merged = coalesce_widget_states(Some(&older), Some(&newer)).unwrap();
        assert_eq!(merged.get(&"w".into()), Some(&WidgetValue::Int(4)));
    }

    #[test]
    fn non_trigger_widgets_missing_from_newer_are_dropped() {
        let older = states(&[("gone", WidgetValue::Bool(true))]);
        let newer = WidgetStates::new();
        let merged = coalesce_widget_states(Some(&older), Some(&newer)).unwrap();
        assert!(merged.is_empty());
    }

    #[test]
    fn reset_trigger_only_applies_to_triggers() {
        assert_eq!(
            WidgetValue::Trigger(true).reset_trigger(),
            Some(WidgetValue::Trigger(false))
        );
        assert_eq!(
            WidgetValue::StringTrigger(Some("x".into())).reset_trigger(),
            Some(WidgetValue::StringTrigger(None))
        );
        assert_eq!(WidgetValue::Int(1).reset_trigger(), None);
    }

    #[test]
    fn coerce_json_keeps_variant() {
        let template = WidgetValue::Int(0);
        assert_eq!(
            template.coerce_json(&Value::from(42)),
            Some(WidgetValue::Int(42))
        );
        assert_eq!(template.coerce_json(&Value::from("nope")), None);

        let template = WidgetValue::StringArray(Vec::new());
        assert_eq!(
            template.coerce_json(&serde_json::json!(["a", "b"])),
            Some(WidgetValue::StringArray(vec!["a".into(), "b".into()]))
        );
    }

    #[test]
    fn to_json_round_trips_through_coerce() {
        let value = WidgetValue::DoubleArray(vec![1.5, 2.0]);
        assert_eq!(value.coerce_json(&value.to_json()), Some(value));
    }

    #[test]
    fn set_replaces_in_place() {
        let mut snapshot = WidgetStates::new()
            .with("a", WidgetValue::Int(1))
            .with("b", WidgetValue::Int(2));
        snapshot.set("a", WidgetValue::Int(5));
        let ids: Vec<_> = snapshot.iter().map(|w| w.id.as_str().to_owned()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(snapshot.get(&"a".into()), Some(&WidgetValue::Int(5)));
    }
}
