#![forbid(unsafe_code)]

//! Per-session state reconciled across runs.
//!
//! Three layers answer a lookup, most recent first:
//!
//! 1. `new_state` - values the script (or a widget callback) wrote this run
//! 2. widget values - the client's snapshot for the current run
//! 3. `old_state` - values written in earlier runs
//!
//! At the end of every run, completed or cut short, `new_state` is folded
//! into `old_state` ([`SessionState::make_state_old`]). Widget values are
//! owned by the client snapshot; this type only resets triggers and forgets
//! widgets a completed run did not declare.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use reflow_core::{WidgetId, WidgetStates, WidgetValue};
use serde_json::Value;

use crate::error::SessionStateError;

/// Callback fired before a run when a widget's client value changed.
pub type WidgetCallback = Arc<dyn Fn(&mut SessionState) + Send + Sync>;

/// What a widget declares when the script instantiates it.
#[derive(Clone)]
pub struct WidgetMetadata {
    pub id: WidgetId,
    /// User-facing key; `state[key]` reads this widget's value.
    pub user_key: Option<String>,
    pub default: WidgetValue,
    pub on_change: Option<WidgetCallback>,
}

impl WidgetMetadata {
    #[must_use]
    pub fn new(id: impl Into<WidgetId>, default: WidgetValue) -> Self {
        Self {
            id: id.into(),
            user_key: None,
            default,
            on_change: None,
        }
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.user_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_on_change(mut self, callback: impl Fn(&mut SessionState) + Send + Sync + 'static) -> Self {
        self.on_change = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for WidgetMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WidgetMetadata")
            .field("id", &self.id)
            .field("user_key", &self.user_key)
            .field("default", &self.default)
            .field("on_change", &self.on_change.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterWidgetResult {
    pub value: WidgetValue,
    /// The value came from a script write this run; the client must adopt it.
    pub value_changed: bool,
}

#[derive(Debug, Default)]
pub struct SessionState {
    old_state: HashMap<String, Value>,
    new_state: HashMap<String, Value>,
    widget_values: HashMap<WidgetId, WidgetValue>,
    widget_metadata: HashMap<WidgetId, WidgetMetadata>,
    key_id_mapping: HashMap<String, WidgetId>,
    widget_ids_this_run: HashSet<WidgetId>,
}

impl SessionState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn widget_id_for(&self, key: &str) -> WidgetId {
        self.key_id_mapping
            .get(key)
            .cloned()
            .unwrap_or_else(|| WidgetId::from(key))
    }

    /// Resolve `key` through new state, widget values, then old state.
    pub fn get(&self, key: &str) -> Result<Value, SessionStateError> {
        self.try_get(key).ok_or_else(|| SessionStateError::KeyNotFound {
            key: key.to_owned(),
        })
    }

    #[must_use]
    pub fn try_get(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.new_state.get(key) {
            return Some(value.clone());
        }
        if let Some(value) = self.widget_values.get(&self.widget_id_for(key)) {
            return Some(value.to_json());
        }
        self.old_state.get(key).cloned()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.new_state.contains_key(key)
            || self.widget_values.contains_key(&self.widget_id_for(key))
            || self.old_state.contains_key(key)
    }

    /// Write `key` for this run.
    ///
    /// Fails if `key` belongs to a widget already instantiated this run: the
    /// rendered control would silently disagree with the script.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), SessionStateError> {
        let key = key.into();
        if self.widget_ids_this_run.contains(&self.widget_id_for(&key)) {
            return Err(SessionStateError::WidgetWriteAfterCreation { key });
        }
        self.new_state.insert(key, value.into());
        Ok(())
    }

    /// Delete `key` from every layer, returning the value it resolved to.
    pub fn remove(&mut self, key: &str) -> Result<Value, SessionStateError> {
        let value = self.get(key)?;
        self.new_state.remove(key);
        self.old_state.remove(key);
        let id = self.widget_id_for(key);
        self.widget_values.remove(&id);
        Ok(value)
    }

    /// True iff `key` was written during the current run.
    #[must_use]
    pub fn is_new_value(&self, key: &str) -> bool {
        self.new_state.contains_key(key)
    }

    /// Every key that currently resolves, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: BTreeSet<&str> = self.new_state.keys().map(String::as_str).collect();
        keys.extend(self.old_state.keys().map(String::as_str));
        keys.extend(
            self.key_id_mapping
                .iter()
                .filter(|(_, id)| self.widget_values.contains_key(*id))
                .map(|(key, _)| key.as_str()),
        );
        keys.into_iter().map(str::to_owned).collect()
    }

    /// Fold this run's writes into the old generation.
    pub fn make_state_old(&mut self) {
        let aged = self.new_state.len();
        self.old_state.extend(self.new_state.drain());
        tracing::trace!(target: "reflow.state", aged, "aged session state");
    }

    /// Forget everything (session teardown).
    pub fn clear(&mut self) {
        self.old_state.clear();
        self.new_state.clear();
        self.widget_values.clear();
        self.widget_metadata.clear();
        self.key_id_mapping.clear();
        self.widget_ids_this_run.clear();
    }

    #[must_use]
    pub fn widget_value(&self, id: &WidgetId) -> Option<&WidgetValue> {
        self.widget_values.get(id)
    }

    /// Whether `id` was instantiated during the current run.
    #[must_use]
    pub fn is_widget_registered(&self, id: &WidgetId) -> bool {
        self.widget_ids_this_run.contains(id)
    }

    /// Prepare for a new run.
    ///
    /// Installs `widget_states` over the previous values (widgets missing
    /// from the snapshot keep their last value) and fires `on_change`
    /// callbacks, in id order, for widgets whose value changed.
    pub fn on_script_will_rerun(&mut self, widget_states: Option<&WidgetStates>) {
        self.widget_ids_this_run.clear();
        let Some(states) = widget_states else {
            return;
        };

        let mut changed = Vec::new();
        for state in states.iter() {
            let previous = self
                .widget_values
                .get(&state.id)
                .or_else(|| self.widget_metadata.get(&state.id).map(|m| &m.default));
            if previous.is_some_and(|prev| prev != &state.value) {
                changed.push(state.id.clone());
            }
            self.widget_values.insert(state.id.clone(), state.value.clone());
        }
        changed.sort();

        for id in changed {
            let callback = self
                .widget_metadata
                .get(&id)
                .and_then(|metadata| metadata.on_change.clone());
            if let Some(callback) = callback {
                tracing::debug!(target: "reflow.state", widget = %id, "running on_change callback");
                callback(self);
            }
        }
    }

    /// Declare a widget for the current run and resolve its value.
    ///
    /// Sources, first match wins: a script write to the widget's key this
    /// run, the client snapshot, a script write from an earlier run, the
    /// declared default.
    pub fn register_widget(
        &mut self,
        metadata: WidgetMetadata,
    ) -> Result<RegisterWidgetResult, SessionStateError> {
        let id = metadata.id.clone();
        if self.widget_ids_this_run.contains(&id) {
            return Err(SessionStateError::DuplicateWidgetId { id });
        }

        let key = metadata.user_key.as_deref();
        let coerce = |key: &str, json: &Value| {
            metadata
                .default
                .coerce_json(json)
                .ok_or_else(|| SessionStateError::InvalidWidgetValue {
                    key: key.to_owned(),
                })
        };

        let (value, value_changed) =
            if let Some((key, json)) = key.and_then(|k| self.new_state.get(k).map(|j| (k, j))) {
                (coerce(key, json)?, true)
            } else if let Some(current) = self.widget_values.get(&id) {
                (current.clone(), false)
            } else if let Some((key, json)) = key.and_then(|k| self.old_state.get(k).map(|j| (k, j))) {
                (coerce(key, json)?, false)
            } else {
                (metadata.default.clone(), false)
            };

        self.widget_ids_this_run.insert(id.clone());
        if let Some(key) = &metadata.user_key {
            self.key_id_mapping.insert(key.clone(), id.clone());
        }
        self.widget_values.insert(id.clone(), value.clone());
        self.widget_metadata.insert(id, metadata);

        Ok(RegisterWidgetResult {
            value,
            value_changed,
        })
    }

    /// End-of-run bookkeeping; call exactly once per run.
    ///
    /// Only a run that `completed` declared its full widget set, so only then
    /// are undeclared widgets forgotten. Triggers reset and state ages
    /// either way.
    pub fn on_script_finished(&mut self, completed: bool) {
        if completed {
            self.remove_stale_widgets();
        }
        for value in self.widget_values.values_mut() {
            if let Some(reset) = value.reset_trigger() {
                *value = reset;
            }
        }
        self.make_state_old();
    }

    fn remove_stale_widgets(&mut self) {
        let active = &self.widget_ids_this_run;
        let before = self.widget_values.len();
        self.widget_values.retain(|id, _| active.contains(id));
        self.widget_metadata.retain(|id, _| active.contains(id));
        self.key_id_mapping.retain(|_, id| active.contains(id));
        let removed = before - self.widget_values.len();
        if removed > 0 {
            tracing::debug!(target: "reflow.state", removed, "forgot stale widgets");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn aging_moves_new_values_to_old() {
        let mut state = SessionState::new();
        state.set("x", 1).unwrap();
        assert!(state.is_new_value("x"));
        state.make_state_old();
        assert_eq!(state.get("x").unwrap(), Value::from(1));
        assert!(!state.is_new_value("x"));
    }

    #[test]
    fn missing_key_is_an_error() {
        let state = SessionState::new();
        assert_eq!(
            state.get("nope"),
            Err(SessionStateError::KeyNotFound { key: "nope".into() })
        );
    }

    #[test]
    fn lookup_prefers_new_then_widget_then_old() {
        let mut state = SessionState::new();
        state.set("k", "old").unwrap();
        state.make_state_old();

        state.on_script_will_rerun(Some(&WidgetStates::new().with("k", WidgetValue::String("widget".into()))));
        assert_eq!(state.get("k").unwrap(), Value::from("widget"));

        state.set("k", "new").unwrap();
        assert_eq!(state.get("k").unwrap(), Value::from("new"));
    }

    #[test]
    fn write_after_widget_creation_is_rejected() {
        let mut state = SessionState::new();
        state.on_script_will_rerun(None);
        state.set("volume", 3).unwrap();
        let registered = state
            .register_widget(WidgetMetadata::new("w-volume", WidgetValue::Int(0)).with_key("volume"))
            .unwrap();
        assert_eq!(registered.value, WidgetValue::Int(3));
        assert!(registered.value_changed);

        assert_eq!(
            state.set("volume", 4),
            Err(SessionStateError::WidgetWriteAfterCreation {
                key: "volume".into()
            })
        );
    }

    #[test]
    fn duplicate_widget_ids_are_rejected() {
        let mut state = SessionState::new();
        state.register_widget(WidgetMetadata::new("w", WidgetValue::Bool(false))).unwrap();
        assert_eq!(
            state.register_widget(WidgetMetadata::new("w", WidgetValue::Bool(false))),
            Err(SessionStateError::DuplicateWidgetId { id: "w".into() })
        );
    }

    #[test]
    fn mistyped_write_is_reported() {
        let mut state = SessionState::new();
        state.set("n", "not a number").unwrap();
        let result = state.register_widget(WidgetMetadata::new("w-n", WidgetValue::Int(0)).with_key("n"));
        assert_eq!(result, Err(SessionStateError::InvalidWidgetValue { key: "n".into() }));
        assert!(!state.is_widget_registered(&"w-n".into()));
    }

    #[test]
    fn snapshot_value_beats_default() {
        let mut state = SessionState::new();
        state.on_script_will_rerun(Some(&WidgetStates::new().with("slider", WidgetValue::Int(7))));
        let registered = state
            .register_widget(WidgetMetadata::new("slider", WidgetValue::Int(0)))
            .unwrap();
        assert_eq!(registered.value, WidgetValue::Int(7));
        assert!(!registered.value_changed);
    }

    #[test]
    fn earlier_write_seeds_new_widget() {
        let mut state = SessionState::new();
        state.set("name", "ada").unwrap();
        state.on_script_finished(true);

        state.on_script_will_rerun(None);
        let registered = state
            .register_widget(WidgetMetadata::new("w-name", WidgetValue::String(String::new())).with_key("name"))
            .unwrap();
        assert_eq!(registered.value, WidgetValue::String("ada".into()));
        assert!(!registered.value_changed);
    }

    #[test]
    fn on_change_fires_only_for_changed_widgets() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut state = SessionState::new();
        let counter = Arc::clone(&calls);
        state
            .register_widget(
                WidgetMetadata::new("check", WidgetValue::Bool(false)).with_on_change(move |s| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    s.set("changed", true).unwrap();
                }),
            )
            .unwrap();
        state.on_script_finished(true);

        state.on_script_will_rerun(Some(&WidgetStates::new().with("check", WidgetValue::Bool(false))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        state.on_script_will_rerun(Some(&WidgetStates::new().with("check", WidgetValue::Bool(true))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(state.is_new_value("changed"));
    }

    #[test]
    fn completed_run_forgets_undeclared_widgets() {
        let mut state = SessionState::new();
        state.on_script_will_rerun(Some(
            &WidgetStates::new()
                .with("kept", WidgetValue::Int(1))
                .with("gone", WidgetValue::Int(2)),
        ));
        state.register_widget(WidgetMetadata::new("kept", WidgetValue::Int(0))).unwrap();
        state.on_script_finished(true);
        assert!(state.widget_value(&"kept".into()).is_some());
        assert!(state.widget_value(&"gone".into()).is_none());
    }

    #[test]
    fn interrupted_run_keeps_undeclared_widgets() {
        let mut state = SessionState::new();
        state.on_script_will_rerun(Some(&WidgetStates::new().with("later", WidgetValue::Int(2))));
        state.set("x", 1).unwrap();
        state.on_script_finished(false);
        assert!(state.widget_value(&"later".into()).is_some());
        assert!(!state.is_new_value("x"));
        assert_eq!(state.get("x").unwrap(), Value::from(1));
    }

    #[test]
    fn triggers_reset_after_run() {
        let mut state = SessionState::new();
        state.on_script_will_rerun(Some(&WidgetStates::new().with("button", WidgetValue::Trigger(true))));
        let registered = state
            .register_widget(WidgetMetadata::new("button", WidgetValue::Trigger(false)))
            .unwrap();
        assert_eq!(registered.value, WidgetValue::Trigger(true));
        state.on_script_finished(true);
        assert_eq!(
            state.widget_value(&"button".into()),
            Some(&WidgetValue::Trigger(false))
        );
    }

    #[test]
    fn remove_and_keys() {
        let mut state = SessionState::new();
        state.set("a", 1).unwrap();
        state.set("b", 2).unwrap();
        state.make_state_old();
        state.set("c", 3).unwrap();
        assert_eq!(state.keys(), vec!["a", "b", "c"]);

        assert_eq!(state.remove("b").unwrap(), Value::from(2));
        assert!(!state.contains("b"));
        assert!(state.remove("b").is_err());

        state.clear();
        assert!(state.keys().is_empty());
    }
}
