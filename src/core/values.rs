//! MJ-003: Runtime value store — forward references resolved exactly once.
//!
//! Interpretation mints an opaque id whenever an instruction will only know
//! one of its outputs at execution time. The id is embedded in argument
//! strings as a `{{runtime.<id>.<field>}}` marker; the producing instruction
//! resolves the id exactly once during execution, and consumers positioned
//! later in the plan render the marker into the concrete value. Reading an
//! unresolved id is a defined failure, not a crash.

use crate::core::types::ScriptValue;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;

const MARKER_PREFIX: &str = "{{runtime.";
const MARKER_SUFFIX: &str = "}}";

/// Opaque identifier of one instruction's future outputs. Sequential per
/// store, so interpreting the same script twice yields identical plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u64);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueStoreError {
    #[error("runtime value '{0}' does not exist")]
    Unknown(ValueId),
    #[error("runtime value '{0}' already resolved")]
    AlreadyResolved(ValueId),
    #[error("runtime value '{0}' not yet resolved")]
    NotYetResolved(ValueId),
    #[error("runtime value '{id}' has no field '{field}'")]
    UnknownField { id: ValueId, field: String },
    #[error("malformed runtime value reference '{0}'")]
    MalformedMarker(String),
}

/// Process-local store for one run. Resolution from concurrent sub-operations
/// is allowed for distinct ids; resolving the same id twice is always an
/// error regardless of timing.
#[derive(Debug, Default)]
pub struct RuntimeValueStore {
    next: AtomicU64,
    slots: Mutex<HashMap<u64, Option<IndexMap<String, ScriptValue>>>>,
}

impl RuntimeValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh id. Always succeeds.
    pub fn create(&self) -> ValueId {
        let id = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, None);
        ValueId(id)
    }

    /// Store the produced fields for `id`. Exactly-once: a second resolve of
    /// the same id fails with `AlreadyResolved`.
    pub fn resolve(
        &self,
        id: ValueId,
        fields: IndexMap<String, ScriptValue>,
    ) -> Result<(), ValueStoreError> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match slots.get_mut(&id.0) {
            None => Err(ValueStoreError::Unknown(id)),
            Some(slot) => {
                if slot.is_some() {
                    return Err(ValueStoreError::AlreadyResolved(id));
                }
                *slot = Some(fields);
                Ok(())
            }
        }
    }

    /// Read all fields of a resolved id.
    pub fn get(&self, id: ValueId) -> Result<IndexMap<String, ScriptValue>, ValueStoreError> {
        let slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match slots.get(&id.0) {
            None => Err(ValueStoreError::Unknown(id)),
            Some(None) => Err(ValueStoreError::NotYetResolved(id)),
            Some(Some(fields)) => Ok(fields.clone()),
        }
    }

    /// Read one field of a resolved id.
    pub fn get_field(&self, id: ValueId, field: &str) -> Result<ScriptValue, ValueStoreError> {
        let fields = self.get(id)?;
        fields
            .get(field)
            .cloned()
            .ok_or_else(|| ValueStoreError::UnknownField {
                id,
                field: field.to_string(),
            })
    }

    /// The marker text consumers embed in argument strings.
    pub fn marker(id: ValueId, field: &str) -> String {
        format!("{}{}.{}{}", MARKER_PREFIX, id, field, MARKER_SUFFIX)
    }

    /// Replace every marker in `s` with its resolved value. Unresolved or
    /// unknown references are errors.
    pub fn render_str(&self, s: &str) -> Result<String, ValueStoreError> {
        self.render_with(s, true)
    }

    /// Replace resolved markers, leaving unresolved ones verbatim. Used for
    /// dry-run output and for the final return-value rendering.
    pub fn render_lenient_str(&self, s: &str) -> String {
        match self.render_with(s, false) {
            Ok(rendered) => rendered,
            // Lenient mode only fails on malformed markers; keep the text.
            Err(_) => s.to_string(),
        }
    }

    fn render_with(&self, s: &str, strict: bool) -> Result<String, ValueStoreError> {
        let mut result = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(open) = rest.find(MARKER_PREFIX) {
            result.push_str(&rest[..open]);
            let marker_start = &rest[open..];
            let close = marker_start
                .find(MARKER_SUFFIX)
                .ok_or_else(|| ValueStoreError::MalformedMarker(marker_start.to_string()))?;
            let marker = &marker_start[..close + MARKER_SUFFIX.len()];
            let body = &marker[MARKER_PREFIX.len()..marker.len() - MARKER_SUFFIX.len()];
            let (id, field) = parse_marker_body(body)
                .ok_or_else(|| ValueStoreError::MalformedMarker(marker.to_string()))?;
            match self.get_field(id, &field) {
                Ok(value) => result.push_str(&value.to_plain_string()),
                Err(err) if strict => return Err(err),
                Err(_) => result.push_str(marker),
            }
            rest = &marker_start[close + MARKER_SUFFIX.len()..];
        }
        result.push_str(rest);
        Ok(result)
    }

    /// Deep render of a script value. A string that is exactly one marker
    /// becomes the typed field value; markers embedded in longer strings are
    /// substituted textually.
    pub fn render_value(&self, value: &ScriptValue) -> Result<ScriptValue, ValueStoreError> {
        match value {
            ScriptValue::Str(s) => {
                if let Some((id, field)) = parse_exact_marker(s) {
                    return self.get_field(id, &field);
                }
                Ok(ScriptValue::Str(self.render_str(s)?))
            }
            ScriptValue::List(items) => {
                let items = items
                    .iter()
                    .map(|v| self.render_value(v))
                    .collect::<Result<_, _>>()?;
                Ok(ScriptValue::List(items))
            }
            ScriptValue::Dict(dict) => {
                let mut rendered = IndexMap::new();
                for (k, v) in dict {
                    rendered.insert(k.clone(), self.render_value(v)?);
                }
                Ok(ScriptValue::Dict(rendered))
            }
            other => Ok(other.clone()),
        }
    }

    /// Lenient deep render: resolved markers substituted, unresolved left
    /// symbolic.
    pub fn render_value_lenient(&self, value: &ScriptValue) -> ScriptValue {
        match value {
            ScriptValue::Str(s) => {
                if let Some((id, field)) = parse_exact_marker(s) {
                    if let Ok(resolved) = self.get_field(id, &field) {
                        return resolved;
                    }
                }
                ScriptValue::Str(self.render_lenient_str(s))
            }
            ScriptValue::List(items) => {
                ScriptValue::List(items.iter().map(|v| self.render_value_lenient(v)).collect())
            }
            ScriptValue::Dict(dict) => ScriptValue::Dict(
                dict.iter()
                    .map(|(k, v)| (k.clone(), self.render_value_lenient(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

fn parse_marker_body(body: &str) -> Option<(ValueId, String)> {
    let (id, field) = body.split_once('.')?;
    let id: u64 = id.parse().ok()?;
    if field.is_empty() {
        return None;
    }
    Some((ValueId(id), field.to_string()))
}

/// Some((id, field)) when `s` is exactly one marker and nothing else.
fn parse_exact_marker(s: &str) -> Option<(ValueId, String)> {
    let body = s.strip_prefix(MARKER_PREFIX)?.strip_suffix(MARKER_SUFFIX)?;
    if body.contains("{{") || body.contains("}}") {
        return None;
    }
    parse_marker_body(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fields(pairs: &[(&str, ScriptValue)]) -> IndexMap<String, ScriptValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_mj003_create_is_sequential() {
        let store = RuntimeValueStore::new();
        assert_eq!(store.create(), ValueId(1));
        assert_eq!(store.create(), ValueId(2));
        assert_eq!(store.create(), ValueId(3));
    }

    #[test]
    fn test_mj003_resolve_exactly_once() {
        let store = RuntimeValueStore::new();
        let id = store.create();
        store
            .resolve(id, fields(&[("output", ScriptValue::Str("ok".into()))]))
            .unwrap();
        let err = store
            .resolve(id, fields(&[("output", ScriptValue::Str("again".into()))]))
            .unwrap_err();
        assert_eq!(err, ValueStoreError::AlreadyResolved(id));
    }

    #[test]
    fn test_mj003_get_before_resolve() {
        let store = RuntimeValueStore::new();
        let id = store.create();
        assert_eq!(store.get(id).unwrap_err(), ValueStoreError::NotYetResolved(id));
    }

    #[test]
    fn test_mj003_get_unknown() {
        let store = RuntimeValueStore::new();
        assert_eq!(
            store.get(ValueId(99)).unwrap_err(),
            ValueStoreError::Unknown(ValueId(99))
        );
    }

    #[test]
    fn test_mj003_render_embedded_marker() {
        let store = RuntimeValueStore::new();
        let id = store.create();
        store
            .resolve(id, fields(&[("output", ScriptValue::Str("kurt".into()))]))
            .unwrap();
        let marker = RuntimeValueStore::marker(id, "output");
        let rendered = store
            .render_str(&format!("mkdir -p /src/{} && ls", marker))
            .unwrap();
        assert_eq!(rendered, "mkdir -p /src/kurt && ls");
    }

    #[test]
    fn test_mj003_render_strict_fails_unresolved() {
        let store = RuntimeValueStore::new();
        let id = store.create();
        let marker = RuntimeValueStore::marker(id, "output");
        let err = store.render_str(&marker).unwrap_err();
        assert_eq!(err, ValueStoreError::NotYetResolved(id));
    }

    #[test]
    fn test_mj003_render_lenient_keeps_unresolved() {
        let store = RuntimeValueStore::new();
        let id = store.create();
        let marker = RuntimeValueStore::marker(id, "uuid");
        assert_eq!(store.render_lenient_str(&marker), marker);
    }

    #[test]
    fn test_mj003_render_value_typed_exact_marker() {
        let store = RuntimeValueStore::new();
        let id = store.create();
        store
            .resolve(id, fields(&[("code", ScriptValue::Int(0))]))
            .unwrap();
        let value = ScriptValue::Str(RuntimeValueStore::marker(id, "code"));
        assert_eq!(store.render_value(&value).unwrap(), ScriptValue::Int(0));
    }

    #[test]
    fn test_mj003_render_value_deep() {
        let store = RuntimeValueStore::new();
        let id = store.create();
        store
            .resolve(id, fields(&[("name", ScriptValue::Str("files-1".into()))]))
            .unwrap();
        let marker = RuntimeValueStore::marker(id, "name");
        let mut dict = IndexMap::new();
        dict.insert("/temp".to_string(), ScriptValue::Str(marker));
        let rendered = store.render_value(&ScriptValue::Dict(dict)).unwrap();
        match rendered {
            ScriptValue::Dict(d) => {
                assert_eq!(d["/temp"], ScriptValue::Str("files-1".into()));
            }
            other => panic!("expected dict, got {:?}", other),
        }
    }

    #[test]
    fn test_mj003_unknown_field() {
        let store = RuntimeValueStore::new();
        let id = store.create();
        store
            .resolve(id, fields(&[("output", ScriptValue::Str("x".into()))]))
            .unwrap();
        let err = store.get_field(id, "code").unwrap_err();
        assert!(matches!(err, ValueStoreError::UnknownField { .. }));
    }

    #[test]
    fn test_mj003_malformed_marker() {
        let store = RuntimeValueStore::new();
        assert!(store.render_str("{{runtime.notanumber.field}}").is_err());
        assert!(store.render_str("{{runtime.3.field").is_err());
    }

    #[test]
    fn test_mj003_dotted_field_names() {
        let store = RuntimeValueStore::new();
        let id = store.create();
        store
            .resolve(
                id,
                fields(&[("files_artifacts.0", ScriptValue::Str("blue-whale".into()))]),
            )
            .unwrap();
        let marker = RuntimeValueStore::marker(id, "files_artifacts.0");
        assert_eq!(store.render_str(&marker).unwrap(), "blue-whale");
    }

    proptest! {
        #[test]
        fn test_mj003_prop_marker_roundtrip(
            field in "[a-z_]{1,12}(\\.[0-9]{1,2})?",
            value in "[ -~]{0,40}",
            prefix in "[a-z /]{0,10}",
            suffix in "[a-z /]{0,10}",
        ) {
            let store = RuntimeValueStore::new();
            let id = store.create();
            store
                .resolve(id, fields(&[(field.as_str(), ScriptValue::Str(value.clone()))]))
                .unwrap();
            let text = format!("{}{}{}", prefix, RuntimeValueStore::marker(id, &field), suffix);
            let rendered = store.render_str(&text).unwrap();
            prop_assert_eq!(rendered, format!("{}{}{}", prefix, value, suffix));
        }
    }
}
