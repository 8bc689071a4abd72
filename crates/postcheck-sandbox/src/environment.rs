//! Environment and variable scopes visible to a script.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::channel::{ReportMessage, ResultChannel};

/// An environment value: a string or a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    /// String value.
    String(String),
    /// Numeric value.
    Number(serde_json::Number),
}

impl EnvValue {
    /// Convert a script-supplied JSON value. Strings and numbers pass
    /// through; booleans, null, arrays and objects are stringified the way
    /// JavaScript's `String()` would.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::Null => Self::String("null".into()),
            serde_json::Value::Bool(b) => Self::String(b.to_string()),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                Self::String(value.to_string())
            }
        }
    }

    /// As a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Number(n) => serde_json::Value::Number(n.clone()),
        }
    }
}

impl fmt::Display for EnvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for EnvValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for EnvValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for EnvValue {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

/// A caller-supplied environment snapshot.
pub type EnvSnapshot = BTreeMap<String, EnvValue>;

/// The mutable environment of one execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment {
    values: EnvSnapshot,
}

impl Environment {
    /// Seed an environment from a snapshot.
    pub fn from_snapshot(values: EnvSnapshot) -> Self {
        Self { values }
    }

    /// Current value of `key`.
    pub fn get(&self, key: &str) -> Option<&EnvValue> {
        self.values.get(key)
    }

    /// Whether `key` is set.
    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Update `key` and emit `setEnv` on `reporter` before returning.
    pub(crate) fn set(&mut self, key: String, value: EnvValue, reporter: &ResultChannel) {
        self.values.insert(key.clone(), value.clone());
        reporter.send(ReportMessage::SetEnv { key, value });
    }

    /// Current values.
    pub fn snapshot(&self) -> &EnvSnapshot {
        &self.values
    }

    /// Consume into the current values.
    pub fn into_snapshot(self) -> EnvSnapshot {
        self.values
    }
}

/// Which variable scope a lookup targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableScope {
    /// `pm.environment`
    Environment,
    /// `pm.globals`
    Globals,
    /// `pm.collectionVariables`
    Collection,
    /// `pm.variables`: environment, then collection, then globals.
    Resolved,
}

impl VariableScope {
    /// Parse the scope name used by the JS surface.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "environment" => Some(Self::Environment),
            "globals" => Some(Self::Globals),
            "collectionVariables" => Some(Self::Collection),
            "variables" => Some(Self::Resolved),
            _ => None,
        }
    }
}

/// Resolve `key` across the three scopes, narrowest first.
pub(crate) fn resolve<'a>(
    key: &str,
    environment: &'a Environment,
    collection: &'a EnvSnapshot,
    globals: &'a EnvSnapshot,
) -> Option<&'a EnvValue> {
    environment
        .get(key)
        .or_else(|| collection.get(key))
        .or_else(|| globals.get(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::result_channel;
    use serde_json::json;

    #[tokio::test]
    async fn set_updates_and_emits_once() {
        let (channel, listener) = result_channel();
        let mut env = Environment::default();
        env.set("k".into(), EnvValue::from("v"), &channel);
        drop(channel);

        assert_eq!(env.get("k"), Some(&EnvValue::from("v")));
        let report = listener.collect().await;
        assert_eq!(report.env_changes, vec![("k".to_string(), EnvValue::from("v"))]);
    }

    #[test]
    fn snapshot_deserializes_strings_and_numbers() {
        let snapshot: EnvSnapshot =
            serde_json::from_value(json!({"host": "api.test", "retries": 3})).unwrap();
        let env = Environment::from_snapshot(snapshot);
        assert_eq!(env.get("host"), Some(&EnvValue::from("api.test")));
        assert_eq!(env.get("retries"), Some(&EnvValue::from(3)));
        assert!(!env.has("missing"));
    }

    #[test]
    fn from_json_stringifies_non_scalar_values() {
        assert_eq!(EnvValue::from_json(json!(true)), EnvValue::from("true"));
        assert_eq!(EnvValue::from_json(json!(null)), EnvValue::from("null"));
        assert_eq!(EnvValue::from_json(json!([1, 2])), EnvValue::from("[1,2]"));
        assert_eq!(EnvValue::from_json(json!(2.5)).to_json(), json!(2.5));
    }

    #[test]
    fn resolve_prefers_narrowest_scope() {
        let env = Environment::from_snapshot(EnvSnapshot::from([("a".into(), "env".into())]));
        let collection =
            EnvSnapshot::from([("a".into(), "col".into()), ("b".into(), "col".into())]);
        let globals = EnvSnapshot::from([
            ("a".into(), "glob".into()),
            ("b".into(), "glob".into()),
            ("c".into(), "glob".into()),
        ]);
        assert_eq!(resolve("a", &env, &collection, &globals), Some(&EnvValue::from("env")));
        assert_eq!(resolve("b", &env, &collection, &globals), Some(&EnvValue::from("col")));
        assert_eq!(resolve("c", &env, &collection, &globals), Some(&EnvValue::from("glob")));
        assert_eq!(resolve("d", &env, &collection, &globals), None);
    }

    #[test]
    fn scope_names_parse() {
        assert_eq!(
            VariableScope::from_name("collectionVariables"),
            Some(VariableScope::Collection)
        );
        assert_eq!(VariableScope::from_name("cookies"), None);
    }
}
