use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

use crate::errors::CsResult;

/// Unique configuration identifier.
pub type ConfigurationId = Uuid;

/// A concrete parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl ParameterValue {
    /// Numeric view of the value; integers widen to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            Self::Json(serde_json::Value::Bool(v)) => Some(*v),
            _ => None,
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// Parameter name -> value, ordered by name so serialized configurations are
/// stable.
pub type ParameterMap = BTreeMap<String, ParameterValue>;

/// One candidate cut-selection policy.
///
/// Configurations are immutable once created: a changed policy is a new
/// configuration with a new id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub id: ConfigurationId,
    pub name: String,
    pub parameters: ParameterMap,
    pub created_at: DateTime<Utc>,
}

impl Configuration {
    pub fn new(name: impl Into<String>, parameters: ParameterMap) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            parameters,
            created_at: Utc::now(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.parameters.get(name)
    }

    /// Whether two configurations describe the same policy (ids ignored).
    pub fn same_parameters(&self, other: &Configuration) -> bool {
        self.parameters == other.parameters
    }

    /// Write the configuration as pretty JSON; this is the file handed to the
    /// solver.
    pub fn save(&self, path: &Path) -> CsResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> CsResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_values_keep_their_kind() {
        let json = r#"{"a": true, "b": 2, "c": 0.5, "d": "hybrid"}"#;
        let params: ParameterMap = serde_json::from_str(json).unwrap();
        assert_eq!(params["a"], ParameterValue::Bool(true));
        assert_eq!(params["b"], ParameterValue::Int(2));
        assert_eq!(params["c"], ParameterValue::Float(0.5));
        assert_eq!(
            params["d"],
            ParameterValue::Json(serde_json::json!("hybrid"))
        );
    }

    #[test]
    fn configurations_get_distinct_ids() {
        let mut params = ParameterMap::new();
        params.insert("eff".into(), ParameterValue::Float(1.0));
        let a = Configuration::new("a", params.clone());
        let b = Configuration::new("b", params);
        assert_ne!(a.id, b.id);
        assert!(a.same_parameters(&b));
    }

    #[test]
    fn numeric_views() {
        assert_eq!(ParameterValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(ParameterValue::Bool(true).as_f64(), None);
        assert_eq!(ParameterValue::Bool(false).as_bool(), Some(false));
    }
}
