//! Typed metadata and parameter blocks.
//!
//! # Responsibility
//! - Carry the recognized descriptive fields of an entity.
//! - Preserve unknown keys verbatim through `extra`.
//!
//! # Invariants
//! - Stored as a JSON object; unknown keys survive a load/store cycle.
//! - Merging never drops a stored field the candidate leaves unset.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "ParameterBlock::is_empty")]
    pub parameters: ParameterBlock,
    /// Keys this model does not recognize.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Metadata {
    pub fn with_title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    /// Overlays fields set on `other` onto `self`.
    ///
    /// Keywords are unioned in first-seen order.
    pub fn merge_from(&mut self, other: &Metadata) {
        if other.title.is_some() {
            self.title.clone_from(&other.title);
        }
        if other.description.is_some() {
            self.description.clone_from(&other.description);
        }
        if other.author.is_some() {
            self.author.clone_from(&other.author);
        }
        for keyword in &other.keywords {
            if !self.keywords.contains(keyword) {
                self.keywords.push(keyword.clone());
            }
        }
        self.parameters.merge_from(&other.parameters);
        for (key, value) in &other.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// One scalar parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl Display for ParamValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Ordered name -> value map for algorithm and intersection parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterBlock(BTreeMap<String, ParamValue>);

impl ParameterBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.0.insert(name.into(), value.into());
    }

    /// Builder form of `insert`.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    pub fn merge_from(&mut self, other: &ParameterBlock) {
        for (name, value) in &other.0 {
            self.0.insert(name.clone(), value.clone());
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::{Metadata, ParamValue, ParameterBlock};

    #[test]
    fn unknown_keys_survive_json_cycle() {
        let text = r#"{"title":"Bio 1","legacy_key":{"nested":[1,2]},"keywords":["temp"]}"#;
        let metadata = Metadata::from_json(text).unwrap();
        assert_eq!(metadata.title.as_deref(), Some("Bio 1"));
        assert!(metadata.extra.contains_key("legacy_key"));

        let reloaded = Metadata::from_json(&metadata.to_json().unwrap()).unwrap();
        assert_eq!(reloaded, metadata);
    }

    #[test]
    fn merge_keeps_stored_fields_the_candidate_leaves_unset() {
        let mut stored = Metadata::with_title("stored");
        stored.author = Some("lab".to_string());
        stored.keywords = vec!["a".to_string()];

        let mut candidate = Metadata::default();
        candidate.description = Some("new".to_string());
        candidate.keywords = vec!["a".to_string(), "b".to_string()];

        stored.merge_from(&candidate);
        assert_eq!(stored.title.as_deref(), Some("stored"));
        assert_eq!(stored.author.as_deref(), Some("lab"));
        assert_eq!(stored.description.as_deref(), Some("new"));
        assert_eq!(stored.keywords, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn parameter_values_keep_their_scalar_type() {
        let block = ParameterBlock::new()
            .with("min_percent", 25_i64)
            .with("filter", "weighted_mean")
            .with("use_threads", true);
        let reloaded = ParameterBlock::from_json(&block.to_json().unwrap()).unwrap();
        assert_eq!(reloaded.get("min_percent"), Some(&ParamValue::Int(25)));
        assert_eq!(
            reloaded.get("filter").and_then(ParamValue::as_str),
            Some("weighted_mean")
        );
        assert_eq!(reloaded.get("use_threads"), Some(&ParamValue::Bool(true)));
    }
}
