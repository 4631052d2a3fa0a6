//! Session inputs and the metadata the primary model sees instead of them

use serde::Serialize;
use serde_json::Value;

use crate::config::ConfigError;
use crate::signature::Signature;

/// Ordered input values, keyed by field name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inputs {
    values: Vec<(String, Value)>,
}

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert or replace a value, keeping first-insertion order
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.values.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.values.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Check the names against the declared inputs and order them like the signature
    pub(crate) fn bind(self, signature: &Signature) -> Result<Vec<(String, Value)>, ConfigError> {
        if let Some((name, _)) = self
            .values
            .iter()
            .find(|(n, _)| !signature.input_names().any(|declared| declared == n))
        {
            return Err(ConfigError::UnexpectedInput(name.clone()));
        }

        let mut values = self.values;
        let mut bound = Vec::with_capacity(values.len());
        for declared in signature.input_names() {
            let position = values
                .iter()
                .position(|(n, _)| n == declared)
                .ok_or_else(|| ConfigError::MissingInput(declared.to_string()))?;
            bound.push(values.swap_remove(position));
        }
        Ok(bound)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Inputs {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut inputs = Inputs::new();
        for (k, v) in iter {
            inputs.insert(k, v);
        }
        inputs
    }
}

/// What the primary model is told about one input
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableInfo {
    pub name: String,
    /// JSON type: string, number, boolean, null, array, object
    pub type_tag: &'static str,
    /// Chars for strings, elements for arrays, keys for objects
    pub length: usize,
    /// Leading characters of the rendered value
    pub preview: String,
}

impl VariableInfo {
    pub fn describe(name: &str, value: &Value, preview_chars: usize) -> Self {
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let (type_tag, length) = match value {
            Value::String(s) => ("string", s.chars().count()),
            Value::Array(items) => ("array", items.len()),
            Value::Object(map) => ("object", map.len()),
            Value::Number(_) => ("number", rendered.chars().count()),
            Value::Bool(_) => ("boolean", rendered.chars().count()),
            Value::Null => ("null", 0),
        };

        let preview = match rendered.char_indices().nth(preview_chars) {
            Some((cut, _)) => format!("{}...", &rendered[..cut]),
            None => rendered,
        };

        Self {
            name: name.to_string(),
            type_tag,
            length,
            preview,
        }
    }

    fn unit(&self) -> &'static str {
        match self.type_tag {
            "array" => "items",
            "object" => "keys",
            _ => "chars",
        }
    }

    /// One entry of the opening prompt's variable list
    pub fn render(&self) -> String {
        format!(
            "- `{}` ({}, {} {})\n  preview: {}",
            self.name,
            self.type_tag,
            self.length,
            self.unit(),
            self.preview.replace('\n', "\n  ")
        )
    }
}
