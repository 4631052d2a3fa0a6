//! Submission Validator
//!
//! Turns what the script passed to `SUBMIT(...)` into a [`Submission`] keyed
//! by exactly the declared output fields, or into a message the primary model
//! sees as ordinary output on its next turn.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::signature::Signature;

/// Arguments captured from a `SUBMIT(...)` call
#[derive(Debug, Clone, PartialEq)]
pub enum RawSubmission {
    /// `SUBMIT(a, b, ...)`
    Positional(Vec<Value>),
    /// `SUBMIT({field: value, ...})`
    Keyword(serde_json::Map<String, Value>),
}

impl RawSubmission {
    /// Classify the JSON renderings of the call arguments
    ///
    /// A lone plain-object argument is keyword style; anything else is positional.
    pub fn from_args(mut args: Vec<Value>) -> Self {
        if args.len() == 1 && args[0].is_object() {
            if let Some(Value::Object(map)) = args.pop() {
                return RawSubmission::Keyword(map);
            }
        }
        RawSubmission::Positional(args)
    }
}

/// Final outputs, one value per declared output field
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    fields: BTreeMap<String, Value>,
}

impl Submission {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Field value as a string slice, if it is a JSON string
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, Value> {
        self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Recoverable rejection of a submission attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ValidationError {}

/// Check a raw submission against the output contract
pub fn validate(signature: &Signature, raw: RawSubmission) -> Result<Submission, ValidationError> {
    let expected: Vec<&str> = signature.output_names().collect();
    let hint = signature.submit_hint();

    match raw {
        RawSubmission::Positional(mut values) => {
            if expected.len() == 1 {
                return match values.len() {
                    1 => Ok(single(expected[0], values.remove(0))),
                    0 => Err(ValidationError(format!(
                        "[Error] SUBMIT was called without a value. Expected output field: {}. Use {}",
                        expected[0], hint
                    ))),
                    n => Err(ValidationError(format!(
                        "[Error] SUBMIT received {} positional values but the output contract has one field ({}). Use {}",
                        n, expected[0], hint
                    ))),
                };
            }
            Err(ValidationError(format!(
                "[Error] SUBMIT received {} positional value(s) but the output contract declares {} fields ({}). \
                 Positional submission is only allowed for a single output field; pass every field by name as an object: {}",
                values.len(),
                expected.len(),
                expected.join(", "),
                hint
            )))
        }
        RawSubmission::Keyword(map) => {
            // A one-field contract takes an object without that field name as the positional value
            if expected.len() == 1 && !map.contains_key(expected[0]) {
                return Ok(single(expected[0], Value::Object(map)));
            }

            let missing: Vec<&str> = expected
                .iter()
                .copied()
                .filter(|name| !map.contains_key(*name))
                .collect();
            let unexpected: Vec<&str> = map
                .keys()
                .map(String::as_str)
                .filter(|key| !expected.contains(key))
                .collect();

            if !missing.is_empty() || !unexpected.is_empty() {
                let mut problems = Vec::new();
                if !missing.is_empty() {
                    problems.push(format!("missing output field(s): {}", missing.join(", ")));
                }
                if !unexpected.is_empty() {
                    problems.push(format!("unexpected field(s): {}", unexpected.join(", ")));
                }
                return Err(ValidationError(format!(
                    "[Error] Invalid SUBMIT: {}. Expected exactly: {}. Use {}",
                    problems.join("; "),
                    expected.join(", "),
                    hint
                )));
            }

            Ok(Submission {
                fields: map.into_iter().collect(),
            })
        }
    }
}

/// Build a submission from a JSON object, e.g. the reply of an extraction call
pub fn from_object(signature: &Signature, value: Value) -> Result<Submission, ValidationError> {
    match value {
        Value::Object(map) => validate(signature, RawSubmission::Keyword(map)),
        other => validate(signature, RawSubmission::Positional(vec![other])),
    }
}

fn single(field: &str, value: Value) -> Submission {
    let mut fields = BTreeMap::new();
    fields.insert(field.to_string(), value);
    Submission { fields }
}
