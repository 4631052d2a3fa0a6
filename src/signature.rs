//! Input/output contract of a run
//!
//! A signature is written as `"field1, field2 -> out1, out2"`. Each field may
//! carry a free-form type hint (`sources: list[str]`) that is only shown to the
//! primary model; the engine never checks values against it.

use std::collections::HashSet;
use std::fmt;

use crate::config::ConfigError;
use crate::tools::RESERVED_NAMES;

/// A single declared field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Field name, also the sandbox variable name for inputs
    pub name: String,
    /// Optional type hint from the signature text
    pub type_hint: Option<String>,
}

impl Field {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_hint: None,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.type_hint {
            Some(hint) => write!(f, "{}: {}", self.name, hint),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Declared input and output fields of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    inputs: Vec<Field>,
    outputs: Vec<Field>,
    instructions: Option<String>,
}

impl Signature {
    /// Parse a signature string of the form `"a, b -> c, d"`
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let (lhs, rhs) = text
            .split_once("->")
            .ok_or_else(|| malformed(text, "missing '->' between inputs and outputs"))?;

        let inputs = parse_side(text, lhs, "input")?;
        let outputs = parse_side(text, rhs, "output")?;

        let mut seen = HashSet::new();
        for field in inputs.iter().chain(outputs.iter()) {
            if !seen.insert(field.name.as_str()) {
                return Err(malformed(
                    text,
                    &format!("field '{}' is declared more than once", field.name),
                ));
            }
        }

        Ok(Self {
            inputs,
            outputs,
            instructions: None,
        })
    }

    /// Attach task instructions shown to the primary model
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn inputs(&self) -> &[Field] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Field] {
        &self.outputs
    }

    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|f| f.name.as_str())
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|f| f.name.as_str())
    }

    /// `SUBMIT(...)` call shape matching the output contract
    pub fn submit_hint(&self) -> String {
        if self.outputs.len() == 1 {
            format!("SUBMIT(value) or SUBMIT({{{}: value}})", self.outputs[0].name)
        } else {
            let fields = self
                .outputs
                .iter()
                .map(|f| format!("{}: ...", f.name))
                .collect::<Vec<_>>()
                .join(", ");
            format!("SUBMIT({{{}}})", fields)
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |fields: &[Field]| {
            fields
                .iter()
                .map(|field| field.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(f, "{} -> {}", join(&self.inputs), join(&self.outputs))
    }
}

impl std::str::FromStr for Signature {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_side(text: &str, side: &str, kind: &str) -> Result<Vec<Field>, ConfigError> {
    let mut fields = Vec::new();
    for raw in side.split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(malformed(text, &format!("empty {} field", kind)));
        }

        let (name, type_hint) = match raw.split_once(':') {
            Some((name, hint)) => {
                let hint = hint.trim();
                if hint.is_empty() {
                    return Err(malformed(text, &format!("empty type hint on '{}'", name.trim())));
                }
                (name.trim(), Some(hint.to_string()))
            }
            None => (raw, None),
        };

        if !is_identifier(name) {
            return Err(malformed(
                text,
                &format!("'{}' is not a valid {} field name", name, kind),
            ));
        }
        if RESERVED_NAMES.contains(&name) {
            return Err(malformed(
                text,
                &format!("'{}' is a reserved built-in name", name),
            ));
        }

        fields.push(Field {
            name: name.to_string(),
            type_hint,
        });
    }
    Ok(fields)
}

/// ASCII identifier usable as a JavaScript global binding
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

fn malformed(text: &str, reason: &str) -> ConfigError {
    ConfigError::MalformedSignature {
        signature: text.to_string(),
        reason: reason.to_string(),
    }
}
