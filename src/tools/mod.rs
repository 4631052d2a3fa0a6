//! Tool Registry - everything callable from inside the sandbox
//!
//! The registry is built once per session. It always contains the four
//! built-ins and adds zero or more caller tools on top:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  ToolRegistry                                                   │
//! │                                                                 │
//! │  built-in:  llm_query  llm_query_batched  SUBMIT  print         │
//! │  user:      search_db  fetch_page  ...                          │
//! │                                                                 │
//! │  user name ∈ built-in names  ──►  ConfigError (before run)      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::ConfigError;
use crate::signature::is_identifier;

/// Names that always resolve to built-ins
pub const RESERVED_NAMES: [&str; 4] = ["llm_query", "llm_query_batched", "SUBMIT", "print"];

/// A caller-supplied function exposed inside the sandbox
///
/// Arguments arrive as the JSON rendering of the script values; the returned
/// JSON value is converted back into a script value.
#[async_trait]
pub trait Tool: Send + Sync {
    /// One-line description shown to the primary model
    fn description(&self) -> &str {
        ""
    }

    async fn invoke(&self, args: Vec<serde_json::Value>) -> Result<serde_json::Value, ToolError>;
}

/// Error returned by a caller tool; surfaced to the script as a thrown error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolError(pub String);

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ToolError {}

/// The fixed set of engine-provided functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BuiltIn {
    LlmQuery,
    LlmQueryBatched,
    Submit,
    Print,
}

impl BuiltIn {
    pub const ALL: [BuiltIn; 4] = [
        BuiltIn::LlmQuery,
        BuiltIn::LlmQueryBatched,
        BuiltIn::Submit,
        BuiltIn::Print,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BuiltIn::LlmQuery => "llm_query",
            BuiltIn::LlmQueryBatched => "llm_query_batched",
            BuiltIn::Submit => "SUBMIT",
            BuiltIn::Print => "print",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            BuiltIn::LlmQuery => "llm_query(prompt) -> string: ask the sub-model one question",
            BuiltIn::LlmQueryBatched => {
                "llm_query_batched([prompts]) -> [strings]: ask many questions concurrently, results in request order"
            }
            BuiltIn::Submit => "SUBMIT(...): finish with the final outputs; stops the current code block",
            BuiltIn::Print => "print(...values): write to the output you will see next turn",
        }
    }
}

/// Where a registered tool comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOrigin {
    BuiltIn,
    UserSupplied,
}

/// A registry entry
#[derive(Clone)]
pub enum ToolEntry {
    BuiltIn(BuiltIn),
    User(Arc<dyn Tool>),
}

impl ToolEntry {
    pub fn origin(&self) -> ToolOrigin {
        match self {
            ToolEntry::BuiltIn(_) => ToolOrigin::BuiltIn,
            ToolEntry::User(_) => ToolOrigin::UserSupplied,
        }
    }
}

impl std::fmt::Debug for ToolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolEntry::BuiltIn(b) => write!(f, "BuiltIn({})", b.name()),
            ToolEntry::User(_) => write!(f, "User"),
        }
    }
}

/// Single source of truth for sandbox callables
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    entries: BTreeMap<String, ToolEntry>,
}

impl ToolRegistry {
    /// Registry holding only the built-ins
    pub fn builtins() -> Self {
        let entries = BuiltIn::ALL
            .iter()
            .map(|b| (b.name().to_string(), ToolEntry::BuiltIn(*b)))
            .collect();
        Self { entries }
    }

    /// Merge caller tools with the built-ins, failing on any name collision
    pub fn new<I>(user_tools: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, Arc<dyn Tool>)>,
    {
        let mut registry = Self::builtins();
        for (name, tool) in user_tools {
            registry.register(name, tool)?;
        }
        Ok(registry)
    }

    fn register(&mut self, name: String, tool: Arc<dyn Tool>) -> Result<(), ConfigError> {
        check_user_tool_name(&name)?;
        if self.entries.contains_key(&name) {
            return Err(ConfigError::DuplicateTool(name));
        }
        self.entries.insert(name, ToolEntry::User(tool));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, sorted by name
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ToolEntry)> {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    /// Caller tools only, sorted by name
    pub fn user_tools(&self) -> impl Iterator<Item = (&str, &Arc<dyn Tool>)> {
        self.entries.iter().filter_map(|(name, entry)| match entry {
            ToolEntry::User(tool) => Some((name.as_str(), tool)),
            ToolEntry::BuiltIn(_) => None,
        })
    }
}

/// Reject names a caller tool may never take
pub(crate) fn check_user_tool_name(name: &str) -> Result<(), ConfigError> {
    if RESERVED_NAMES.contains(&name) {
        return Err(ConfigError::ReservedToolName(name.to_string()));
    }
    if !is_identifier(name) {
        return Err(ConfigError::InvalidToolName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        async fn invoke(&self, args: Vec<serde_json::Value>) -> Result<serde_json::Value, ToolError> {
            Ok(serde_json::Value::Array(args))
        }
    }

    fn echo() -> Arc<dyn Tool> {
        Arc::new(Echo)
    }

    #[test]
    fn test_builtins_always_present() {
        let registry = ToolRegistry::new(Vec::new()).unwrap();
        assert_eq!(registry.len(), 4);
        for name in RESERVED_NAMES {
            assert_eq!(registry.get(name).unwrap().origin(), ToolOrigin::BuiltIn);
        }
    }

    #[test]
    fn test_reserved_name_rejected() {
        for name in RESERVED_NAMES {
            let err = ToolRegistry::new(vec![(name.to_string(), echo())]).unwrap_err();
            assert_eq!(err, ConfigError::ReservedToolName(name.to_string()));
        }
    }

    #[test]
    fn test_user_tool_registered() {
        let registry = ToolRegistry::new(vec![("search_db".to_string(), echo())]).unwrap();
        assert_eq!(registry.len(), 5);
        assert_eq!(
            registry.get("search_db").unwrap().origin(),
            ToolOrigin::UserSupplied
        );
        assert_eq!(registry.user_tools().count(), 1);
    }

    #[test]
    fn test_invalid_and_duplicate_names() {
        let err = ToolRegistry::new(vec![("bad-name".to_string(), echo())]).unwrap_err();
        assert_eq!(err, ConfigError::InvalidToolName("bad-name".to_string()));

        let err = ToolRegistry::new(vec![
            ("lookup".to_string(), echo()),
            ("lookup".to_string(), echo()),
        ])
        .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateTool("lookup".to_string()));
    }
}
