//! Agent definitions.
//!
//! An [`AgentSpec`] is what a module step resolves its `agent_id` against:
//! the prompt template, the workload tier, and optional engine/model pins.
//! The catalog is built by the caller (the CLI loads it from the workflow
//! configuration) and handed to the executor.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::Tier;
use crate::error::{ConfigError, Result, ValidationError};

/// Definition of one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Prompt template; `{file:path}` tokens expand to file contents.
    pub prompt: String,
    /// Workload tier, for preset resolution.
    #[serde(default)]
    pub tier: Tier,
    /// Engine pin for this agent.
    pub engine: Option<String>,
    /// Model pin for this agent.
    pub model: Option<String>,
}

/// All known agents, keyed by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentCatalog {
    agents: HashMap<String, AgentSpec>,
}

impl AgentCatalog {
    /// An empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) an agent definition.
    pub fn insert(&mut self, id: impl Into<String>, spec: AgentSpec) -> &mut Self {
        self.agents.insert(id.into(), spec);
        self
    }

    /// Builder-style [`AgentCatalog::insert`].
    #[must_use]
    pub fn with(mut self, id: impl Into<String>, spec: AgentSpec) -> Self {
        self.agents.insert(id.into(), spec);
        self
    }

    /// The definition of `id`.
    pub fn get(&self, id: &str) -> Result<&AgentSpec> {
        self.agents
            .get(id)
            .ok_or_else(|| ConfigError::AgentNotFound(id.to_string()).into())
    }

    /// Whether `id` is defined.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    /// Parses a catalog from its JSON form, rejecting agents with empty
    /// prompt templates.
    pub fn from_json(raw: &str) -> Result<Self> {
        let catalog: Self = serde_json::from_str(raw)?;
        for (id, spec) in &catalog.agents {
            if spec.prompt.trim().is_empty() {
                return Err(ValidationError::EmptyContent(format!("agent '{id}' prompt")).into());
            }
        }
        Ok(catalog)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn lookup_hits_and_misses() {
        let catalog = AgentCatalog::new().with(
            "planner",
            AgentSpec {
                prompt: "plan the work".into(),
                tier: Tier::Complex,
                ..AgentSpec::default()
            },
        );

        assert_eq!(catalog.get("planner").unwrap().tier, Tier::Complex);
        assert_eq!(
            catalog.get("ghost").unwrap_err().code(),
            "config.agent_not_found"
        );
    }

    #[test]
    fn json_catalog_parses() {
        let catalog = AgentCatalog::from_json(
            r#"{"agents": {"builder": {"prompt": "build it", "tier": "standard"}}}"#,
        )
        .unwrap();
        assert!(catalog.contains("builder"));
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let err = AgentCatalog::from_json(r#"{"agents": {"hollow": {"prompt": "  "}}}"#)
            .unwrap_err();
        assert_eq!(err.code(), "validation.empty_content");
    }
}
