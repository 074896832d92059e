//! Engine presets.
//!
//! A preset maps each workload tier to a concrete `(engine, model)` pair so
//! an entire workflow can be pinned to one back-end family from the CLI.
//! Resolution order in the step executor: explicit step override → preset
//! (by the step's tier) → global override → engine default.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Workload tier of a step; selects the preset row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Lightweight work: renames, summaries, glue.
    Simple,
    /// Ordinary implementation work.
    #[default]
    Standard,
    /// Architecture, cross-cutting refactors, hard debugging.
    Complex,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Standard => write!(f, "standard"),
            Self::Complex => write!(f, "complex"),
        }
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(Self::Simple),
            "standard" => Ok(Self::Standard),
            "complex" => Ok(Self::Complex),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}

/// One preset row: the engine and model serving a tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetEntry {
    /// Engine id.
    pub engine: String,
    /// Model passed to the engine.
    pub model: String,
}

impl PresetEntry {
    fn new(engine: &str, model: &str) -> Self {
        Self {
            engine: engine.to_string(),
            model: model.to_string(),
        }
    }
}

/// A named mapping from tier to `(engine, model)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnginePreset {
    /// Preset name as given on the CLI.
    pub name: String,
    simple: PresetEntry,
    standard: PresetEntry,
    complex: PresetEntry,
}

impl EnginePreset {
    /// The entry serving `tier`.
    #[must_use]
    pub fn entry(&self, tier: Tier) -> &PresetEntry {
        match tier {
            Tier::Simple => &self.simple,
            Tier::Standard => &self.standard,
            Tier::Complex => &self.complex,
        }
    }

    /// Looks up a built-in preset by name.
    #[must_use]
    pub fn builtin(name: &str) -> Option<Self> {
        builtins().into_iter().find(|p| p.name == name)
    }

    /// Names of every built-in preset.
    #[must_use]
    pub fn builtin_names() -> Vec<&'static str> {
        vec!["all-claude", "all-gemini", "all-codex", "all-cursor"]
    }
}

/// The built-in presets, one per supported back-end family.
#[must_use]
pub fn builtins() -> Vec<EnginePreset> {
    vec![
        EnginePreset {
            name: "all-claude".to_string(),
            simple: PresetEntry::new("claude", "claude-3-5-haiku-latest"),
            standard: PresetEntry::new("claude", "claude-sonnet-4-5"),
            complex: PresetEntry::new("claude", "claude-opus-4-1"),
        },
        EnginePreset {
            name: "all-gemini".to_string(),
            simple: PresetEntry::new("gemini", "gemini-2.5-flash-lite"),
            standard: PresetEntry::new("gemini", "gemini-2.5-flash"),
            complex: PresetEntry::new("gemini", "gemini-2.5-pro"),
        },
        EnginePreset {
            name: "all-codex".to_string(),
            simple: PresetEntry::new("codex", "o4-mini"),
            standard: PresetEntry::new("codex", "gpt-5"),
            complex: PresetEntry::new("codex", "gpt-5-codex"),
        },
        EnginePreset {
            name: "all-cursor".to_string(),
            simple: PresetEntry::new("cursor", "auto"),
            standard: PresetEntry::new("cursor", "sonnet-4.5"),
            complex: PresetEntry::new("cursor", "opus-4.1"),
        },
    ]
}
