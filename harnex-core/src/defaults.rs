// ABOUTME: Per-harness option defaults merged under caller options at start time.
// ABOUTME: Default model comes from the adapter; read-only mode layers extra tool denials.

use harnex_agent::{Harness, HarnessCatalog, HarnessId, QueryMode, QueryOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Claude Code tools that can change the workspace
pub const CLAUDE_CODE_READ_ONLY_DENY: [&str; 5] = ["Edit", "MultiEdit", "Write", "NotebookEdit", "Bash"];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HarnessDefaults {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    /// Denied on top of `disallowed_tools` when the mode is read_only
    #[serde(default)]
    pub read_only_disallowed_tools: Vec<String>,
}

impl HarnessDefaults {
    /// Built-in defaults for one harness
    pub fn for_harness(harness: &dyn Harness) -> Self {
        let id = harness.meta().id;
        Self {
            model: harness
                .models()
                .into_iter()
                .find(|m| m.is_default)
                .map(|m| m.id),
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            read_only_disallowed_tools: match id {
                HarnessId::ClaudeCode => CLAUDE_CODE_READ_ONLY_DENY.iter().map(|t| t.to_string()).collect(),
                HarnessId::Codex | HarnessId::Mock => Vec::new(),
            },
        }
    }

    /// Overlay configured values: a set model replaces, non-empty lists replace
    pub fn overlay(&mut self, overrides: &HarnessDefaults) {
        if overrides.model.is_some() {
            self.model = overrides.model.clone();
        }
        if !overrides.allowed_tools.is_empty() {
            self.allowed_tools = overrides.allowed_tools.clone();
        }
        if !overrides.disallowed_tools.is_empty() {
            self.disallowed_tools = overrides.disallowed_tools.clone();
        }
        if !overrides.read_only_disallowed_tools.is_empty() {
            self.read_only_disallowed_tools = overrides.read_only_disallowed_tools.clone();
        }
    }

    /// Merge caller options over these defaults
    pub fn apply(&self, mut options: QueryOptions) -> QueryOptions {
        if options.model.is_none() {
            options.model = self.model.clone();
        }

        let mut denied = union(&self.disallowed_tools, &options.disallowed_tools);
        if options.mode == QueryMode::ReadOnly {
            denied = union(&denied, &self.read_only_disallowed_tools);
        }
        let mut allowed = union(&self.allowed_tools, &options.allowed_tools);
        allowed.retain(|tool| !denied.contains(tool));

        options.allowed_tools = allowed;
        options.disallowed_tools = denied;
        options
    }
}

/// Order-preserving union without duplicates
fn union(a: &[String], b: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(a.len() + b.len());
    for tool in a.iter().chain(b) {
        if !out.contains(tool) {
            out.push(tool.clone());
        }
    }
    out
}

/// Defaults for every known harness
#[derive(Debug, Clone, Default)]
pub struct OptionDefaults {
    by_harness: HashMap<HarnessId, HarnessDefaults>,
}

impl OptionDefaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_catalog(catalog: &HarnessCatalog) -> Self {
        Self {
            by_harness: catalog
                .iter()
                .map(|h| (h.meta().id, HarnessDefaults::for_harness(h.as_ref())))
                .collect(),
        }
    }

    pub fn with_override(mut self, id: HarnessId, overrides: &HarnessDefaults) -> Self {
        self.by_harness.entry(id).or_default().overlay(overrides);
        self
    }

    pub fn get(&self, id: HarnessId) -> Option<&HarnessDefaults> {
        self.by_harness.get(&id)
    }

    pub fn apply(&self, id: HarnessId, options: QueryOptions) -> QueryOptions {
        match self.by_harness.get(&id) {
            Some(defaults) => defaults.apply(options),
            None => options,
        }
    }
}
