// ABOUTME: Catalog of harnesses for runtime selection by id.
// ABOUTME: Harnesses register once, callers look them up by HarnessId from config or CLI.

use crate::backends::claude_code::ClaudeCodeHarness;
use crate::backends::codex::CodexHarness;
use crate::config::AgentConfig;
use crate::harness::{Harness, HarnessId};
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Registered harnesses, keyed by id
#[derive(Clone)]
pub struct HarnessCatalog {
    harnesses: BTreeMap<HarnessId, Arc<dyn Harness>>,
}

impl HarnessCatalog {
    /// Create a new empty catalog
    pub fn new() -> Self {
        Self {
            harnesses: BTreeMap::new(),
        }
    }

    /// Register a harness under its own id, replacing any previous one
    pub fn register<H>(mut self, harness: H) -> Self
    where
        H: Harness + 'static,
    {
        let id = harness.meta().id;
        self.harnesses.insert(id, Arc::new(harness));
        self
    }

    pub fn get(&self, id: HarnessId) -> Result<Arc<dyn Harness>> {
        self.harnesses
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown harness: {}", id))
    }

    /// Look up by the textual id, e.g. "claude-code"
    pub fn get_by_name(&self, name: &str) -> Result<Arc<dyn Harness>> {
        self.get(name.parse()?)
    }

    /// Ids of registered harnesses, in stable order
    pub fn available(&self) -> Vec<HarnessId> {
        self.harnesses.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Harness>> {
        self.harnesses.values()
    }

    /// The real CLI harnesses, configured from `config`
    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new()
            .register(ClaudeCodeHarness::new(config.claude_code.clone()))
            .register(CodexHarness::new(config.codex.clone()))
    }
}

impl Default for HarnessCatalog {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mock::MockHarness;

    #[test]
    fn test_default_has_cli_harnesses() {
        let catalog = HarnessCatalog::default();
        assert_eq!(
            catalog.available(),
            vec![HarnessId::ClaudeCode, HarnessId::Codex]
        );
    }

    #[test]
    fn test_unknown_harness_error() {
        let catalog = HarnessCatalog::new();
        let err = catalog.get(HarnessId::Codex).err().unwrap();
        assert_eq!(err.to_string(), "Unknown harness: codex");

        let err = catalog.get_by_name("aider").err().unwrap();
        assert_eq!(err.to_string(), "Unknown harness: aider");
    }

    #[test]
    fn test_register_replaces() {
        let catalog = HarnessCatalog::new()
            .register(MockHarness::new())
            .register(MockHarness::new());
        assert_eq!(catalog.available(), vec![HarnessId::Mock]);
        assert_eq!(catalog.get_by_name("mock").unwrap().meta().display_name, "Mock");
    }
}
