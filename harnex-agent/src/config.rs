// ABOUTME: Configuration file support for harnex-agent.
// ABOUTME: Loads per-harness settings from TOML with [claude_code] and [codex] sections.

use crate::backends::claude_code::ClaudeCodeConfig;
use crate::backends::codex::CodexConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Adapter configuration, one section per harness
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub claude_code: ClaudeCodeConfig,
    #[serde(default)]
    pub codex: CodexConfig,
}

impl AgentConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse agent config TOML")
    }

    /// Find config file in standard locations
    /// Searches: ./harnex-agent.toml, <user config dir>/harnex/agent.toml
    pub fn find_and_load() -> Result<Option<Self>> {
        let candidates = [
            std::env::current_dir()
                .ok()
                .map(|p| p.join("harnex-agent.toml")),
            user_config_dir().map(|p| p.join("harnex/agent.toml")),
        ];

        for candidate in candidates.into_iter().flatten() {
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "Found agent config file");
                return Ok(Some(Self::from_file(&candidate)?));
            }
        }

        Ok(None)
    }
}

fn user_config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.config_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = AgentConfig::parse("").unwrap();
        assert_eq!(config.claude_code.binary, "claude");
        assert_eq!(config.codex.binary, "codex");
        assert!(config.claude_code.config_dir.is_none());
    }

    #[test]
    fn test_parse_both_sections() {
        let toml = r#"
[claude_code]
binary = "/opt/claude/bin/claude"
config_dir = "/home/dev/.claude-work"

[claude_code.env]
ANTHROPIC_BASE_URL = "http://localhost:8080"

[codex]
binary = "codex-beta"
home = "/home/dev/.codex-beta"
"#;
        let config = AgentConfig::parse(toml).unwrap();
        assert_eq!(config.claude_code.binary, "/opt/claude/bin/claude");
        assert_eq!(
            config.claude_code.config_dir,
            Some(PathBuf::from("/home/dev/.claude-work"))
        );
        assert_eq!(
            config.claude_code.env.get("ANTHROPIC_BASE_URL").map(String::as_str),
            Some("http://localhost:8080")
        );
        assert_eq!(config.codex.binary, "codex-beta");
        assert_eq!(config.codex.home, Some(PathBuf::from("/home/dev/.codex-beta")));
    }

    #[test]
    fn test_parse_invalid_toml() {
        assert!(AgentConfig::parse("[codex\nbinary = 1").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harnex-agent.toml");
        std::fs::write(&path, "[codex]\nbinary = \"my-codex\"\n").unwrap();

        let config = AgentConfig::from_file(&path).unwrap();
        assert_eq!(config.codex.binary, "my-codex");
        assert_eq!(config.claude_code.binary, "claude");
    }
}
