// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Carries adapter settings, per-harness option defaults and logging options
use crate::paths;
use anyhow::{Context, Result};
use harnex_agent::{AgentConfig, HarnessCatalog, HarnessId};
use harnex_core::{HarnessDefaults, OptionDefaults};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Adapter settings: binaries, config dirs, extra env
    #[serde(default)]
    pub agent: AgentConfig,
    /// Option defaults keyed by harness id (e.g. `[defaults.claude-code]`)
    #[serde(default)]
    pub defaults: BTreeMap<String, HarnessDefaults>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// EnvFilter directive used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also write a daily-rolling log file
    #[serde(default)]
    pub file: bool,
    /// Log file directory; defaults to the XDG data dir
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    /// Write the log file as JSON lines
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: false,
            directory: None,
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl LoggingConfig {
    pub fn log_dir(&self) -> PathBuf {
        self.directory
            .as_deref()
            .map(|d| PathBuf::from(expand_tilde(d)))
            .unwrap_or_else(paths::log_dir)
    }
}

/// Expand tilde (~) to home directory in paths
/// Logs a warning if expansion fails and falls back to the original path
fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(base_dirs) = directories::BaseDirs::new() {
            return base_dirs
                .home_dir()
                .join(stripped)
                .to_string_lossy()
                .to_string();
        }
        tracing::warn!(path = %path, "Failed to expand tilde in path: could not determine home directory");
    }
    path.to_string()
}

/// Parse a boolean-ish env value ("1", "true", "yes", "on" and their negatives)
fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("{} must be true or false, got: {}", name, other),
    }
}

impl Config {
    /// Find the config file, checking multiple locations in order:
    /// 1. HARNEX_CONFIG_PATH env var (if set)
    /// 2. ./harnex.toml (current directory)
    /// 3. ~/.config/harnex/config.toml (XDG config dir)
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("HARNEX_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
        }

        let local_config = PathBuf::from("harnex.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse harnex config TOML")
    }

    /// Load configuration with environment variable overrides.
    /// An explicit path must exist; otherwise the standard locations are searched.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => Self::find_config_file(),
        };
        let mut config = match path {
            Some(config_path) => {
                tracing::info!(path = %config_path.display(), "Loading configuration from file");
                let content = std::fs::read_to_string(&config_path)
                    .with_context(|| format!("Failed to read {}", config_path.display()))?;
                Self::parse(&content)
                    .with_context(|| format!("Invalid config file {}", config_path.display()))?
            }
            None => {
                tracing::info!("No config file found, using environment variables and defaults");
                Config::default()
            }
        };

        config.apply_env()?;
        config.agent.claude_code.binary = expand_tilde(&config.agent.claude_code.binary);
        config.agent.codex.binary = expand_tilde(&config.agent.codex.binary);
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("HARNEX_CLAUDE_BINARY") {
            self.agent.claude_code.binary = val;
        }
        if let Ok(val) = std::env::var("HARNEX_CODEX_BINARY") {
            self.agent.codex.binary = val;
        }
        if let Ok(val) = std::env::var("HARNEX_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("HARNEX_LOG_FILE") {
            self.logging.file = parse_flag("HARNEX_LOG_FILE", &val)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.claude_code.binary.trim().is_empty() {
            anyhow::bail!("agent.claude_code.binary must not be empty");
        }
        if self.agent.codex.binary.trim().is_empty() {
            anyhow::bail!("agent.codex.binary must not be empty");
        }
        tracing_subscriber::EnvFilter::try_new(&self.logging.level).with_context(|| {
            format!("Invalid logging.level '{}'", self.logging.level)
        })?;
        for key in self.defaults.keys() {
            key.parse::<HarnessId>()
                .with_context(|| format!("Invalid [defaults.{}] section", key))?;
        }
        Ok(())
    }

    /// Built-in defaults for every catalog harness with configured overrides on top
    pub fn option_defaults(&self, catalog: &HarnessCatalog) -> Result<OptionDefaults> {
        let mut defaults = OptionDefaults::from_catalog(catalog);
        for (key, overrides) in &self.defaults {
            let id: HarnessId = key.parse()?;
            defaults = defaults.with_override(id, overrides);
        }
        Ok(defaults)
    }

    pub fn catalog(&self) -> HarnessCatalog {
        HarnessCatalog::from_config(&self.agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.file);
        assert!(config.defaults.is_empty());
        assert_eq!(config.agent.claude_code.binary, "claude");
    }

    #[test]
    fn test_parse_flag_values() {
        assert!(parse_flag("X", "yes").unwrap());
        assert!(parse_flag("X", "TRUE").unwrap());
        assert!(!parse_flag("X", "0").unwrap());
        assert!(parse_flag("X", "maybe").is_err());
    }

    #[test]
    fn test_unknown_defaults_section_rejected() {
        let config = Config::parse("[defaults.gemini]\nmodel = \"x\"\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("defaults.gemini"));
    }

    #[test]
    fn test_option_defaults_layer_overrides() {
        let config = Config::parse(
            r#"
[defaults.codex]
model = "gpt-5"
"#,
        )
        .unwrap();
        let defaults = config.option_defaults(&config.catalog()).unwrap();
        assert_eq!(
            defaults.get(HarnessId::Codex).unwrap().model.as_deref(),
            Some("gpt-5")
        );
        assert_eq!(
            defaults.get(HarnessId::ClaudeCode).unwrap().model.as_deref(),
            Some("sonnet")
        );
    }

    #[test]
    fn test_log_dir_override() {
        let logging = LoggingConfig {
            directory: Some("/var/log/harnex".to_string()),
            ..LoggingConfig::default()
        };
        assert_eq!(logging.log_dir(), PathBuf::from("/var/log/harnex"));
    }
}
