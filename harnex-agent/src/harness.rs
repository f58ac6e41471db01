// ABOUTME: Core Harness trait that every backend adapter implements, plus its data model.
// ABOUTME: Discovery is best-effort and never fails; query() is the strict, stateful operation.

use crate::query::QueryHandle;
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upper bound for an install/auth probe
pub const INSTALL_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for slash-command discovery
pub const SLASH_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Known backend identities
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum HarnessId {
    ClaudeCode,
    Codex,
    Mock,
}

impl HarnessId {
    pub const ALL: [HarnessId; 3] = [HarnessId::ClaudeCode, HarnessId::Codex, HarnessId::Mock];

    pub fn as_str(&self) -> &'static str {
        match self {
            HarnessId::ClaudeCode => "claude-code",
            HarnessId::Codex => "codex",
            HarnessId::Mock => "mock",
        }
    }
}

impl fmt::Display for HarnessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HarnessId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        HarnessId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown harness: {}", s))
    }
}

/// Static identity of a harness
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HarnessMeta {
    pub id: HarnessId,
    pub display_name: String,
    /// Binary the adapter launches
    pub binary: String,
    /// Shown when the harness is missing or its probe fails
    pub install_instructions: String,
}

/// Interaction mode requested for a query
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// Agent may edit files
    #[default]
    Edit,
    /// Agent plans but does not act
    Plan,
    /// Agent may only read
    ReadOnly,
}

impl FromStr for QueryMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "edit" => Ok(QueryMode::Edit),
            "plan" => Ok(QueryMode::Plan),
            "read_only" | "read-only" => Ok(QueryMode::ReadOnly),
            other => anyhow::bail!("Unknown mode: {}", other),
        }
    }
}

/// Thinking-effort level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    Off,
    Low,
    Medium,
    High,
}

impl FromStr for ThinkingLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(ThinkingLevel::Off),
            "low" => Ok(ThinkingLevel::Low),
            "medium" => Ok(ThinkingLevel::Medium),
            "high" => Ok(ThinkingLevel::High),
            other => anyhow::bail!("Unknown thinking level: {}", other),
        }
    }
}

/// How a harness reports the cost of a turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CostReporting {
    /// Tokens and a dollar amount
    TokensAndDollars,
    /// Tokens only; the caller prices them
    TokensOnly,
    None,
}

/// Static feature matrix of a harness
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub modes: Vec<QueryMode>,
    pub supports_resume: bool,
    pub supports_fork: bool,
    pub supports_mcp_servers: bool,
    pub supports_client_tools: bool,
    pub supports_slash_commands: bool,
    pub thinking_levels: Vec<ThinkingLevel>,
    pub cost_reporting: CostReporting,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub is_default: bool,
}

impl ModelInfo {
    pub fn new(id: &str, display_name: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            is_default: false,
        }
    }

    pub fn default_model(id: &str, display_name: &str) -> Self {
        Self {
            is_default: true,
            ..Self::new(id, display_name)
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AuthType {
    ApiKey,
    Account,
    None,
}

/// Best-effort install and auth state of a harness
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstallStatus {
    pub installed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub auth_type: AuthType,
    pub authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_instructions: Option<String>,
}

impl InstallStatus {
    pub fn not_installed(instructions: impl Into<String>) -> Self {
        Self {
            installed: false,
            version: None,
            auth_type: AuthType::None,
            authenticated: false,
            auth_instructions: Some(instructions.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandSource {
    Project,
    User,
    Builtin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlashCommand {
    /// Name without the leading slash
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub source: CommandSource,
}

/// An MCP server the backend should connect to
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A tool the consumer implements locally and exposes to the backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

/// Per-query options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    pub cwd: PathBuf,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub mode: QueryMode,
    #[serde(default)]
    pub resume_session_id: Option<String>,
    #[serde(default)]
    pub fork_session: bool,
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
    #[serde(default)]
    pub client_tools: Vec<ClientToolDefinition>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub thinking: Option<ThinkingLevel>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            cwd: PathBuf::from("."),
            model: None,
            mode: QueryMode::default(),
            resume_session_id: None,
            fork_session: false,
            mcp_servers: BTreeMap::new(),
            client_tools: Vec::new(),
            env: BTreeMap::new(),
            thinking: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
        }
    }
}

impl QueryOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            ..Self::default()
        }
    }

    pub fn is_resume(&self) -> bool {
        self.resume_session_id.is_some()
    }
}

/// Uniform control surface over one external coding-agent backend.
///
/// `meta`, `capabilities` and `models` are pure data. The two discovery
/// operations are provided methods layered over the adapter's raw probes so
/// that every adapter gets the same timeout and never-fail behaviour.
pub trait Harness: Send + Sync {
    fn meta(&self) -> HarnessMeta;

    fn capabilities(&self) -> Capabilities;

    fn models(&self) -> Vec<ModelInfo>;

    /// Raw install/auth probe. May fail; callers use `check_install_status`.
    fn probe_install<'a>(&'a self) -> BoxFuture<'a, Result<InstallStatus>>;

    /// Raw slash-command scan. May fail; callers use `discover_slash_commands`.
    fn scan_slash_commands<'a>(&'a self, cwd: &'a Path) -> BoxFuture<'a, Result<Vec<SlashCommand>>>;

    /// Launch one conversational turn.
    ///
    /// The backend is launched before this returns, so a missing binary is
    /// reported here rather than on the event stream. Requires a tokio runtime.
    fn query(&self, prompt: &str, options: &QueryOptions) -> Result<QueryHandle>;

    /// Install status that never fails: errors and timeouts become `installed: false`
    fn check_install_status<'a>(&'a self) -> BoxFuture<'a, InstallStatus> {
        Box::pin(async move {
            let meta = self.meta();
            match tokio::time::timeout(INSTALL_PROBE_TIMEOUT, self.probe_install()).await {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    tracing::warn!(harness = %meta.id, error = %e, "Install probe failed");
                    InstallStatus::not_installed(meta.install_instructions)
                }
                Err(_) => {
                    tracing::warn!(harness = %meta.id, "Install probe timed out");
                    InstallStatus::not_installed(meta.install_instructions)
                }
            }
        })
    }

    /// Slash commands that never fail: errors, timeouts and cancellation yield an empty list
    fn discover_slash_commands<'a>(
        &'a self,
        cwd: &'a Path,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Vec<SlashCommand>> {
        Box::pin(async move {
            if !self.capabilities().supports_slash_commands {
                return Vec::new();
            }
            let id = self.meta().id;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(harness = %id, "Slash command discovery cancelled");
                    Vec::new()
                }
                result = tokio::time::timeout(SLASH_COMMAND_TIMEOUT, self.scan_slash_commands(cwd)) => {
                    match result {
                        Ok(Ok(commands)) => commands,
                        Ok(Err(e)) => {
                            tracing::warn!(harness = %id, error = %e, "Slash command discovery failed");
                            Vec::new()
                        }
                        Err(_) => {
                            tracing::warn!(harness = %id, "Slash command discovery timed out");
                            Vec::new()
                        }
                    }
                }
            }
        })
    }
}
