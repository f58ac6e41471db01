// ABOUTME: Claude Code harness - spawns claude -p with stream-json on both stdin and stdout.
// ABOUTME: Parses streaming JSONL into envelopes; client tools are served through a loopback MCP bridge.

use crate::bridge::ToolBridge;
use crate::event::{EnvelopeBody, ErrorCode, Usage};
use crate::harness::{
    AuthType, Capabilities, CommandSource, CostReporting, Harness, HarnessId, HarnessMeta,
    InstallStatus, ModelInfo, QueryMode, QueryOptions, SlashCommand, ThinkingLevel,
};
use crate::process::{self, Launch, Translator, VersionProbe};
use crate::query::QueryHandle;
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// MCP server name under which client tools are exposed to Claude Code
pub const CLIENT_TOOL_SERVER: &str = "harnex";

/// Configuration for the Claude Code harness
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeCodeConfig {
    /// Path to the claude binary
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Claude config directory; defaults to $CLAUDE_CONFIG_DIR or ~/.claude
    #[serde(default)]
    pub config_dir: Option<PathBuf>,
    /// Extra environment for every launch
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_binary() -> String {
    "claude".to_string()
}

impl Default for ClaudeCodeConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            config_dir: None,
            env: BTreeMap::new(),
        }
    }
}

pub struct ClaudeCodeHarness {
    config: ClaudeCodeConfig,
}

impl ClaudeCodeHarness {
    pub fn new(config: ClaudeCodeConfig) -> Self {
        Self { config }
    }

    fn config_dir(&self) -> Option<PathBuf> {
        self.config
            .config_dir
            .clone()
            .or_else(|| std::env::var_os("CLAUDE_CONFIG_DIR").map(PathBuf::from))
            .or_else(|| super::home_dir().map(|h| h.join(".claude")))
    }

    fn api_key(&self) -> Option<String> {
        self.config
            .env
            .get("ANTHROPIC_API_KEY")
            .cloned()
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }
}

impl Default for ClaudeCodeHarness {
    fn default() -> Self {
        Self::new(ClaudeCodeConfig::default())
    }
}

impl Harness for ClaudeCodeHarness {
    fn meta(&self) -> HarnessMeta {
        HarnessMeta {
            id: HarnessId::ClaudeCode,
            display_name: "Claude Code".to_string(),
            binary: self.config.binary.clone(),
            install_instructions:
                "Install Claude Code with `npm install -g @anthropic-ai/claude-code`, then run `claude` to sign in."
                    .to_string(),
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            modes: vec![QueryMode::Edit, QueryMode::Plan, QueryMode::ReadOnly],
            supports_resume: true,
            supports_fork: true,
            supports_mcp_servers: true,
            supports_client_tools: true,
            supports_slash_commands: true,
            thinking_levels: vec![
                ThinkingLevel::Off,
                ThinkingLevel::Low,
                ThinkingLevel::Medium,
                ThinkingLevel::High,
            ],
            cost_reporting: CostReporting::TokensAndDollars,
        }
    }

    fn models(&self) -> Vec<ModelInfo> {
        vec![
            ModelInfo::default_model("sonnet", "Claude Sonnet"),
            ModelInfo::new("opus", "Claude Opus"),
            ModelInfo::new("haiku", "Claude Haiku"),
        ]
    }

    fn probe_install<'a>(&'a self) -> BoxFuture<'a, Result<InstallStatus>> {
        Box::pin(async move {
            let version = match process::probe_version(&self.config.binary).await? {
                VersionProbe::Missing => {
                    return Ok(InstallStatus::not_installed(self.meta().install_instructions))
                }
                VersionProbe::Found(version) => version,
            };

            let (auth_type, authenticated) = match self.config_dir() {
                Some(dir) => detect_auth(self.api_key().as_deref(), &dir).await,
                None => detect_auth(self.api_key().as_deref(), Path::new(".claude")).await,
            };

            Ok(InstallStatus {
                installed: true,
                version,
                auth_type,
                authenticated,
                auth_instructions: (!authenticated).then(|| {
                    "Run `claude` and complete /login, or set ANTHROPIC_API_KEY.".to_string()
                }),
            })
        })
    }

    fn scan_slash_commands<'a>(&'a self, cwd: &'a Path) -> BoxFuture<'a, Result<Vec<SlashCommand>>> {
        Box::pin(async move {
            let mut commands = Vec::new();
            let mut seen = HashSet::new();

            let project = scan_command_dir(&cwd.join(".claude").join("commands"), CommandSource::Project).await?;
            let user = match self.config_dir() {
                Some(dir) => scan_command_dir(&dir.join("commands"), CommandSource::User).await?,
                None => Vec::new(),
            };

            for command in project.into_iter().chain(user).chain(builtin_commands()) {
                if seen.insert(command.name.clone()) {
                    commands.push(command);
                }
            }
            Ok(commands)
        })
    }

    fn query(&self, prompt: &str, options: &QueryOptions) -> Result<QueryHandle> {
        if options.fork_session && !options.is_resume() {
            tracing::debug!("fork_session without resume_session_id has no effect, ignoring");
        }

        let mut env = self.config.env.clone();
        env.extend(options.env.clone());
        if let Some(level) = options.thinking {
            env.insert("MAX_THINKING_TOKENS".to_string(), thinking_budget(level).to_string());
        }

        let bridge = if options.client_tools.is_empty() {
            None
        } else {
            Some(ToolBridge::start(options.client_tools.clone())?)
        };

        let launch = Launch {
            binary: self.config.binary.clone(),
            args: build_args(options, bridge.as_ref().map(ToolBridge::url)),
            cwd: options.cwd.clone(),
            env,
            stdin: true,
        };
        let child = launch.spawn()?;

        let input = user_message(prompt);
        let binary = launch.binary;

        Ok(QueryHandle::spawn(HarnessId::ClaudeCode, move |ctx| {
            process::drive(child, binary, Some(input), ClaudeTranslator::default(), bridge, ctx)
        }))
    }
}

fn thinking_budget(level: ThinkingLevel) -> u32 {
    match level {
        ThinkingLevel::Off => 0,
        ThinkingLevel::Low => 4_000,
        ThinkingLevel::Medium => 10_000,
        ThinkingLevel::High => 31_999,
    }
}

/// `client_tool_url` is the bridge endpoint serving `options.client_tools`
fn build_args(options: &QueryOptions, client_tool_url: Option<&str>) -> Vec<String> {
    let mut args: Vec<String> = [
        "-p",
        "--output-format",
        "stream-json",
        "--input-format",
        "stream-json",
        "--verbose",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if let Some(ref model) = options.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }

    let permission_mode = match options.mode {
        QueryMode::Edit => "acceptEdits",
        QueryMode::Plan => "plan",
        QueryMode::ReadOnly => "default",
    };
    args.push("--permission-mode".to_string());
    args.push(permission_mode.to_string());

    if let Some(ref session_id) = options.resume_session_id {
        args.push("--resume".to_string());
        args.push(session_id.clone());
        if options.fork_session {
            args.push("--fork-session".to_string());
        }
    }

    let mut servers: serde_json::Map<String, Value> = options
        .mcp_servers
        .iter()
        .map(|(name, server)| {
            (
                name.clone(),
                json!({
                    "command": server.command,
                    "args": server.args,
                    "env": server.env,
                }),
            )
        })
        .collect();
    if let Some(url) = client_tool_url {
        if servers.contains_key(CLIENT_TOOL_SERVER) {
            tracing::warn!(server = CLIENT_TOOL_SERVER, "MCP server name is reserved for client tools, replacing it");
        }
        servers.insert(
            CLIENT_TOOL_SERVER.to_string(),
            json!({ "type": "http", "url": url }),
        );
    }
    if !servers.is_empty() {
        args.push("--mcp-config".to_string());
        args.push(json!({ "mcpServers": servers }).to_string());
    }

    let mut allowed = options.allowed_tools.clone();
    if client_tool_url.is_some() {
        allowed.extend(
            options
                .client_tools
                .iter()
                .map(|tool| format!("mcp__{}__{}", CLIENT_TOOL_SERVER, tool.name)),
        );
    }
    if !allowed.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(allowed.join(","));
    }
    if !options.disallowed_tools.is_empty() {
        args.push("--disallowedTools".to_string());
        args.push(options.disallowed_tools.join(","));
    }

    args
}

fn user_message(text: &str) -> Value {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{ "type": "text", "text": text }],
        },
    })
}

/// Translates Claude Code stream-json into envelopes.
///
/// Client tool calls arrive through the bridge, so `mcp__harnex__*` tool_use
/// blocks here are only forwarded raw.
#[derive(Default)]
struct ClaudeTranslator {
    session_reported: bool,
}

impl Translator for ClaudeTranslator {
    fn translate(&mut self, json: &Value) -> Vec<EnvelopeBody> {
        let event_type = json.get("type").and_then(|t| t.as_str()).unwrap_or("");
        let mut events = Vec::new();

        match event_type {
            "system" => {
                let subtype = json.get("subtype").and_then(|s| s.as_str());
                if subtype == Some("init") && !self.session_reported {
                    if let Some(session_id) = json.get("session_id").and_then(|s| s.as_str()) {
                        self.session_reported = true;
                        events.push(EnvelopeBody::SessionStarted {
                            session_id: session_id.to_string(),
                        });
                    }
                }
            }
            "result" => {
                let subtype = json.get("subtype").and_then(|s| s.as_str()).unwrap_or("");
                let is_error = json
                    .get("is_error")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
                    || subtype.starts_with("error");

                if is_error {
                    let message = json
                        .get("error")
                        .and_then(|e| e.as_str())
                        .or_else(|| json.get("result").and_then(|r| r.as_str()))
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("Claude Code reported {}", subtype));
                    let code = ErrorCode::classify(&message);
                    events.push(EnvelopeBody::Error { message, code });
                } else {
                    events.push(EnvelopeBody::Complete {
                        usage: extract_usage(json),
                    });
                }
            }
            _ => {}
        }

        events
    }

    fn classify_stderr(&mut self, line: &str) -> Option<EnvelopeBody> {
        if line.contains("No conversation found with session ID") {
            tracing::warn!("Detected defunct session on resume");
            return Some(EnvelopeBody::Error {
                message: line.trim().to_string(),
                code: ErrorCode::SessionDefunct,
            });
        }
        None
    }
}

fn extract_usage(json: &Value) -> Option<Usage> {
    let mut usage = Usage::default();
    let mut found_usage = false;

    if let Some(cost) = json.get("total_cost_usd").and_then(|v| v.as_f64()) {
        usage.cost_usd = Some(cost);
        found_usage = true;
    }

    if let Some(duration) = json.get("duration_ms").and_then(|v| v.as_u64()) {
        usage.duration_ms = Some(duration);
        found_usage = true;
    }

    if let Some(usage_obj) = json.get("usage") {
        usage.input_tokens = usage_obj
            .get("input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        usage.output_tokens = usage_obj
            .get("output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        usage.cache_read_tokens = usage_obj
            .get("cache_read_input_tokens")
            .and_then(|v| v.as_u64());
        usage.cache_write_tokens = usage_obj
            .get("cache_creation_input_tokens")
            .and_then(|v| v.as_u64());
        found_usage = true;
    }

    // modelUsage carries aggregated counts when the top-level usage is empty
    if usage.input_tokens == 0 && usage.output_tokens == 0 {
        if let Some(model_usage) = json.get("modelUsage").and_then(|v| v.as_object()) {
            for stats in model_usage.values() {
                usage.input_tokens += stats
                    .get("inputTokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                usage.output_tokens += stats
                    .get("outputTokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                found_usage = true;
            }
        }
    }

    found_usage.then_some(usage)
}

/// Work out how Claude Code is authenticated from an API key and its config dir
async fn detect_auth(api_key: Option<&str>, config_dir: &Path) -> (AuthType, bool) {
    if api_key.is_some() {
        return (AuthType::ApiKey, true);
    }
    if tokio::fs::try_exists(config_dir.join(".credentials.json"))
        .await
        .unwrap_or(false)
    {
        return (AuthType::Account, true);
    }
    // ~/.claude -> ~/.claude.json holds the signed-in account on some platforms
    let state_file = config_dir.with_file_name(".claude.json");
    if let Ok(contents) = tokio::fs::read_to_string(&state_file).await {
        if contents.contains("\"oauthAccount\"") {
            return (AuthType::Account, true);
        }
    }
    (AuthType::Account, false)
}

async fn scan_command_dir(root: &Path, source: CommandSource) -> Result<Vec<SlashCommand>> {
    let mut commands = Vec::new();
    if !tokio::fs::try_exists(root).await.unwrap_or(false) {
        return Ok(commands);
    }

    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(name) = command_name(root, &path) else {
                continue;
            };
            let description = match tokio::fs::read_to_string(&path).await {
                Ok(contents) => front_matter_description(&contents),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Unreadable command file");
                    None
                }
            };
            commands.push(SlashCommand {
                name,
                description,
                source,
            });
        }
    }

    commands.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(commands)
}

/// `frontend/review.md` under the commands root becomes `frontend:review`
fn command_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?.with_extension("");
    let parts: Vec<&str> = relative
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(":"))
    }
}

fn front_matter_description(contents: &str) -> Option<String> {
    let mut lines = contents.lines();
    if lines.next()?.trim() != "---" {
        return None;
    }
    for line in lines {
        let line = line.trim();
        if line == "---" {
            break;
        }
        if let Some(value) = line.strip_prefix("description:") {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn builtin_commands() -> Vec<SlashCommand> {
    [
        ("clear", "Clear conversation history"),
        ("compact", "Summarize the conversation to free context"),
        ("context", "Show context window usage"),
        ("cost", "Show token usage and cost for this session"),
        ("init", "Initialize a CLAUDE.md file with codebase documentation"),
        ("review", "Review a pull request"),
    ]
    .into_iter()
    .map(|(name, description)| SlashCommand {
        name: name.to_string(),
        description: Some(description.to_string()),
        source: CommandSource::Builtin,
    })
    .collect()
}
