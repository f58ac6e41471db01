// ABOUTME: Codex harness - spawns codex exec --json and translates its JSONL events.
// ABOUTME: Resume runs `codex exec resume <id>` and must not repeat sandbox/cwd flags.

use crate::event::{EnvelopeBody, ErrorCode, Usage};
use crate::harness::{
    AuthType, Capabilities, CostReporting, Harness, HarnessId, HarnessMeta, InstallStatus,
    ModelInfo, QueryMode, QueryOptions, SlashCommand, ThinkingLevel,
};
use crate::process::{self, Launch, Translator, VersionProbe};
use crate::query::QueryHandle;
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Configuration for the Codex harness
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodexConfig {
    /// Path to the codex binary
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Codex home; defaults to $CODEX_HOME or ~/.codex
    #[serde(default)]
    pub home: Option<PathBuf>,
    /// Extra environment for every launch
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_binary() -> String {
    "codex".to_string()
}

impl Default for CodexConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            home: None,
            env: BTreeMap::new(),
        }
    }
}

pub struct CodexHarness {
    config: CodexConfig,
}

impl CodexHarness {
    pub fn new(config: CodexConfig) -> Self {
        Self { config }
    }

    fn codex_home(&self) -> Option<PathBuf> {
        self.config
            .home
            .clone()
            .or_else(|| std::env::var_os("CODEX_HOME").map(PathBuf::from))
            .or_else(|| super::home_dir().map(|h| h.join(".codex")))
    }

    fn api_key(&self) -> Option<String> {
        ["OPENAI_API_KEY", "CODEX_API_KEY"].iter().find_map(|key| {
            self.config
                .env
                .get(*key)
                .cloned()
                .or_else(|| std::env::var(key).ok())
                .filter(|k| !k.trim().is_empty())
        })
    }
}

impl Default for CodexHarness {
    fn default() -> Self {
        Self::new(CodexConfig::default())
    }
}

impl Harness for CodexHarness {
    fn meta(&self) -> HarnessMeta {
        HarnessMeta {
            id: HarnessId::Codex,
            display_name: "Codex".to_string(),
            binary: self.config.binary.clone(),
            install_instructions:
                "Install Codex with `npm install -g @openai/codex`, then run `codex login`."
                    .to_string(),
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            modes: vec![QueryMode::Edit, QueryMode::Plan, QueryMode::ReadOnly],
            supports_resume: true,
            supports_fork: false,
            supports_mcp_servers: true,
            supports_client_tools: false,
            supports_slash_commands: false,
            thinking_levels: vec![ThinkingLevel::Low, ThinkingLevel::Medium, ThinkingLevel::High],
            cost_reporting: CostReporting::TokensOnly,
        }
    }

    fn models(&self) -> Vec<ModelInfo> {
        vec![
            ModelInfo::default_model("gpt-5-codex", "GPT-5 Codex"),
            ModelInfo::new("gpt-5", "GPT-5"),
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

            let (auth_type, authenticated) = match self.api_key() {
                Some(_) => (AuthType::ApiKey, true),
                None => match self.codex_home() {
                    Some(home) => detect_auth_file(&home.join("auth.json")).await,
                    None => (AuthType::Account, false),
                },
            };

            Ok(InstallStatus {
                installed: true,
                version,
                auth_type,
                authenticated,
                auth_instructions: (!authenticated)
                    .then(|| "Run `codex login`, or set OPENAI_API_KEY.".to_string()),
            })
        })
    }

    fn scan_slash_commands<'a>(&'a self, _cwd: &'a Path) -> BoxFuture<'a, Result<Vec<SlashCommand>>> {
        // codex exec has no slash commands
        Box::pin(async { Ok(Vec::new()) })
    }

    fn query(&self, prompt: &str, options: &QueryOptions) -> Result<QueryHandle> {
        if options.fork_session {
            tracing::debug!("Codex cannot fork sessions, ignoring fork_session");
        }
        if !options.client_tools.is_empty() {
            tracing::debug!(count = options.client_tools.len(), "Codex has no client tool channel, tools not exposed");
        }
        if !options.allowed_tools.is_empty() || !options.disallowed_tools.is_empty() {
            tracing::debug!("Codex has no tool allow/deny lists, relying on sandbox mode");
        }

        let mut env = self.config.env.clone();
        env.extend(options.env.clone());

        let launch = Launch {
            binary: self.config.binary.clone(),
            args: build_args(prompt, options),
            cwd: options.cwd.clone(),
            env,
            stdin: false,
        };
        let child = launch.spawn()?;
        let binary = launch.binary;

        Ok(QueryHandle::spawn(HarnessId::Codex, move |ctx| {
            process::drive(child, binary, None, CodexTranslator::default(), None, ctx)
        }))
    }
}

fn sandbox_mode(mode: QueryMode) -> &'static str {
    match mode {
        QueryMode::Edit => "workspace-write",
        QueryMode::Plan | QueryMode::ReadOnly => "read-only",
    }
}

fn reasoning_effort(level: ThinkingLevel) -> Option<&'static str> {
    match level {
        ThinkingLevel::Off => None,
        ThinkingLevel::Low => Some("low"),
        ThinkingLevel::Medium => Some("medium"),
        ThinkingLevel::High => Some("high"),
    }
}

fn build_args(prompt: &str, options: &QueryOptions) -> Vec<String> {
    let mut args = vec!["exec".to_string(), "--json".to_string()];

    if let Some(ref model) = options.model {
        args.push("-m".to_string());
        args.push(model.clone());
    }

    if let Some(effort) = options.thinking.and_then(reasoning_effort) {
        args.push("-c".to_string());
        args.push(format!("model_reasoning_effort={}", effort));
    }

    for (name, server) in &options.mcp_servers {
        args.push("-c".to_string());
        args.push(format!("mcp_servers.{}.command={}", name, toml_string(&server.command)));
        if !server.args.is_empty() {
            let list: Vec<String> = server.args.iter().map(|a| toml_string(a)).collect();
            args.push("-c".to_string());
            args.push(format!("mcp_servers.{}.args=[{}]", name, list.join(",")));
        }
        for (key, value) in &server.env {
            args.push("-c".to_string());
            args.push(format!("mcp_servers.{}.env.{}={}", name, key, toml_string(value)));
        }
    }

    match options.resume_session_id {
        // The resumed session keeps its own sandbox and cwd; passing them again is rejected
        Some(ref session_id) => {
            args.push("resume".to_string());
            args.push(session_id.clone());
        }
        None => {
            args.push("-s".to_string());
            args.push(sandbox_mode(options.mode).to_string());
            args.push("-C".to_string());
            args.push(options.cwd.display().to_string());
        }
    }

    args.push(prompt.to_string());
    args
}

fn toml_string(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}

/// Translates `codex exec --json` events into envelopes
#[derive(Default)]
struct CodexTranslator {
    session_reported: bool,
}

impl Translator for CodexTranslator {
    fn translate(&mut self, json: &Value) -> Vec<EnvelopeBody> {
        let event_type = json.get("type").and_then(|t| t.as_str()).unwrap_or("");
        let mut events = Vec::new();

        match event_type {
            // thread_id is the session id
            "thread.started" => {
                if let Some(thread_id) = json.get("thread_id").and_then(|t| t.as_str()) {
                    if !self.session_reported {
                        self.session_reported = true;
                        events.push(EnvelopeBody::SessionStarted {
                            session_id: thread_id.to_string(),
                        });
                    }
                }
            }
            "turn.completed" => {
                let usage = json.get("usage").map(|usage| Usage {
                    input_tokens: usage
                        .get("input_tokens")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0),
                    output_tokens: usage
                        .get("output_tokens")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0),
                    cache_read_tokens: usage.get("cached_input_tokens").and_then(|v| v.as_u64()),
                    ..Usage::default()
                });
                events.push(EnvelopeBody::Complete { usage });
            }
            "turn.failed" => {
                let message = json
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("Codex turn failed")
                    .to_string();
                let code = ErrorCode::classify(&message);
                events.push(EnvelopeBody::Error { message, code });
            }
            "error" => {
                let message = json
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("Unknown error")
                    .to_string();
                let code = ErrorCode::classify(&message);
                events.push(EnvelopeBody::Error { message, code });
            }
            _ => {}
        }

        events
    }

    fn classify_stderr(&mut self, line: &str) -> Option<EnvelopeBody> {
        let lower = line.to_lowercase();
        let missing = lower.contains("not found") || lower.contains("no rollout found");
        if missing && (lower.contains("session") || lower.contains("thread") || lower.contains("rollout")) {
            tracing::warn!("Detected defunct Codex session on resume");
            return Some(EnvelopeBody::Error {
                message: line.trim().to_string(),
                code: ErrorCode::SessionDefunct,
            });
        }
        None
    }
}

/// Read Codex's auth.json: an API key entry means api-key auth, tokens mean an account
async fn detect_auth_file(path: &Path) -> (AuthType, bool) {
    let Ok(contents) = tokio::fs::read_to_string(path).await else {
        return (AuthType::Account, false);
    };
    let Ok(json) = serde_json::from_str::<Value>(&contents) else {
        tracing::debug!(path = %path.display(), "Unparseable Codex auth file");
        return (AuthType::Account, false);
    };
    if json
        .get("OPENAI_API_KEY")
        .and_then(|v| v.as_str())
        .is_some_and(|k| !k.is_empty())
    {
        return (AuthType::ApiKey, true);
    }
    if json.get("tokens").is_some_and(|t| !t.is_null()) {
        return (AuthType::Account, true);
    }
    (AuthType::Account, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::McpServerConfig;
    use serde_json::json;

    #[test]
    fn test_thread_started_is_session() {
        let mut t = CodexTranslator::default();
        let events = t.translate(&json!({"type": "thread.started", "thread_id": "th_1"}));
        assert_eq!(
            events,
            vec![EnvelopeBody::SessionStarted {
                session_id: "th_1".to_string()
            }]
        );
    }

    #[test]
    fn test_turn_completed_reports_tokens_without_cost() {
        let mut t = CodexTranslator::default();
        let events = t.translate(&json!({
            "type": "turn.completed",
            "usage": {"input_tokens": 120, "cached_input_tokens": 20, "output_tokens": 30}
        }));
        match &events[0] {
            EnvelopeBody::Complete { usage: Some(usage) } => {
                assert_eq!(usage.input_tokens, 120);
                assert_eq!(usage.output_tokens, 30);
                assert_eq!(usage.cache_read_tokens, Some(20));
                assert_eq!(usage.cost_usd, None);
            }
            other => panic!("Expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn test_turn_failed_is_error() {
        let mut t = CodexTranslator::default();
        let events = t.translate(&json!({"type": "turn.failed", "error": {"message": "stream timed out"}}));
        assert_eq!(
            events,
            vec![EnvelopeBody::Error {
                message: "stream timed out".to_string(),
                code: ErrorCode::Timeout,
            }]
        );
    }

    #[test]
    fn test_item_events_are_raw_only() {
        let mut t = CodexTranslator::default();
        let events = t.translate(&json!({
            "type": "item.completed",
            "item": {"id": "item_0", "type": "agent_message", "text": "Done"}
        }));
        assert!(events.is_empty());
    }

    #[test]
    fn test_fresh_session_args_include_sandbox_and_cwd() {
        let mut options = QueryOptions::new("/work");
        options.mode = QueryMode::ReadOnly;
        options.model = Some("gpt-5".to_string());
        options.thinking = Some(ThinkingLevel::High);
        let args = build_args("fix it", &options);

        assert_eq!(&args[..2], ["exec", "--json"]);
        assert!(args.windows(2).any(|w| w == ["-s", "read-only"]));
        assert!(args.windows(2).any(|w| w == ["-C", "/work"]));
        assert!(args.windows(2).any(|w| w == ["-m", "gpt-5"]));
        assert!(args.windows(2).any(|w| w == ["-c", "model_reasoning_effort=high"]));
        assert_eq!(args.last().map(String::as_str), Some("fix it"));
    }

    #[test]
    fn test_resume_args_omit_sandbox_and_cwd() {
        let mut options = QueryOptions::new("/work");
        options.resume_session_id = Some("th_1".to_string());
        let args = build_args("continue", &options);

        assert!(!args.contains(&"-s".to_string()));
        assert!(!args.contains(&"-C".to_string()));
        let idx = args.iter().position(|a| a == "resume").unwrap();
        assert_eq!(args[idx + 1], "th_1");
        assert_eq!(args[idx + 2], "continue");
    }

    #[test]
    fn test_mcp_servers_become_config_overrides() {
        let mut options = QueryOptions::new("/work");
        options.mcp_servers.insert(
            "files".to_string(),
            McpServerConfig {
                command: "files-mcp".to_string(),
                args: vec!["--root".to_string(), "/work".to_string()],
                env: BTreeMap::new(),
            },
        );
        let args = build_args("hi", &options);
        assert!(args.contains(&"mcp_servers.files.command=\"files-mcp\"".to_string()));
        assert!(args.contains(&"mcp_servers.files.args=[\"--root\",\"/work\"]".to_string()));
    }

    #[test]
    fn test_defunct_session_on_stderr() {
        let mut t = CodexTranslator::default();
        assert!(matches!(
            t.classify_stderr("Error: thread/session th_1 not found"),
            Some(EnvelopeBody::Error {
                code: ErrorCode::SessionDefunct,
                ..
            })
        ));
        assert!(t.classify_stderr("Reading prompt from stdin").is_none());
    }

    #[tokio::test]
    async fn test_detect_auth_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        assert_eq!(detect_auth_file(&path).await, (AuthType::Account, false));

        std::fs::write(&path, r#"{"OPENAI_API_KEY": null, "tokens": {"id_token": "x"}}"#).unwrap();
        assert_eq!(detect_auth_file(&path).await, (AuthType::Account, true));

        std::fs::write(&path, r#"{"OPENAI_API_KEY": "sk-test"}"#).unwrap();
        assert_eq!(detect_auth_file(&path).await, (AuthType::ApiKey, true));
    }
}
