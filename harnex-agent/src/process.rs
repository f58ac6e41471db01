// ABOUTME: Subprocess plumbing shared by CLI adapters - launch, JSONL pumping, kill, version probe.
// ABOUTME: Adapters plug in a Translator; the driver owns ordering, terminal bookkeeping and abort.

use crate::bridge::ToolBridge;
use crate::event::{Envelope, EnvelopeBody, ErrorCode, ToolCall};
use crate::harness::HarnessId;
use crate::query::QueryContext;
use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command as ProcessCommand};

/// How long a killed backend gets to exit before we stop waiting
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How long to keep reading stderr after stdout closed
const STDERR_DRAIN: Duration = Duration::from_millis(500);

/// Adapter-specific translation between a backend's JSONL dialect and envelopes
pub(crate) trait Translator: Send {
    /// Typed envelopes for one stdout JSON line. The line itself is always
    /// forwarded as a `raw_message` first.
    fn translate(&mut self, line: &Value) -> Vec<EnvelopeBody>;

    /// Inspect one stderr line, e.g. to detect a defunct session
    fn classify_stderr(&mut self, _line: &str) -> Option<EnvelopeBody> {
        None
    }
}

/// Everything needed to start a backend process
#[derive(Debug, Clone)]
pub(crate) struct Launch {
    pub binary: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Keep stdin piped for stream-json input
    pub stdin: bool,
}

impl Launch {
    pub fn spawn(&self) -> Result<Child> {
        tracing::debug!(binary = %self.binary, args = ?self.args, cwd = %self.cwd.display(), "Spawning backend");

        let mut cmd = ProcessCommand::new(&self.binary);
        cmd.args(&self.args)
            .current_dir(&self.cwd)
            .envs(&self.env)
            .stdin(if self.stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.spawn().with_context(|| {
            format!(
                "Failed to spawn '{}' -- is it installed and on PATH?",
                self.binary
            )
        })
    }
}

/// Pump a spawned backend until it exits or the query is aborted.
///
/// Guarantees at most one terminal envelope per query: if the backend exits
/// without reporting one, a `complete` (exit 0) or `error` is synthesised.
/// On abort the child is killed and nothing further is emitted.
///
/// With a `bridge`, tool calls the backend makes through it are emitted as
/// `tool_call` envelopes and `tool_response` commands are routed back to it.
pub(crate) async fn drive<T: Translator>(
    mut child: Child,
    binary: String,
    initial_input: Option<Value>,
    mut translator: T,
    mut bridge: Option<ToolBridge>,
    mut ctx: QueryContext,
) {
    let harness_id = ctx.harness_id;
    let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
        (Some(stdout), Some(stderr)) => (stdout, stderr),
        _ => {
            ctx.emit(Envelope::error(ErrorCode::LaunchFailed, "Backend stdio was not captured"))
                .await;
            kill(&mut child).await;
            return;
        }
    };
    let mut stdin = child.stdin.take();

    if let (Some(input), Some(writer)) = (initial_input, stdin.as_mut()) {
        if let Err(e) = write_json_line(writer, &input).await {
            tracing::warn!(harness = %harness_id, error = %e, "Failed to write prompt to backend stdin");
        }
    }

    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut stderr_open = true;
    let mut commands_open = true;
    let mut terminal_sent = false;

    // true when the consumer dropped its receiver
    let receiver_gone = 'pump: loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                tracing::info!(harness = %harness_id, "Query aborted, killing backend");
                kill(&mut child).await;
                return;
            }
            command = ctx.commands.recv(), if commands_open => match command {
                Some(command) => route_command(harness_id, bridge.as_ref(), command),
                None => commands_open = false,
            },
            Some(call) = next_bridge_call(bridge.as_mut()) => {
                if !emit_typed(&ctx, EnvelopeBody::ToolCall(call), &mut terminal_sent, &mut stdin).await {
                    break 'pump true;
                }
            }
            line = stdout_lines.next_line() => match line {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let json = match serde_json::from_str::<Value>(trimmed) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::warn!(harness = %harness_id, line = trimmed, error = %e, "Skipping malformed JSONL line");
                            continue;
                        }
                    };
                    let typed = translator.translate(&json);
                    if !ctx.emit(Envelope::raw_message(harness_id, json)).await {
                        break 'pump true;
                    }
                    for body in typed {
                        if !emit_typed(&ctx, body, &mut terminal_sent, &mut stdin).await {
                            break 'pump true;
                        }
                    }
                }
                Ok(None) => break 'pump false,
                Err(e) => {
                    tracing::warn!(harness = %harness_id, error = %e, "Error reading backend stdout");
                    break 'pump false;
                }
            },
            line = stderr_lines.next_line(), if stderr_open => match line {
                Ok(Some(line)) => {
                    if !forward_stderr(&ctx, &mut translator, line, &mut terminal_sent, &mut stdin).await {
                        break 'pump true;
                    }
                }
                _ => stderr_open = false,
            },
        }
    };
    // Fails tool calls still in flight
    drop(bridge);

    if receiver_gone {
        tracing::debug!(harness = %harness_id, "Nobody is listening, stopping backend");
        kill(&mut child).await;
        return;
    }

    // stdout is closed; pick up whatever diagnostics are still in flight
    while stderr_open {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                kill(&mut child).await;
                return;
            }
            line = tokio::time::timeout(STDERR_DRAIN, stderr_lines.next_line()) => match line {
                Ok(Ok(Some(line))) => {
                    forward_stderr(&ctx, &mut translator, line, &mut terminal_sent, &mut stdin).await;
                }
                _ => stderr_open = false,
            },
        }
    }
    drop(stdin);

    let status = tokio::select! {
        _ = ctx.cancel.cancelled() => {
            kill(&mut child).await;
            return;
        }
        status = child.wait() => status,
    };

    if terminal_sent {
        return;
    }
    let terminal = match status {
        Ok(status) if status.success() => Envelope::complete(None),
        Ok(status) => Envelope::error(
            ErrorCode::BackendError,
            format!("{} exited with status: {:?}", binary, status.code()),
        ),
        Err(e) => Envelope::error(
            ErrorCode::BackendError,
            format!("Failed to wait for {}: {}", binary, e),
        ),
    };
    ctx.emit(terminal).await;
}

fn route_command(harness_id: HarnessId, bridge: Option<&ToolBridge>, command: Envelope) {
    match (command.body, bridge) {
        (EnvelopeBody::ToolResponse(response), Some(bridge)) => {
            let call_id = response.call_id.clone();
            if !bridge.resolve(response) {
                tracing::debug!(harness = %harness_id, call_id = %call_id, "No pending tool call for response, dropping");
            }
        }
        (body, _) => {
            tracing::debug!(harness = %harness_id, kind = body.kind(), "Backend does not accept this command, dropping");
        }
    }
}

async fn next_bridge_call(bridge: Option<&mut ToolBridge>) -> Option<ToolCall> {
    match bridge {
        Some(bridge) => bridge.next_call().await,
        None => std::future::pending().await,
    }
}

async fn forward_stderr<T: Translator>(
    ctx: &QueryContext,
    translator: &mut T,
    line: String,
    terminal_sent: &mut bool,
    stdin: &mut Option<ChildStdin>,
) -> bool {
    if line.is_empty() {
        return true;
    }
    tracing::debug!(harness = %ctx.harness_id, stderr = %line, "Backend stderr");
    let classified = translator.classify_stderr(&line);
    if !ctx.emit(Envelope::stderr(line)).await {
        return false;
    }
    match classified {
        Some(body) => emit_typed(ctx, body, terminal_sent, stdin).await,
        None => true,
    }
}

async fn emit_typed(
    ctx: &QueryContext,
    body: EnvelopeBody,
    terminal_sent: &mut bool,
    stdin: &mut Option<ChildStdin>,
) -> bool {
    if body.is_terminal() {
        if *terminal_sent {
            tracing::debug!(harness = %ctx.harness_id, kind = body.kind(), "Dropping second terminal envelope");
            return true;
        }
        *terminal_sent = true;
        // Closing stdin lets stream-json backends exit once the turn is over
        stdin.take();
    }
    ctx.emit(Envelope::new(body)).await
}

async fn write_json_line(writer: &mut ChildStdin, value: &Value) -> Result<()> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "Kill failed (process already exited?)");
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        tracing::warn!("Backend did not exit within kill grace period");
    }
}

/// Outcome of running `<binary> --version`
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum VersionProbe {
    /// Binary not found on PATH
    Missing,
    /// Binary ran; version if one could be parsed
    Found(Option<String>),
}

pub(crate) async fn probe_version(binary: &str) -> Result<VersionProbe> {
    let output = ProcessCommand::new(binary)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await;

    let output = match output {
        Ok(output) => output,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(VersionProbe::Missing),
        Err(e) => return Err(e).with_context(|| format!("Failed to run {} --version", binary)),
    };

    if !output.status.success() {
        anyhow::bail!(
            "{} --version exited with status {:?}",
            binary,
            output.status.code()
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(VersionProbe::Found(parse_version(&stdout)))
}

/// Extract the first semver-looking token from `--version` output
pub(crate) fn parse_version(text: &str) -> Option<String> {
    static VERSION: OnceLock<Option<Regex>> = OnceLock::new();
    VERSION
        .get_or_init(|| Regex::new(r"\d+\.\d+\.\d+(?:[-+][0-9A-Za-z.\-]+)?").ok())
        .as_ref()?
        .find(text)
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_claude_style() {
        assert_eq!(
            parse_version("1.0.98 (Claude Code)\n"),
            Some("1.0.98".to_string())
        );
    }

    #[test]
    fn test_parse_version_codex_style() {
        assert_eq!(
            parse_version("codex-cli 0.46.0-alpha.3"),
            Some("0.46.0-alpha.3".to_string())
        );
    }

    #[test]
    fn test_parse_version_none() {
        assert_eq!(parse_version("unknown build"), None);
    }

    #[tokio::test]
    async fn test_probe_missing_binary() {
        let probe = probe_version("harnex-definitely-not-installed").await.unwrap();
        assert_eq!(probe, VersionProbe::Missing);
    }
}
