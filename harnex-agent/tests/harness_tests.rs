// ABOUTME: Tests for the never-fail discovery wrappers of the Harness trait.
// ABOUTME: Uses the mock harness to force probe failures, hangs and cancellation.

use harnex_agent::backends::mock::MockHarness;
use harnex_agent::{
    AuthType, CommandSource, Harness, HarnessCatalog, HarnessId, InstallStatus, QueryMode,
    SlashCommand, ThinkingLevel,
};
use std::path::Path;
use tokio_util::sync::CancellationToken;

fn command(name: &str) -> SlashCommand {
    SlashCommand {
        name: name.to_string(),
        description: None,
        source: CommandSource::Project,
    }
}

#[tokio::test]
async fn test_install_status_passes_through() {
    let mock = MockHarness::new().with_install_status(InstallStatus {
        installed: true,
        version: Some("1.2.3".to_string()),
        auth_type: AuthType::ApiKey,
        authenticated: true,
        auth_instructions: None,
    });
    let status = mock.check_install_status().await;
    assert!(status.installed);
    assert_eq!(status.version.as_deref(), Some("1.2.3"));
    assert_eq!(status.auth_type, AuthType::ApiKey);
}

#[tokio::test]
async fn test_probe_failure_reports_not_installed() {
    let mock = MockHarness::new().with_probe_failure("permission denied reading config");
    let status = mock.check_install_status().await;
    assert!(!status.installed);
    assert!(!status.authenticated);
    assert_eq!(
        status.auth_instructions.as_deref(),
        Some("The mock harness is built in.")
    );
}

#[tokio::test(start_paused = true)]
async fn test_hanging_probe_times_out() {
    let mock = MockHarness::new().with_hanging_probe();
    let status = mock.check_install_status().await;
    assert!(!status.installed);
}

#[tokio::test]
async fn test_slash_commands_discovered() {
    let mock = MockHarness::new().with_slash_commands(vec![command("deploy")]);
    let cancel = CancellationToken::new();
    let commands = mock.discover_slash_commands(Path::new("."), &cancel).await;
    assert_eq!(commands, vec![command("deploy")]);
}

#[tokio::test]
async fn test_cancelled_discovery_is_empty() {
    let mock = MockHarness::new().with_slash_commands(vec![command("deploy")]);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let commands = mock.discover_slash_commands(Path::new("."), &cancel).await;
    assert!(commands.is_empty());
}

#[tokio::test]
async fn test_harness_without_slash_commands_returns_empty() {
    let catalog = HarnessCatalog::default();
    let codex = catalog.get(HarnessId::Codex).unwrap();
    let cancel = CancellationToken::new();
    assert!(codex
        .discover_slash_commands(Path::new("."), &cancel)
        .await
        .is_empty());
}

#[test]
fn test_capabilities_differ_per_harness() {
    let catalog = HarnessCatalog::default();
    let claude = catalog.get(HarnessId::ClaudeCode).unwrap().capabilities();
    let codex = catalog.get(HarnessId::Codex).unwrap().capabilities();

    assert!(claude.supports_fork);
    assert!(claude.supports_client_tools);
    assert!(!codex.supports_fork);
    assert!(!codex.supports_client_tools);
    assert!(codex.modes.contains(&QueryMode::ReadOnly));
    assert!(claude.thinking_levels.contains(&ThinkingLevel::High));
}

#[test]
fn test_every_harness_has_one_default_model() {
    let catalog = HarnessCatalog::default().register(MockHarness::new());
    for harness in catalog.iter() {
        let defaults = harness.models().iter().filter(|m| m.is_default).count();
        assert_eq!(defaults, 1, "{} should have one default model", harness.meta().id);
    }
}

#[tokio::test]
async fn test_missing_binary_reports_not_installed() {
    use harnex_agent::backends::codex::{CodexConfig, CodexHarness};

    let harness = CodexHarness::new(CodexConfig {
        binary: "harnex-no-such-codex".to_string(),
        ..CodexConfig::default()
    });
    let status = harness.check_install_status().await;
    assert!(!status.installed);
    assert!(status.auth_instructions.unwrap().contains("npm install"));
}

#[tokio::test]
async fn test_query_with_missing_binary_fails_to_start() {
    use harnex_agent::backends::claude_code::{ClaudeCodeConfig, ClaudeCodeHarness};
    use harnex_agent::QueryOptions;

    let harness = ClaudeCodeHarness::new(ClaudeCodeConfig {
        binary: "harnex-no-such-claude".to_string(),
        ..ClaudeCodeConfig::default()
    });
    let result = harness.query("hello", &QueryOptions::new(std::env::temp_dir()));
    match result {
        Err(e) => assert!(e.to_string().contains("harnex-no-such-claude")),
        Ok(_) => panic!("Expected spawn failure"),
    }
}
