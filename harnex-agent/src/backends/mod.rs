// ABOUTME: Harness implementations (Claude Code, Codex, mock).
// ABOUTME: Each backend implements the Harness trait.

use std::path::PathBuf;

pub mod claude_code;
pub mod codex;
pub mod mock;

/// The user's home directory, for locating backend config and credentials
pub(crate) fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf())
}
