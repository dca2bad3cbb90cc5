//! Configuration management for keydrop
//!
//! The configuration file holds the engine's policy knobs. Every field has a
//! default, so a missing file means "all defaults".

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Directory for secrets without an explicit path or template
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// Hash store file
    #[serde(default)]
    pub state_file: Option<PathBuf>,

    /// Service account token file for the vault CLI
    #[serde(default)]
    pub token_file: Option<PathBuf>,

    /// Retries after a transient resolver failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed interval between resolver retries (milliseconds)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Number of secrets processed concurrently
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Overall run deadline (seconds)
    #[serde(default)]
    pub deadline_secs: Option<u64>,

    /// Keep going after a per-secret failure
    #[serde(default)]
    pub continue_on_error: bool,

    /// Restore previous file content when the run fails
    #[serde(default)]
    pub rollback_on_failure: bool,

    /// Retries after a transient filesystem error
    #[serde(default)]
    pub write_retries: u32,

    /// Mode applied when a secret does not set one
    #[serde(default = "default_mode")]
    pub default_mode: String,

    /// Vault CLI executable
    #[serde(default = "default_resolver_command")]
    pub resolver_command: String,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_parallelism() -> usize {
    4
}

fn default_mode() -> String {
    "0400".to_string()
}

fn default_resolver_command() -> String {
    "op".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: None,
            state_file: None,
            token_file: None,
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            parallelism: default_parallelism(),
            deadline_secs: None,
            continue_on_error: false,
            rollback_on_failure: false,
            write_retries: 0,
            default_mode: default_mode(),
            resolver_command: default_resolver_command(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config: {}", path.display()))?
        } else {
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Check knobs that serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            bail!("parallelism must be at least 1");
        }
        if parse_mode(&self.default_mode).is_none() {
            bail!("defaultMode '{}' is not an octal mode", self.default_mode);
        }
        Ok(())
    }
}

/// Parse an octal permission string such as "0644" or "600"
pub fn parse_mode(mode: &str) -> Option<u32> {
    static MODE_RE: OnceLock<Regex> = OnceLock::new();
    let re = MODE_RE.get_or_init(|| Regex::new(r"^[0-7]{3,4}$").expect("valid mode regex"));

    if !re.is_match(mode) {
        return None;
    }
    u32::from_str_radix(mode, 8).ok()
}
