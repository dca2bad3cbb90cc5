//! Secret resolution
//!
//! The engine never talks to a vault directly. It is handed a
//! [`SecretResolver`] and only ever asks it to turn a reference into bytes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;

use crate::error::ResolveError;

/// Resolved secret content
///
/// Debug output never shows the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes([REDACTED; {} bytes])", self.0.len())
    }
}

impl Drop for SecretBytes {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

/// Turns a vault reference into secret bytes
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, reference: &str) -> Result<SecretBytes, ResolveError>;
}

/// Fixed-interval retry for transient resolver failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Resolve a reference, retrying `Unavailable` up to `max_retries` times
pub async fn resolve_with_retry(
    resolver: &dyn SecretResolver,
    reference: &str,
    policy: RetryPolicy,
) -> Result<SecretBytes, ResolveError> {
    let mut attempt = 0;
    loop {
        match resolver.resolve(reference).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                tracing::warn!(
                    reference,
                    attempt,
                    max_retries = policy.max_retries,
                    "Vault unavailable, retrying: {}",
                    e
                );
                tokio::time::sleep(policy.backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Resolver backed by the 1Password `op` CLI
pub struct OpCliResolver {
    command: PathBuf,
    token: String,
}

impl fmt::Debug for OpCliResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpCliResolver")
            .field("command", &self.command)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl OpCliResolver {
    /// Create a resolver reading the service account token from a file
    pub fn from_token_file(command: &str, token_file: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let command = which::which(command)
            .with_context(|| format!("Vault CLI '{}' not found on PATH", command))?;

        let token = std::fs::read_to_string(token_file)
            .with_context(|| format!("Failed to read token file: {}", token_file.display()))?
            .trim()
            .to_string();
        if token.is_empty() {
            anyhow::bail!("Token file {} is empty", token_file.display());
        }

        Ok(Self { command, token })
    }
}

#[async_trait]
impl SecretResolver for OpCliResolver {
    async fn resolve(&self, reference: &str) -> Result<SecretBytes, ResolveError> {
        let output = Command::new(&self.command)
            .args(["read", "--no-newline", reference])
            .env("OP_SERVICE_ACCOUNT_TOKEN", &self.token)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ResolveError::Unavailable(format!("failed to run vault CLI: {}", e)))?;

        if output.status.success() {
            return Ok(SecretBytes::new(output.stdout));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_cli_error(reference, stderr.trim()))
    }
}

/// Map vault CLI error text onto the resolver taxonomy
fn classify_cli_error(reference: &str, stderr: &str) -> ResolveError {
    let lower = stderr.to_lowercase();

    let not_found = ["not found", "isn't an item", "no item", "isn't a vault", "isn't a field"];
    if not_found.iter().any(|p| lower.contains(p)) {
        return ResolveError::NotFound(reference.to_string());
    }

    let denied = ["unauthorized", "authentication", "forbidden", "access denied", "invalid token"];
    if denied.iter().any(|p| lower.contains(p)) {
        return ResolveError::AuthDenied(reference.to_string());
    }

    ResolveError::Unavailable(if stderr.is_empty() {
        "vault CLI failed without output".to_string()
    } else {
        stderr.to_string()
    })
}

/// In-memory resolver for embedding and tests
///
/// Failures can be scripted per reference, either permanently or for a
/// fixed number of attempts.
#[derive(Default)]
pub struct MemoryResolver {
    values: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<String, (ResolveError, Option<u32>)>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the value for a reference
    pub fn insert(&self, reference: &str, value: impl Into<Vec<u8>>) {
        lock(&self.values).insert(reference.to_string(), value.into());
    }

    /// Fail every resolution of a reference
    pub fn fail(&self, reference: &str, error: ResolveError) {
        lock(&self.failures).insert(reference.to_string(), (error, None));
    }

    /// Fail the next `times` resolutions of a reference
    pub fn fail_times(&self, reference: &str, error: ResolveError, times: u32) {
        lock(&self.failures).insert(reference.to_string(), (error, Some(times)));
    }

    /// Stop failing a reference
    pub fn clear_failure(&self, reference: &str) {
        lock(&self.failures).remove(reference);
    }

    /// Number of resolve calls seen for a reference
    pub fn calls(&self, reference: &str) -> u32 {
        lock(&self.calls).get(reference).copied().unwrap_or(0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl SecretResolver for MemoryResolver {
    async fn resolve(&self, reference: &str) -> Result<SecretBytes, ResolveError> {
        *lock(&self.calls).entry(reference.to_string()).or_insert(0) += 1;

        {
            let mut failures = lock(&self.failures);
            if let Some((error, remaining)) = failures.get(reference).cloned() {
                match remaining {
                    None => return Err(error),
                    Some(n) if n > 1 => {
                        failures.insert(reference.to_string(), (error.clone(), Some(n - 1)));
                        return Err(error);
                    }
                    Some(1) => {
                        failures.remove(reference);
                        return Err(error);
                    }
                    Some(_) => {
                        failures.remove(reference);
                    }
                }
            }
        }

        lock(&self.values)
            .get(reference)
            .map(|v| SecretBytes::new(v.clone()))
            .ok_or_else(|| ResolveError::NotFound(reference.to_string()))
    }
}
