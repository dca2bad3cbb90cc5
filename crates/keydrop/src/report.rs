//! Run report - per-secret outcomes and overall status

use serde::Serialize;
use std::fmt::Write as _;
use std::time::Duration;

use crate::detect::Change;

/// Final state of one secret
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretStatus {
    Unchanged,
    Written,
    Failed,
    Skipped,
}

impl SecretStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretStatus::Unchanged => "unchanged",
            SecretStatus::Written => "written",
            SecretStatus::Failed => "failed",
            SecretStatus::Skipped => "skipped",
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            SecretStatus::Unchanged => "=",
            SecretStatus::Written => "+",
            SecretStatus::Failed => "!",
            SecretStatus::Skipped => "-",
        }
    }
}

/// Engine state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Loading,
    Resolving,
    Writing,
    Committing,
    Notifying,
    Done,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Loading => "loading",
            Phase::Resolving => "resolving",
            Phase::Writing => "writing",
            Phase::Committing => "committing",
            Phase::Notifying => "notifying",
            Phase::Done => "done",
            Phase::Failed => "failed",
        }
    }
}

/// Overall result of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Success,
    PartialFailure,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::PartialFailure => "partial failure",
            RunStatus::Failure => "failure",
        }
    }

    /// Process exit code for the binary
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Failure => 1,
            RunStatus::PartialFailure => 2,
        }
    }
}

/// Outcome for one secret
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretOutcome {
    pub name: String,
    pub status: SecretStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub rolled_back: bool,
}

impl SecretOutcome {
    pub fn new(name: impl Into<String>, status: SecretStatus) -> Self {
        Self {
            name: name.into(),
            status,
            change: None,
            error: None,
            warnings: Vec::new(),
            rolled_back: false,
        }
    }

    pub fn with_change(mut self, change: Change) -> Self {
        self.change = Some(change.as_str());
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// A service notification as reported
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifiedService {
    pub service: String,
    pub action: String,
    pub secrets: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything a run did
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub status: RunStatus,
    /// Last phase reached, `Failed` when the run stopped early
    pub phase: Phase,
    pub outcomes: Vec<SecretOutcome>,
    pub notified: Vec<NotifiedService>,
    pub committed: bool,
    pub rolled_back: bool,
    /// Run-level problems: aborts, deadline, commit or rollback errors
    pub errors: Vec<String>,
    #[serde(serialize_with = "serialize_millis")]
    pub duration: Duration,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl RunReport {
    pub fn outcome(&self, name: &str) -> Option<&SecretOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    pub fn count(&self, status: SecretStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Names of services that were notified, successfully or not
    pub fn notified_services(&self) -> Vec<&str> {
        self.notified.iter().map(|n| n.service.as_str()).collect()
    }

    /// Human-readable summary
    pub fn render(&self) -> String {
        let mut out = String::new();

        for outcome in &self.outcomes {
            let _ = write!(
                out,
                "  {} {:<24} {}",
                outcome.status.symbol(),
                outcome.name,
                outcome.status.as_str()
            );
            if let Some(change) = outcome.change {
                let _ = write!(out, " ({})", change);
            }
            if outcome.rolled_back {
                out.push_str(" [rolled back]");
            }
            out.push('\n');
            if let Some(error) = &outcome.error {
                let _ = writeln!(out, "      error: {}", error);
            }
            for warning in &outcome.warnings {
                let _ = writeln!(out, "      warning: {}", warning);
            }
        }

        if !self.notified.is_empty() {
            out.push_str("\nServices:\n");
            for n in &self.notified {
                match &n.error {
                    None => {
                        let _ = writeln!(out, "  {} ({})", n.service, n.action);
                    }
                    Some(e) => {
                        let _ = writeln!(out, "  {} ({}) FAILED: {}", n.service, n.action, e);
                    }
                }
            }
        }

        for error in &self.errors {
            let _ = writeln!(out, "\nerror: {}", error);
        }

        let _ = writeln!(
            out,
            "\n{}: {} written, {} unchanged, {} failed, {} skipped in {}",
            self.status.as_str(),
            self.count(SecretStatus::Written),
            self.count(SecretStatus::Unchanged),
            self.count(SecretStatus::Failed),
            self.count(SecretStatus::Skipped),
            keydrop_core::format::duration(self.duration),
        );
        out
    }
}
