//! Service notification
//!
//! After the write phase, every service attached to a rewritten secret is
//! restarted or signaled exactly once. `after` hints put a service behind
//! its dependencies when both are being notified; cycles are not detected,
//! they are simply broken at the first revisit.

use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashSet;
use tokio::process::Command;

use crate::error::NotifyError;
use crate::manifest::{SecretSpec, ServiceAction};

/// What to do to a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyAction {
    Restart,
    Signal(String),
}

impl NotifyAction {
    /// Action for one service declaration, `None` when it asks for nothing
    pub fn for_service(service: &ServiceAction) -> Option<Self> {
        match service {
            ServiceAction::Simple(_) => Some(Self::Restart),
            ServiceAction::Detailed {
                signal: Some(signal),
                ..
            } => Some(Self::Signal(signal.clone())),
            ServiceAction::Detailed { restart: true, .. } => Some(Self::Restart),
            ServiceAction::Detailed { .. } => None,
        }
    }
}

impl std::fmt::Display for NotifyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Restart => write!(f, "restart"),
            Self::Signal(signal) => write!(f, "signal {}", signal),
        }
    }
}

/// Host init system capability
#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn restart(&self, service: &str) -> Result<(), NotifyError>;
    async fn signal(&self, service: &str, signal: &str) -> Result<(), NotifyError>;
}

/// One deduplicated notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedNotification {
    pub service: String,
    pub action: NotifyAction,
    /// Rewritten secrets that pulled this service in
    pub secrets: Vec<String>,
}

/// Outcome of one notification
#[derive(Debug, Clone)]
pub struct NotificationResult {
    pub service: String,
    pub action: NotifyAction,
    pub secrets: Vec<String>,
    pub error: Option<NotifyError>,
}

struct Pending {
    action: Option<NotifyAction>,
    after: Vec<String>,
    secrets: Vec<String>,
}

/// Build the ordered, deduplicated notification list for rewritten secrets
pub fn plan<'a>(written: impl IntoIterator<Item = &'a SecretSpec>) -> Vec<PlannedNotification> {
    let mut pending: IndexMap<String, Pending> = IndexMap::new();

    for secret in written {
        for service in &secret.services {
            let action = NotifyAction::for_service(service);
            let entry = pending
                .entry(service.name().to_string())
                .or_insert_with(|| Pending {
                    action: action.clone(),
                    after: Vec::new(),
                    secrets: Vec::new(),
                });

            if entry.action != action {
                tracing::debug!(
                    service = service.name(),
                    secret = %secret.name,
                    "Conflicting action for service, keeping the first declaration"
                );
            }
            for dep in service.after() {
                if !entry.after.contains(dep) {
                    entry.after.push(dep.clone());
                }
            }
            if !entry.secrets.contains(&secret.name) {
                entry.secrets.push(secret.name.clone());
            }
        }
    }

    pending.retain(|name, p| {
        if p.action.is_none() {
            tracing::debug!(service = %name, "Service asks for no action, skipping");
        }
        p.action.is_some()
    });

    let mut order = Vec::with_capacity(pending.len());
    let mut visited = HashSet::new();
    for name in pending.keys() {
        visit(name, &pending, &mut visited, &mut order);
    }

    order
        .into_iter()
        .filter_map(|name| {
            let p = pending.get(&name)?;
            Some(PlannedNotification {
                action: p.action.clone()?,
                secrets: p.secrets.clone(),
                service: name,
            })
        })
        .collect()
}

fn visit(
    name: &str,
    pending: &IndexMap<String, Pending>,
    visited: &mut HashSet<String>,
    order: &mut Vec<String>,
) {
    if !visited.insert(name.to_string()) {
        return;
    }
    if let Some(p) = pending.get(name) {
        for dep in &p.after {
            if pending.contains_key(dep) {
                visit(dep, pending, visited, order);
            }
        }
    }
    order.push(name.to_string());
}

/// Run every planned notification in order
///
/// Failures are collected, never propagated: the secrets on disk are
/// correct even when a service fails to pick them up.
pub async fn notify(
    manager: &dyn ServiceManager,
    planned: Vec<PlannedNotification>,
) -> Vec<NotificationResult> {
    let mut results = Vec::with_capacity(planned.len());

    for item in planned {
        let outcome = match &item.action {
            NotifyAction::Restart => manager.restart(&item.service).await,
            NotifyAction::Signal(signal) => manager.signal(&item.service, signal).await,
        };

        match &outcome {
            Ok(()) => {
                tracing::info!(service = %item.service, action = %item.action, "Notified service")
            }
            Err(e) => tracing::warn!(service = %item.service, "Service notification failed: {}", e),
        }

        results.push(NotificationResult {
            service: item.service,
            action: item.action,
            secrets: item.secrets,
            error: outcome.err(),
        });
    }
    results
}

/// systemd through `systemctl`
#[derive(Debug, Clone)]
pub struct SystemdManager {
    systemctl: String,
}

impl Default for SystemdManager {
    fn default() -> Self {
        Self {
            systemctl: "systemctl".to_string(),
        }
    }
}

impl SystemdManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether systemctl is available on this host
    pub fn is_available(&self) -> bool {
        which::which(&self.systemctl).is_ok()
    }

    async fn run(&self, args: &[&str]) -> Result<(), String> {
        let output = Command::new(&self.systemctl)
            .args(args)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", self.systemctl, e))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(if stderr.is_empty() {
                format!("{} exited with {}", self.systemctl, output.status)
            } else {
                stderr
            })
        }
    }
}

#[async_trait]
impl ServiceManager for SystemdManager {
    async fn restart(&self, service: &str) -> Result<(), NotifyError> {
        self.run(&["restart", service])
            .await
            .map_err(|message| NotifyError::Restart {
                service: service.to_string(),
                message,
            })
    }

    async fn signal(&self, service: &str, signal: &str) -> Result<(), NotifyError> {
        let flag = format!("--signal={}", signal);
        self.run(&["kill", &flag, service])
            .await
            .map_err(|message| NotifyError::Signal {
                service: service.to_string(),
                signal: signal.to_string(),
                message,
            })
    }
}
