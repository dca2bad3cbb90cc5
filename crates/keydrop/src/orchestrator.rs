//! Deployment orchestration
//!
//! A run moves through `Loading -> Resolving -> Writing -> Committing ->
//! Notifying -> Done`, or ends in `Failed`. Secrets are resolved and written
//! by a bounded pool of workers; everything after the pool (rollback, the
//! hash store commit, service notification) happens once, on this task,
//! after every worker has been joined.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use keydrop_core::Config;

use crate::detect::{self, Change};
use crate::error::{DeployError, ResolveError, SecretError};
use crate::manifest::{ManifestLoader, ManifestSource, SecretManifest, SecretSpec};
use crate::materialize::{Materializer, RollbackJournal};
use crate::notifier::{self, ServiceManager};
use crate::report::{NotifiedService, Phase, RunReport, RunStatus, SecretOutcome, SecretStatus};
use crate::resolver::{resolve_with_retry, RetryPolicy, SecretResolver};
use crate::store::{HashMapping, HashRecord, HashStore};

/// Failure handling and resource limits for a run
#[derive(Debug, Clone)]
pub struct DeployPolicy {
    pub continue_on_error: bool,
    pub rollback_on_failure: bool,
    pub retry: RetryPolicy,
    /// Secrets resolved and written at the same time
    pub parallelism: usize,
    /// Wall-clock budget for the whole run
    pub deadline: Option<Duration>,
    pub write_retries: u32,
}

impl Default for DeployPolicy {
    fn default() -> Self {
        Self {
            continue_on_error: false,
            rollback_on_failure: false,
            retry: RetryPolicy::default(),
            parallelism: 4,
            deadline: None,
            write_retries: 0,
        }
    }
}

impl From<&Config> for DeployPolicy {
    fn from(config: &Config) -> Self {
        Self {
            continue_on_error: config.continue_on_error,
            rollback_on_failure: config.rollback_on_failure,
            retry: RetryPolicy {
                max_retries: config.max_retries,
                backoff: Duration::from_millis(config.retry_backoff_ms),
            },
            parallelism: config.parallelism,
            deadline: config.deadline_secs.map(Duration::from_secs),
            write_retries: config.write_retries,
        }
    }
}

/// State shared by the workers of one run
struct RunContext {
    resolver: Arc<dyn SecretResolver>,
    materializer: Materializer,
    retry: RetryPolicy,
    continue_on_error: bool,
    /// Store as loaded at the start of the run
    stored: HashMapping,
    /// Store as it should be committed, updated after each durable write
    applied: Mutex<HashMapping>,
    journal: Option<RollbackJournal>,
    deadline: Option<Instant>,
    aborted: AtomicBool,
    deadline_hit: AtomicBool,
}

impl RunContext {
    fn record(&self, name: &str, digest: String) {
        let mut applied = self
            .applied
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        applied.insert(name.to_string(), HashRecord::new(digest));
    }

    fn past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn should_skip(&self) -> bool {
        if self.aborted.load(Ordering::SeqCst) {
            return true;
        }
        if self.past_deadline() {
            self.deadline_hit.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }
}

/// Runs deployments against an injected resolver and service manager
pub struct Orchestrator {
    resolver: Arc<dyn SecretResolver>,
    services: Arc<dyn ServiceManager>,
    store: HashStore,
    policy: DeployPolicy,
}

impl Orchestrator {
    pub fn new(
        resolver: Arc<dyn SecretResolver>,
        services: Arc<dyn ServiceManager>,
        store: HashStore,
    ) -> Self {
        Self {
            resolver,
            services,
            store,
            policy: DeployPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: DeployPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &DeployPolicy {
        &self.policy
    }

    /// Load manifests and deploy them
    ///
    /// Manifest problems are returned before any resolver call or write.
    pub async fn run(
        &self,
        loader: &ManifestLoader,
        sources: &[ManifestSource],
    ) -> Result<RunReport, DeployError> {
        tracing::info!(
            phase = Phase::Loading.as_str(),
            manifests = sources.len(),
            "Loading manifests"
        );
        let manifest = loader.load(sources)?;
        self.deploy(&manifest).await
    }

    /// Deploy an already validated manifest
    pub async fn deploy(&self, manifest: &SecretManifest) -> Result<RunReport, DeployError> {
        let started = Instant::now();
        let policy = &self.policy;

        let stored = self.store.load()?;
        tracing::debug!(
            records = stored.len(),
            store = %self.store.path().display(),
            "Loaded hash store"
        );

        let ctx = Arc::new(RunContext {
            resolver: Arc::clone(&self.resolver),
            materializer: Materializer::new(policy.write_retries),
            retry: policy.retry,
            continue_on_error: policy.continue_on_error,
            applied: Mutex::new(stored.clone()),
            stored,
            journal: policy.rollback_on_failure.then(RollbackJournal::new),
            deadline: policy.deadline.map(|d| started + d),
            aborted: AtomicBool::new(false),
            deadline_hit: AtomicBool::new(false),
        });

        tracing::info!(
            phase = Phase::Resolving.as_str(),
            secrets = manifest.len(),
            parallelism = policy.parallelism,
            "Resolving secrets"
        );
        let mut outcomes = run_workers(&ctx, manifest, policy.parallelism).await;

        tracing::info!(phase = Phase::Writing.as_str(), "All workers finished");
        let failed = outcomes.iter().filter(|o| o.status == SecretStatus::Failed).count();
        let failure_abort = ctx.aborted.load(Ordering::SeqCst);
        let deadline_hit = ctx.deadline_hit.load(Ordering::SeqCst);
        // A strict run stops at the deadline exactly as it stops at a failure
        let aborted = failure_abort || (deadline_hit && !policy.continue_on_error);

        let mut report = RunReport {
            status: RunStatus::Success,
            phase: Phase::Writing,
            outcomes: Vec::new(),
            notified: Vec::new(),
            committed: false,
            rolled_back: false,
            errors: Vec::new(),
            duration: Duration::ZERO,
        };
        if failure_abort {
            report.errors.push("Run aborted after a secret failed".to_string());
        }
        if deadline_hit {
            report.errors.push("Run deadline exceeded".to_string());
        }

        let any_failure = failed > 0 || aborted || deadline_hit;

        if any_failure && policy.rollback_on_failure {
            rollback(&ctx, &mut outcomes, &mut report);
            return Ok(finish(report, outcomes, RunStatus::Failure, started));
        }

        if aborted {
            // Completed writes stay on disk; the store keeps describing the last full run
            return Ok(finish(report, outcomes, RunStatus::Failure, started));
        }

        report.phase = Phase::Committing;
        let mapping = {
            let applied = ctx
                .applied
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            prune(&applied, manifest)
        };

        if mapping != ctx.stored {
            tracing::info!(
                phase = Phase::Committing.as_str(),
                records = mapping.len(),
                "Committing hash store"
            );
            if let Err(e) = self.store.commit(&mapping) {
                tracing::error!("Hash store commit failed: {}", e);
                report.errors.push(e.to_string());
                if policy.rollback_on_failure {
                    rollback(&ctx, &mut outcomes, &mut report);
                }
                return Ok(finish(report, outcomes, RunStatus::Failure, started));
            }
            report.committed = true;
        } else {
            tracing::debug!("Hash store unchanged, skipping commit");
        }
        if let Some(journal) = &ctx.journal {
            journal.discard();
        }

        report.phase = Phase::Notifying;
        let written: Vec<&SecretSpec> = manifest
            .secrets
            .iter()
            .zip(&outcomes)
            .filter(|(_, o)| o.status == SecretStatus::Written)
            .map(|(spec, _)| spec)
            .collect();
        let planned = notifier::plan(written);
        if !planned.is_empty() {
            tracing::info!(
                phase = Phase::Notifying.as_str(),
                services = planned.len(),
                "Notifying services"
            );
        }

        for result in notifier::notify(self.services.as_ref(), planned).await {
            if let Some(error) = &result.error {
                for outcome in outcomes.iter_mut().filter(|o| result.secrets.contains(&o.name)) {
                    outcome.warnings.push(error.to_string());
                }
            }
            report.notified.push(NotifiedService {
                service: result.service,
                action: result.action.to_string(),
                secrets: result.secrets,
                error: result.error.map(|e| e.to_string()),
            });
        }

        let status = if deadline_hit {
            RunStatus::Failure
        } else if failed > 0 {
            RunStatus::PartialFailure
        } else {
            RunStatus::Success
        };
        report.phase = Phase::Done;
        Ok(finish(report, outcomes, status, started))
    }
}

/// Run every secret through the bounded pool and wait for all of them
async fn run_workers(
    ctx: &Arc<RunContext>,
    manifest: &SecretManifest,
    parallelism: usize,
) -> Vec<SecretOutcome> {
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut workers = JoinSet::new();

    for (index, spec) in manifest.secrets.iter().enumerate() {
        let ctx = Arc::clone(ctx);
        let semaphore = Arc::clone(&semaphore);
        let spec = spec.clone();

        workers.spawn(async move {
            let outcome = match semaphore.acquire_owned().await {
                Ok(_permit) => process_secret(&ctx, spec).await,
                Err(_) => SecretOutcome::new(spec.name, SecretStatus::Skipped),
            };
            (index, outcome)
        });
    }

    let mut slots: Vec<Option<SecretOutcome>> = vec![None; manifest.len()];
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((index, outcome)) => slots[index] = Some(outcome),
            Err(e) => tracing::error!("Secret worker panicked: {}", e),
        }
    }

    slots
        .into_iter()
        .zip(&manifest.secrets)
        .map(|(slot, spec)| {
            slot.unwrap_or_else(|| {
                SecretOutcome::new(spec.name.clone(), SecretStatus::Failed)
                    .with_error("worker task failed")
            })
        })
        .collect()
}

/// Resolve, classify and write one secret
async fn process_secret(ctx: &Arc<RunContext>, spec: SecretSpec) -> SecretOutcome {
    if ctx.should_skip() {
        tracing::debug!(secret = %spec.name, "Skipping secret");
        return SecretOutcome::new(spec.name, SecretStatus::Skipped);
    }

    let resolving = resolve_with_retry(ctx.resolver.as_ref(), &spec.reference, ctx.retry);
    let resolved = match ctx.deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, resolving)
            .await
            .unwrap_or(Err(ResolveError::DeadlineExceeded)),
        None => resolving.await,
    };

    let bytes = match resolved {
        Ok(bytes) => bytes,
        Err(e) => {
            if e == ResolveError::DeadlineExceeded {
                ctx.deadline_hit.store(true, Ordering::SeqCst);
            }
            return fail(ctx, spec.name, SecretError::from(e));
        }
    };

    if ctx.aborted.load(Ordering::SeqCst) {
        tracing::debug!(secret = %spec.name, "Run aborted, discarding resolved secret");
        return SecretOutcome::new(spec.name, SecretStatus::Skipped);
    }
    if !ctx.continue_on_error && ctx.past_deadline() {
        ctx.deadline_hit.store(true, Ordering::SeqCst);
        tracing::debug!(secret = %spec.name, "Resolved after the deadline, discarding");
        return SecretOutcome::new(spec.name, SecretStatus::Skipped);
    }

    let worker = Arc::clone(ctx);
    let name = spec.name.clone();
    let written = tokio::task::spawn_blocking(move || {
        let digest = detect::content_digest(bytes.expose());
        let change = detect::classify(&worker.stored, &spec.name, &digest, &spec.path);
        let journal = worker.journal.as_ref();

        let result = if change.needs_write() {
            worker.materializer.write(&spec, bytes.expose(), journal)
        } else {
            worker.materializer.reassert(&spec, journal)
        };
        drop(bytes);

        if result.is_ok() && change.needs_write() {
            worker.record(&spec.name, digest);
        }
        (change, result)
    })
    .await;

    match written {
        Ok((change, Ok(()))) => {
            let status = if change == Change::Unchanged {
                SecretStatus::Unchanged
            } else {
                SecretStatus::Written
            };
            tracing::debug!(secret = %name, change = change.as_str(), "Secret applied");
            SecretOutcome::new(name, status).with_change(change)
        }
        Ok((change, Err(e))) => fail(ctx, name, SecretError::from(e)).with_change(change),
        Err(e) => {
            tracing::error!(secret = %name, "Write task failed: {}", e);
            if !ctx.continue_on_error {
                ctx.aborted.store(true, Ordering::SeqCst);
            }
            SecretOutcome::new(name, SecretStatus::Failed).with_error("write task failed")
        }
    }
}

fn fail(ctx: &RunContext, name: String, error: SecretError) -> SecretOutcome {
    tracing::warn!(secret = %name, "Secret failed: {}", error);
    if !ctx.continue_on_error {
        ctx.aborted.store(true, Ordering::SeqCst);
    }
    SecretOutcome::new(name, SecretStatus::Failed).with_error(error)
}

/// Records for secrets still in the manifest
///
/// Failed and skipped secrets keep their previous record, their old file
/// is still the one on disk.
fn prune(applied: &HashMapping, manifest: &SecretManifest) -> HashMapping {
    applied
        .iter()
        .filter(|(name, _)| manifest.get(name).is_some())
        .map(|(name, record)| (name.clone(), record.clone()))
        .collect()
}

fn rollback(ctx: &RunContext, outcomes: &mut [SecretOutcome], report: &mut RunReport) {
    let Some(journal) = &ctx.journal else {
        return;
    };

    tracing::warn!(destinations = journal.len(), "Rolling back written secrets");
    for error in journal.restore() {
        tracing::warn!("Rollback step failed: {}", error);
        report.errors.push(format!("Rollback: {}", error));
    }

    for outcome in outcomes.iter_mut() {
        if outcome.status == SecretStatus::Written {
            outcome.rolled_back = true;
        }
    }
    report.rolled_back = true;
}

fn finish(
    mut report: RunReport,
    outcomes: Vec<SecretOutcome>,
    status: RunStatus,
    started: Instant,
) -> RunReport {
    report.status = status;
    if status == RunStatus::Failure {
        report.phase = Phase::Failed;
    }
    report.outcomes = outcomes;
    report.duration = started.elapsed();

    tracing::info!(
        status = status.as_str(),
        written = report.count(SecretStatus::Written),
        unchanged = report.count(SecretStatus::Unchanged),
        failed = report.count(SecretStatus::Failed),
        skipped = report.count(SecretStatus::Skipped),
        "Deployment finished"
    );
    report
}
