//! keydrop - Declarative secret deployment
//!
//! "Secrets land on disk exactly once, exactly where they belong."
//!
//! A run takes one or more JSON manifests, resolves every secret through a
//! vault, writes the ones whose content changed, and restarts or signals the
//! services that consume them:
//!
//! - manifest: parse, validate, merge and resolve destination paths
//! - resolver: the vault capability plus retry
//! - store: last-applied digests, committed once per run
//! - detect: new / changed / unchanged classification
//! - materialize: atomic writes, ownership, symlinks, rollback
//! - notifier: deduplicated, ordered service restarts and signals
//! - orchestrator: the run itself and its failure policy

pub mod detect;
pub mod error;
pub mod manifest;
pub mod materialize;
pub mod notifier;
pub mod orchestrator;
pub mod report;
pub mod resolver;
pub mod store;
pub mod template;

pub use error::{ConfigError, DeployError, FsError, NotifyError, ResolveError, StoreError};
pub use manifest::{ManifestLoader, ManifestSource, SecretManifest, SecretSpec, ServiceAction};
pub use notifier::{ServiceManager, SystemdManager};
pub use orchestrator::{DeployPolicy, Orchestrator};
pub use report::{RunReport, RunStatus, SecretOutcome, SecretStatus};
pub use resolver::{MemoryResolver, OpCliResolver, SecretBytes, SecretResolver};
pub use store::{HashRecord, HashStore};
