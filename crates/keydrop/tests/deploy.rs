//! End-to-end deployment runs against an in-memory vault

use async_trait::async_trait;
use serde_json::{json, Value};
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use keydrop::error::NotifyError;
use keydrop::report::Phase;
use keydrop::resolver::RetryPolicy;
use keydrop::{
    ConfigError, DeployError, DeployPolicy, HashStore, ManifestLoader, ManifestSource,
    MemoryResolver, Orchestrator, ResolveError, RunStatus, SecretBytes, SecretResolver,
    SecretStatus, ServiceManager,
};

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
    broken: Vec<String>,
}

impl Recorder {
    fn failing(services: &[&str]) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            broken: services.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceManager for Recorder {
    async fn restart(&self, service: &str) -> Result<(), NotifyError> {
        self.calls.lock().unwrap().push(format!("restart {}", service));
        if self.broken.iter().any(|b| b == service) {
            return Err(NotifyError::Restart {
                service: service.to_string(),
                message: "unit failed to start".to_string(),
            });
        }
        Ok(())
    }

    async fn signal(&self, service: &str, signal: &str) -> Result<(), NotifyError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("signal {} {}", service, signal));
        Ok(())
    }
}

/// Resolver that takes its time for selected references
struct SlowResolver {
    inner: MemoryResolver,
    slow: Vec<String>,
    delay: Duration,
}

#[async_trait]
impl SecretResolver for SlowResolver {
    async fn resolve(&self, reference: &str) -> Result<SecretBytes, ResolveError> {
        if self.slow.iter().any(|s| s == reference) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.resolve(reference).await
    }
}

/// Resolver that blocks its thread, so a timeout cannot cut it short
struct BlockingResolver {
    inner: MemoryResolver,
    delay: Duration,
}

#[async_trait]
impl SecretResolver for BlockingResolver {
    async fn resolve(&self, reference: &str) -> Result<SecretBytes, ResolveError> {
        std::thread::sleep(self.delay);
        self.inner.resolve(reference).await
    }
}

/// Resolver that records how many resolutions overlap
#[derive(Default)]
struct CountingResolver {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl SecretResolver for CountingResolver {
    async fn resolve(&self, reference: &str) -> Result<SecretBytes, ResolveError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(SecretBytes::new(reference.as_bytes()))
    }
}

struct Fixture {
    tmp: TempDir,
    resolver: Arc<MemoryResolver>,
    services: Arc<Recorder>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_services(Recorder::default())
    }

    fn with_services(services: Recorder) -> Self {
        Self {
            tmp: TempDir::new().unwrap(),
            resolver: Arc::new(MemoryResolver::new()),
            services: Arc::new(services),
        }
    }

    fn out(&self) -> PathBuf {
        self.tmp.path().join("out")
    }

    fn store_path(&self) -> PathBuf {
        self.tmp.path().join("state/hashes.json")
    }

    fn loader(&self) -> ManifestLoader {
        ManifestLoader::new(self.out())
    }

    fn orchestrator(&self, policy: DeployPolicy) -> Orchestrator {
        Orchestrator::new(
            self.resolver.clone(),
            self.services.clone(),
            HashStore::new(self.store_path()),
        )
        .with_policy(policy)
    }

    async fn apply(&self, manifest: &Value, policy: DeployPolicy) -> keydrop::RunReport {
        self.orchestrator(policy)
            .run(&self.loader(), &[source(manifest)])
            .await
            .unwrap()
    }
}

fn source(manifest: &Value) -> ManifestSource {
    ManifestSource::from_bytes("test.json", serde_json::to_vec(manifest).unwrap())
}

fn reference(name: &str) -> String {
    format!("op://prod/{}/password", name)
}

fn secret(name: &str, services: &[&str]) -> Value {
    json!({
        "name": name,
        "reference": reference(name),
        "mode": "0600",
        "services": services,
    })
}

fn strict() -> DeployPolicy {
    DeployPolicy {
        retry: RetryPolicy {
            max_retries: 1,
            backoff: Duration::from_millis(1),
        },
        ..DeployPolicy::default()
    }
}

fn lenient() -> DeployPolicy {
    DeployPolicy {
        continue_on_error: true,
        ..strict()
    }
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

#[tokio::test]
async fn test_second_run_with_same_inputs_does_nothing() {
    let fx = Fixture::new();
    fx.resolver.insert(&reference("db"), "hunter2");
    fx.resolver.insert(&reference("api"), "key-1");
    let manifest = json!({ "secrets": [secret("db", &["postgresql"]), secret("api", &["api"])] });

    let first = fx.apply(&manifest, strict()).await;
    assert_eq!(first.status, RunStatus::Success);
    assert_eq!(first.count(SecretStatus::Written), 2);
    assert_eq!(fx.services.calls().len(), 2);
    assert_eq!(read(&fx.out().join("db")), "hunter2");

    let inode = fs::metadata(fx.out().join("db")).unwrap().ino();
    let second = fx.apply(&manifest, strict()).await;
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.count(SecretStatus::Written), 0);
    assert_eq!(second.count(SecretStatus::Unchanged), 2);
    assert!(second.notified.is_empty());
    assert_eq!(fx.services.calls().len(), 2);
    assert_eq!(fs::metadata(fx.out().join("db")).unwrap().ino(), inode);
}

#[tokio::test]
async fn test_only_changed_secret_is_rewritten_and_notified() {
    let fx = Fixture::new();
    fx.resolver.insert(&reference("db"), "hunter2");
    fx.resolver.insert(&reference("api"), "key-1");
    let manifest = json!({ "secrets": [secret("db", &["postgresql"]), secret("api", &["api"])] });

    fx.apply(&manifest, strict()).await;
    fx.resolver.insert(&reference("api"), "key-2");

    let report = fx.apply(&manifest, strict()).await;
    assert_eq!(report.outcome("db").unwrap().status, SecretStatus::Unchanged);
    assert_eq!(report.outcome("api").unwrap().status, SecretStatus::Written);
    assert_eq!(report.outcome("api").unwrap().change, Some("changed"));
    assert_eq!(report.notified_services(), vec!["api"]);
    assert_eq!(read(&fx.out().join("api")), "key-2");

    let store = HashStore::new(fx.store_path()).load().unwrap();
    assert_eq!(store["api"].hash, keydrop::detect::content_digest(b"key-2"));
}

#[tokio::test]
async fn test_path_collision_fails_before_any_resolution() {
    let fx = Fixture::new();
    fx.resolver.insert(&reference("a"), "1");
    fx.resolver.insert(&reference("b"), "2");
    let manifest = json!({ "secrets": [
        { "name": "a", "reference": reference("a"), "path": "shared" },
        { "name": "b", "reference": reference("b"), "path": "shared" },
    ]});

    let result = fx
        .orchestrator(strict())
        .run(&fx.loader(), &[source(&manifest)])
        .await;

    assert!(matches!(
        result,
        Err(DeployError::Config(ConfigError::PathCollision { .. }))
    ));
    assert_eq!(fx.resolver.calls(&reference("a")), 0);
    assert_eq!(fx.resolver.calls(&reference("b")), 0);
    assert!(!fx.out().exists());
    assert!(!fx.store_path().exists());
}

#[test]
fn test_path_template_expansion() {
    let manifest = json!({
        "pathTemplate": "/etc/secrets/{service}/{name}",
        "defaults": { "environment": "prod" },
        "secrets": [{
            "name": "dbpass",
            "reference": "op://prod/postgres/password",
            "variables": { "service": "pg" },
        }],
    });

    let loaded = ManifestLoader::new("/run/keydrop")
        .load(&[source(&manifest)])
        .unwrap();
    assert_eq!(loaded.secrets[0].path, PathBuf::from("/etc/secrets/pg/dbpass"));

    let missing = json!({
        "pathTemplate": "/etc/secrets/{service}/{name}",
        "defaults": { "environment": "prod" },
        "secrets": [{ "name": "dbpass", "reference": "op://prod/postgres/password" }],
    });
    match ManifestLoader::new("/run/keydrop").load(&[source(&missing)]) {
        Err(ConfigError::MissingVariable { variable, .. }) => assert_eq!(variable, "service"),
        other => panic!("expected a missing variable error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_mode_is_validated_and_applied() {
    let fx = Fixture::new();
    fx.resolver.insert(&reference("cert"), "-----BEGIN-----");

    let good = json!({ "secrets": [
        { "name": "cert", "reference": reference("cert"), "mode": "0644" },
    ]});
    let report = fx.apply(&good, strict()).await;
    assert_eq!(report.status, RunStatus::Success);
    let mode = fs::metadata(fx.out().join("cert")).unwrap().permissions().mode();
    assert_eq!(mode & 0o7777, 0o644);

    let bad = json!({ "secrets": [
        { "name": "cert", "reference": reference("cert"), "mode": "abc" },
    ]});
    let result = fx
        .orchestrator(strict())
        .run(&fx.loader(), &[source(&bad)])
        .await;
    assert!(matches!(
        result,
        Err(DeployError::Config(ConfigError::Invalid { .. }))
    ));
}

#[tokio::test]
async fn test_symlink_is_recreated_without_rewriting_the_file() {
    let fx = Fixture::new();
    fx.resolver.insert(&reference("tls"), "key material");
    let manifest = json!({ "secrets": [{
        "name": "tls",
        "reference": reference("tls"),
        "symlinks": ["links/tls.key"],
    }]});

    fx.apply(&manifest, strict()).await;
    let dest = fx.out().join("tls");
    let link = fx.out().join("links/tls.key");
    assert_eq!(fs::read_link(&link).unwrap(), dest);
    assert_eq!(read(&link), "key material");

    let inode = fs::metadata(&dest).unwrap().ino();
    fs::remove_file(&link).unwrap();

    let report = fx.apply(&manifest, strict()).await;
    assert_eq!(report.outcome("tls").unwrap().status, SecretStatus::Unchanged);
    assert_eq!(fs::read_link(&link).unwrap(), dest);
    assert_eq!(fs::metadata(&dest).unwrap().ino(), inode);
    assert!(report.notified.is_empty());
}

#[tokio::test]
async fn test_symlink_over_regular_file_is_a_conflict() {
    let fx = Fixture::new();
    fx.resolver.insert(&reference("tls"), "key material");
    fs::create_dir_all(fx.out()).unwrap();
    fs::write(fx.out().join("taken"), "somebody else's file").unwrap();

    let manifest = json!({ "secrets": [{
        "name": "tls",
        "reference": reference("tls"),
        "symlinks": ["taken"],
    }]});

    let report = fx.apply(&manifest, strict()).await;
    assert_eq!(report.status, RunStatus::Failure);
    let outcome = report.outcome("tls").unwrap();
    assert_eq!(outcome.status, SecretStatus::Failed);
    assert!(outcome.error.as_deref().unwrap().contains("taken"));
    assert_eq!(read(&fx.out().join("taken")), "somebody else's file");
    assert!(!fx.out().join("tls").exists());
}

#[tokio::test]
async fn test_symlink_conflict_keeps_previous_value_and_record() {
    let fx = Fixture::new();
    fx.resolver.insert(&reference("tls"), "v1");
    let manifest = json!({ "secrets": [{
        "name": "tls",
        "reference": reference("tls"),
        "symlinks": ["alias"],
        "services": ["nginx"],
    }]});

    fx.apply(&manifest, strict()).await;
    let store_before = fs::read(fx.store_path()).unwrap();
    fs::remove_file(fx.out().join("alias")).unwrap();
    fs::write(fx.out().join("alias"), "in the way").unwrap();
    fx.resolver.insert(&reference("tls"), "v2");

    let report = fx.apply(&manifest, strict()).await;
    assert_eq!(report.status, RunStatus::Failure);
    assert_eq!(report.outcome("tls").unwrap().status, SecretStatus::Failed);
    assert_eq!(read(&fx.out().join("tls")), "v1");
    assert_eq!(fs::read(fx.store_path()).unwrap(), store_before);
    assert_eq!(fx.services.calls(), vec!["restart nginx".to_string()]);
}

#[tokio::test]
async fn test_rollback_restores_previous_files_and_store() {
    let fx = Fixture::new();
    fx.resolver.insert(&reference("a"), "a-old");
    fx.resolver.insert(&reference("b"), "b-old");
    let manifest = json!({ "secrets": [secret("a", &["svc-a"]), secret("b", &["svc-b"])] });

    fx.apply(&manifest, strict()).await;
    let store_before = fs::read(fx.store_path()).unwrap();
    let calls_before = fx.services.calls().len();

    fx.resolver.insert(&reference("a"), "a-new");
    fx.resolver.fail(&reference("b"), ResolveError::NotFound(reference("b")));

    let with_new = json!({ "secrets": [
        secret("a", &["svc-a"]),
        secret("b", &["svc-b"]),
        { "name": "c", "reference": reference("c"), "symlinks": ["c-link"] },
    ]});
    fx.resolver.insert(&reference("c"), "c-first");

    let report = fx
        .apply(
            &with_new,
            DeployPolicy {
                rollback_on_failure: true,
                ..lenient()
            },
        )
        .await;

    assert_eq!(report.status, RunStatus::Failure);
    assert_eq!(report.phase, Phase::Failed);
    assert!(report.rolled_back);
    assert!(!report.committed);
    assert!(report.outcome("a").unwrap().rolled_back);
    assert_eq!(report.outcome("b").unwrap().status, SecretStatus::Failed);

    assert_eq!(read(&fx.out().join("a")), "a-old");
    assert_eq!(read(&fx.out().join("b")), "b-old");
    assert!(!fx.out().join("c").exists());
    assert!(fs::symlink_metadata(fx.out().join("c-link")).is_err());
    assert_eq!(fs::read(fx.store_path()).unwrap(), store_before);
    assert_eq!(fx.services.calls().len(), calls_before);

    let leftovers: Vec<_> = fs::read_dir(fx.out())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.starts_with('.'))
        .collect();
    assert!(leftovers.is_empty(), "left behind: {:?}", leftovers);
}

#[tokio::test]
async fn test_strict_rollback_restores_written_secret() {
    let fx = Fixture::new();
    fx.resolver.insert(&reference("a"), "a-old");
    fx.resolver.insert(&reference("b"), "b-old");
    let manifest = json!({ "secrets": [secret("a", &["svc-a"]), secret("b", &["svc-b"])] });

    fx.apply(&manifest, strict()).await;
    let store_before = fs::read(fx.store_path()).unwrap();

    // One worker, so a is written before b is resolved and fails
    fx.resolver.insert(&reference("a"), "a-new");
    fx.resolver.fail(&reference("b"), ResolveError::NotFound(reference("b")));
    let report = fx
        .apply(
            &manifest,
            DeployPolicy {
                rollback_on_failure: true,
                parallelism: 1,
                ..strict()
            },
        )
        .await;

    assert_eq!(report.status, RunStatus::Failure);
    assert!(report.rolled_back);
    assert!(!report.committed);
    let a = report.outcome("a").unwrap();
    assert_eq!(a.status, SecretStatus::Written);
    assert!(a.rolled_back);
    assert_eq!(report.outcome("b").unwrap().status, SecretStatus::Failed);

    assert_eq!(read(&fx.out().join("a")), "a-old");
    assert_eq!(read(&fx.out().join("b")), "b-old");
    assert_eq!(fs::read(fx.store_path()).unwrap(), store_before);
    assert!(report.notified.is_empty());
}

#[tokio::test]
async fn test_continue_on_error_commits_and_notifies_successes() {
    let fx = Fixture::new();
    fx.resolver.insert(&reference("good"), "fine");
    fx.resolver.fail(&reference("bad"), ResolveError::AuthDenied("no access".into()));
    let manifest = json!({
        "secrets": [secret("good", &["good-svc"]), secret("bad", &["bad-svc"])],
    });

    let report = fx.apply(&manifest, lenient()).await;
    assert_eq!(report.status, RunStatus::PartialFailure);
    assert_eq!(report.status.exit_code(), 2);
    assert_eq!(report.outcome("good").unwrap().status, SecretStatus::Written);
    assert_eq!(report.outcome("bad").unwrap().status, SecretStatus::Failed);
    assert_eq!(report.notified_services(), vec!["good-svc"]);

    let store = HashStore::new(fx.store_path()).load().unwrap();
    assert!(store.contains_key("good"));
    assert!(!store.contains_key("bad"));
}

#[tokio::test]
async fn test_strict_failure_skips_commit_and_notify() {
    let fx = Fixture::new();
    fx.resolver.insert(&reference("good"), "fine");
    fx.resolver.fail(&reference("bad"), ResolveError::NotFound(reference("bad")));
    let manifest = json!({
        "secrets": [secret("good", &["good-svc"]), secret("bad", &["bad-svc"])],
    });

    let report = fx.apply(&manifest, strict()).await;
    assert_eq!(report.status, RunStatus::Failure);
    assert!(!report.committed);
    assert!(report.notified.is_empty());
    assert!(fx.services.calls().is_empty());
    assert!(!fx.store_path().exists());
}

#[tokio::test]
async fn test_deadline_marks_unstarted_secrets_skipped() {
    let tmp = TempDir::new().unwrap();
    let inner = MemoryResolver::new();
    inner.insert(&reference("slow"), "eventually");
    inner.insert(&reference("later"), "never asked");
    let resolver = Arc::new(SlowResolver {
        inner,
        slow: vec![reference("slow")],
        delay: Duration::from_secs(30),
    });

    let orchestrator = Orchestrator::new(
        resolver,
        Arc::new(Recorder::default()),
        HashStore::new(tmp.path().join("hashes.json")),
    )
    .with_policy(DeployPolicy {
        parallelism: 1,
        deadline: Some(Duration::from_millis(100)),
        ..lenient()
    });

    let manifest = json!({ "secrets": [secret("slow", &[]), secret("later", &[])] });
    let report = orchestrator
        .run(&ManifestLoader::new(tmp.path().join("out")), &[source(&manifest)])
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failure);
    let slow = report.outcome("slow").unwrap();
    assert_eq!(slow.status, SecretStatus::Failed);
    assert!(slow.error.as_deref().unwrap().contains("Deadline"));
    assert_eq!(report.outcome("later").unwrap().status, SecretStatus::Skipped);
    assert!(!tmp.path().join("out/later").exists());
}

#[tokio::test]
async fn test_strict_deadline_commits_and_notifies_nothing() {
    let tmp = TempDir::new().unwrap();
    let inner = MemoryResolver::new();
    inner.insert(&reference("a"), "late");
    inner.insert(&reference("b"), "never asked");
    let resolver = Arc::new(BlockingResolver {
        inner,
        delay: Duration::from_millis(200),
    });
    let services = Arc::new(Recorder::default());
    let store = tmp.path().join("hashes.json");

    let orchestrator = Orchestrator::new(resolver, services.clone(), HashStore::new(&store))
        .with_policy(DeployPolicy {
            parallelism: 1,
            deadline: Some(Duration::from_millis(50)),
            ..strict()
        });

    let manifest = json!({ "secrets": [secret("a", &["svc-a"]), secret("b", &["svc-b"])] });
    let report = orchestrator
        .run(&ManifestLoader::new(tmp.path().join("out")), &[source(&manifest)])
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failure);
    assert!(!report.committed);
    assert!(report.notified.is_empty());
    assert!(services.calls().is_empty());
    assert!(!store.exists());
    assert_eq!(report.outcome("a").unwrap().status, SecretStatus::Skipped);
    assert_eq!(report.outcome("b").unwrap().status, SecretStatus::Skipped);
    assert!(!tmp.path().join("out/a").exists());
}

#[tokio::test]
async fn test_worker_pool_is_bounded() {
    let tmp = TempDir::new().unwrap();
    let resolver = Arc::new(CountingResolver::default());
    let names: Vec<String> = (0..8).map(|i| format!("s{}", i)).collect();
    let secrets: Vec<Value> = names.iter().map(|n| secret(n, &[])).collect();

    let orchestrator = Orchestrator::new(
        resolver.clone(),
        Arc::new(Recorder::default()),
        HashStore::new(tmp.path().join("hashes.json")),
    )
    .with_policy(DeployPolicy {
        parallelism: 3,
        ..strict()
    });

    let report = orchestrator
        .run(
            &ManifestLoader::new(tmp.path().join("out")),
            &[source(&json!({ "secrets": secrets }))],
        )
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.count(SecretStatus::Written), 8);
    let peak = resolver.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "{} resolutions ran at once", peak);
    assert!(peak > 1, "workers never overlapped");
}

#[tokio::test]
async fn test_notify_failure_is_a_warning() {
    let fx = Fixture::with_services(Recorder::failing(&["flaky"]));
    fx.resolver.insert(&reference("a"), "v");
    let manifest = json!({ "secrets": [secret("a", &["flaky", "steady"])] });

    let report = fx.apply(&manifest, strict()).await;
    assert_eq!(report.status, RunStatus::Success);
    assert!(report.committed);
    let outcome = report.outcome("a").unwrap();
    assert_eq!(outcome.status, SecretStatus::Written);
    assert_eq!(outcome.warnings.len(), 1);
    assert!(outcome.warnings[0].contains("flaky"));
    assert_eq!(
        fx.services.calls(),
        vec!["restart flaky".to_string(), "restart steady".to_string()]
    );
}

#[tokio::test]
async fn test_shared_service_is_notified_once_in_dependency_order() {
    let fx = Fixture::new();
    fx.resolver.insert(&reference("a"), "1");
    fx.resolver.insert(&reference("b"), "2");
    let manifest = json!({ "secrets": [
        {
            "name": "a",
            "reference": reference("a"),
            "services": { "nginx": { "signal": "SIGHUP", "after": ["app"] } },
        },
        {
            "name": "b",
            "reference": reference("b"),
            "services": ["app", "nginx"],
        },
    ]});

    fx.apply(&manifest, strict()).await;
    assert_eq!(
        fx.services.calls(),
        vec!["restart app".to_string(), "signal nginx SIGHUP".to_string()]
    );
}

#[tokio::test]
async fn test_removed_secret_is_pruned_from_store() {
    let fx = Fixture::new();
    fx.resolver.insert(&reference("a"), "1");
    fx.resolver.insert(&reference("b"), "2");

    fx.apply(&json!({ "secrets": [secret("a", &[]), secret("b", &[])] }), strict())
        .await;
    fx.apply(&json!({ "secrets": [secret("a", &[])] }), strict()).await;

    let store = HashStore::new(fx.store_path()).load().unwrap();
    assert_eq!(store.keys().collect::<Vec<_>>(), vec!["a"]);
}

#[tokio::test]
async fn test_deleted_destination_is_written_again() {
    let fx = Fixture::new();
    fx.resolver.insert(&reference("a"), "1");
    let manifest = json!({ "secrets": [secret("a", &["svc"])] });

    fx.apply(&manifest, strict()).await;
    fs::remove_file(fx.out().join("a")).unwrap();

    let report = fx.apply(&manifest, strict()).await;
    assert_eq!(report.outcome("a").unwrap().status, SecretStatus::Written);
    assert_eq!(read(&fx.out().join("a")), "1");
    assert_eq!(report.notified_services(), vec!["svc"]);
}
