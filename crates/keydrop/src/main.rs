//! keydrop - Declarative secret deployment
//!
//! Commands:
//! - apply: resolve, write and notify
//! - check: validate manifests and show where every secret goes
//! - status: show the last applied digest of every secret

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keydrop_core::config::parse_mode;
use keydrop_core::{format, Config, Paths};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use keydrop::{
    DeployPolicy, HashStore, ManifestLoader, ManifestSource, OpCliResolver, Orchestrator,
    SystemdManager,
};

#[derive(Parser)]
#[command(name = "keydrop")]
#[command(
    about = "Declarative secret deployment - vault secrets as files, services notified on change"
)]
#[command(version)]
#[command(after_help = "\
EXAMPLES:
    keydrop check -m secrets.json            Validate and show destinations
    keydrop apply -m secrets.json            Deploy secrets
    keydrop apply -m base.json -m host.json  Merge manifests in order
    keydrop apply -m secrets.json --rollback Restore old files if anything fails
    keydrop status                           Show last applied secrets

EXIT CODES:
    0  every secret applied
    1  the run failed (strict abort, deadline, rollback, bad manifest)
    2  some secrets failed with --continue-on-error")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// More log output (repeat for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve secrets, write changed ones, notify services
    Apply {
        /// Manifest files, merged in order
        #[arg(short, long = "manifest", required = true)]
        manifests: Vec<PathBuf>,

        /// Directory for secrets without an explicit path
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Hash store file
        #[arg(long)]
        state_file: Option<PathBuf>,

        /// Vault service account token file
        #[arg(long)]
        token_file: Option<PathBuf>,

        /// Keep going when a secret fails
        #[arg(long)]
        continue_on_error: bool,

        /// Restore previous files when the run fails
        #[arg(long)]
        rollback: bool,

        /// Retries after a transient vault failure
        #[arg(long)]
        max_retries: Option<u32>,

        /// Secrets processed concurrently
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Overall deadline in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate manifests without touching the vault or the disk
    Check {
        /// Manifest files, merged in order
        #[arg(short, long = "manifest", required = true)]
        manifests: Vec<PathBuf>,

        /// Directory for secrets without an explicit path
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Show the hash store
    Status {
        /// Hash store file
        #[arg(long)]
        state_file: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "keydrop=info",
        1 => "keydrop=debug",
        _ => "keydrop=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let paths = Paths::new();
    let config_path = cli.config.unwrap_or_else(|| paths.config.clone());
    let mut config = Config::load(&config_path)?;

    match cli.command {
        Commands::Apply {
            manifests,
            output_dir,
            state_file,
            token_file,
            continue_on_error,
            rollback,
            max_retries,
            jobs,
            timeout,
            json,
        } => {
            config.output_dir = output_dir.or(config.output_dir.take());
            config.state_file = state_file.or(config.state_file.take());
            config.token_file = token_file.or(config.token_file.take());
            config.continue_on_error |= continue_on_error;
            config.rollback_on_failure |= rollback;
            if let Some(n) = max_retries {
                config.max_retries = n;
            }
            if let Some(n) = jobs {
                config.parallelism = n;
            }
            if let Some(secs) = timeout {
                config.deadline_secs = Some(secs);
            }
            config.validate()?;

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cmd_apply(&paths, &config, &manifests, json))
        }
        Commands::Check {
            manifests,
            output_dir,
        } => {
            config.output_dir = output_dir.or(config.output_dir.take());
            cmd_check(&paths, &config, &manifests)?;
            Ok(0)
        }
        Commands::Status { state_file, json } => {
            let store = HashStore::new(
                state_file
                    .or(config.state_file.take())
                    .unwrap_or_else(|| paths.hash_store()),
            );
            cmd_status(&store, json)?;
            Ok(0)
        }
    }
}

fn loader(paths: &Paths, config: &Config) -> Result<ManifestLoader> {
    let output_dir = config
        .output_dir
        .clone()
        .unwrap_or_else(|| paths.output.clone());
    let mode = parse_mode(&config.default_mode)
        .with_context(|| format!("Invalid defaultMode '{}'", config.default_mode))?;
    Ok(ManifestLoader::new(output_dir).with_default_mode(mode))
}

fn read_sources(manifests: &[PathBuf]) -> Result<Vec<ManifestSource>> {
    manifests
        .iter()
        .map(|p| ManifestSource::from_path(p).map_err(anyhow::Error::from))
        .collect()
}

/// Run a deployment and print its report
async fn cmd_apply(
    paths: &Paths,
    config: &Config,
    manifests: &[PathBuf],
    json: bool,
) -> Result<i32> {
    let loader = loader(paths, config)?;
    let sources = read_sources(manifests)?;
    // Validate before asking for a token, a bad manifest should not need one
    let manifest = loader.load(&sources)?;

    let token_file = config.token_file.clone().unwrap_or_else(|| paths.token.clone());
    let resolver = OpCliResolver::from_token_file(&config.resolver_command, &token_file)?;

    let services = SystemdManager::new();
    if !services.is_available() {
        tracing::warn!("systemctl not found, service notifications will fail");
    }

    let store = HashStore::new(
        config
            .state_file
            .clone()
            .unwrap_or_else(|| paths.hash_store()),
    );

    let orchestrator = Orchestrator::new(Arc::new(resolver), Arc::new(services), store)
        .with_policy(DeployPolicy::from(config));
    let report = orchestrator
        .deploy(&manifest)
        .await
        .context("Deployment failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render());
    }
    Ok(report.status.exit_code())
}

/// Validate manifests and print every destination
fn cmd_check(paths: &Paths, config: &Config, manifests: &[PathBuf]) -> Result<()> {
    let manifest = loader(paths, config)?.load(&read_sources(manifests)?)?;

    println!("{} secrets OK", manifest.len());
    for spec in &manifest.secrets {
        println!("  {:<24} {} ({:04o})", spec.name, spec.path.display(), spec.mode);
        for link in &spec.symlinks {
            println!("  {:<24} {} -> {}", "", link.display(), spec.path.display());
        }
        if !spec.services.is_empty() {
            let names: Vec<_> = spec.services.iter().map(|s| s.name()).collect();
            println!("  {:<24} notifies: {}", "", names.join(", "));
        }
    }
    Ok(())
}

/// Show last applied records
fn cmd_status(store: &HashStore, json: bool) -> Result<()> {
    let mapping = store.load()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&mapping)?);
        return Ok(());
    }

    if mapping.is_empty() {
        println!("No secrets applied yet ({})", store.path().display());
        return Ok(());
    }

    println!("Hash store: {}", store.path().display());
    for (name, record) in &mapping {
        let short = record.hash.get(..12).unwrap_or(&record.hash);
        println!(
            "  {:<24} {}  {}",
            name,
            short,
            format::relative_time(record.applied_at)
        );
    }
    Ok(())
}
