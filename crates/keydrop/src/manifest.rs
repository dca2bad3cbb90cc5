//! Manifest loading and validation
//!
//! A manifest is a JSON document listing secrets and where they go:
//!
//! ```json
//! {
//!   "pathTemplate": "/etc/secrets/{service}/{name}",
//!   "defaults": { "service": "shared" },
//!   "secrets": [
//!     { "name": "dbpass", "reference": "op://prod/postgres/password",
//!       "variables": { "service": "pg" }, "mode": "0440",
//!       "services": ["postgresql"] }
//!   ]
//! }
//! ```
//!
//! Several manifests merge in the order given. Everything is validated and
//! every destination path is resolved before the engine touches a vault or a
//! file, so a bad manifest never causes a partial deployment.

use indexmap::IndexMap;
use keydrop_core::config::parse_mode;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use crate::error::ConfigError;
use crate::template::Variables;

/// Manifest file as written on disk
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFile {
    pub secrets: Vec<SecretEntry>,
    #[serde(default)]
    pub path_template: Option<String>,
    #[serde(default)]
    pub defaults: HashMap<String, String>,
}

/// One secret as written on disk
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretEntry {
    pub name: String,
    pub reference: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub symlinks: Vec<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub services: Option<ServicesField>,
}

/// The `services` field accepts a list or a map keyed by service name
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ServicesField {
    List(Vec<ServiceEntry>),
    Map(IndexMap<String, ServiceOverrides>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ServiceEntry {
    Name(String),
    Detailed(DetailedService),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetailedService {
    pub name: String,
    #[serde(default)]
    pub restart: Option<bool>,
    #[serde(default)]
    pub signal: Option<String>,
    #[serde(default)]
    pub after: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceOverrides {
    #[serde(default)]
    pub restart: Option<bool>,
    #[serde(default)]
    pub signal: Option<String>,
    #[serde(default)]
    pub after: Vec<String>,
}

/// A service to notify when a secret changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceAction {
    /// Restart with no further options
    Simple(String),
    Detailed {
        name: String,
        restart: bool,
        signal: Option<String>,
        after: Vec<String>,
    },
}

impl ServiceAction {
    pub fn name(&self) -> &str {
        match self {
            Self::Simple(name) => name,
            Self::Detailed { name, .. } => name,
        }
    }

    /// Services this one should be notified after
    pub fn after(&self) -> &[String] {
        match self {
            Self::Simple(_) => &[],
            Self::Detailed { after, .. } => after,
        }
    }
}

/// A validated secret with its destination resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretSpec {
    pub name: String,
    pub reference: String,
    pub path: PathBuf,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: u32,
    pub symlinks: Vec<PathBuf>,
    pub services: Vec<ServiceAction>,
}

/// The merged, validated set of secrets for one run
#[derive(Debug, Clone, Default)]
pub struct SecretManifest {
    pub secrets: Vec<SecretSpec>,
}

impl SecretManifest {
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&SecretSpec> {
        self.secrets.iter().find(|s| s.name == name)
    }
}

/// Raw manifest bytes plus a label for error messages
#[derive(Debug, Clone)]
pub struct ManifestSource {
    pub origin: String,
    pub bytes: Vec<u8>,
}

impl ManifestSource {
    pub fn from_bytes(origin: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            origin: origin.into(),
            bytes: bytes.into(),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_bytes(path.display().to_string(), bytes))
    }
}

/// Turns manifest sources into a [`SecretManifest`]
#[derive(Debug, Clone)]
pub struct ManifestLoader {
    output_dir: PathBuf,
    default_mode: u32,
}

impl ManifestLoader {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            default_mode: 0o400,
        }
    }

    pub fn with_default_mode(mut self, mode: u32) -> Self {
        self.default_mode = mode;
        self
    }

    /// Read and load manifest files in order
    pub fn load_paths<P: AsRef<Path>>(&self, paths: &[P]) -> Result<SecretManifest, ConfigError> {
        let sources = paths
            .iter()
            .map(|p| ManifestSource::from_path(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        self.load(&sources)
    }

    /// Parse, validate and merge manifest sources
    pub fn load(&self, sources: &[ManifestSource]) -> Result<SecretManifest, ConfigError> {
        if sources.is_empty() {
            return Err(ConfigError::Empty("list".to_string()));
        }

        let mut merged: IndexMap<String, SecretSpec> = IndexMap::new();

        for source in sources {
            let file: ManifestFile =
                serde_json::from_slice(&source.bytes).map_err(|e| ConfigError::Parse {
                    origin: source.origin.clone(),
                    source: e,
                })?;

            if file.secrets.is_empty() {
                return Err(ConfigError::Empty(source.origin.clone()));
            }

            for (index, entry) in file.secrets.iter().enumerate() {
                let spec = self.resolve_entry(&file, entry, index)?;
                match merged.get(&spec.name) {
                    Some(existing) if *existing == spec => {
                        tracing::debug!(
                            secret = %spec.name,
                            "Duplicate secret with identical settings, skipping"
                        );
                    }
                    Some(_) => return Err(ConfigError::DuplicateSecret(spec.name)),
                    None => {
                        merged.insert(spec.name.clone(), spec);
                    }
                }
            }
        }

        let manifest = SecretManifest {
            secrets: merged.into_values().collect(),
        };
        check_path_collisions(&manifest)?;
        Ok(manifest)
    }

    fn resolve_entry(
        &self,
        file: &ManifestFile,
        entry: &SecretEntry,
        index: usize,
    ) -> Result<SecretSpec, ConfigError> {
        let field = format!("secrets[{}]", index);

        if entry.name.trim().is_empty() {
            return Err(ConfigError::invalid(
                format!("{}.name", field),
                "secret name cannot be empty",
            ));
        }
        let name = entry.name.clone();

        if !is_valid_reference(&entry.reference) {
            return Err(ConfigError::invalid(
                format!("{}.reference", field),
                format!(
                    "'{}' is not a vault reference (expected scheme://vault/item/field)",
                    entry.reference
                ),
            ));
        }

        let mode = match &entry.mode {
            Some(mode) => parse_mode(mode).ok_or_else(|| {
                ConfigError::invalid(
                    format!("{}.mode", field),
                    format!("'{}' is not an octal mode like 0644", mode),
                )
            })?,
            None => self.default_mode,
        };

        for (label, value) in [("owner", &entry.owner), ("group", &entry.group)] {
            if matches!(value, Some(v) if v.trim().is_empty()) {
                return Err(ConfigError::invalid(
                    format!("{}.{}", field, label),
                    format!("{} cannot be empty", label),
                ));
            }
        }

        let vars = Variables::new(&entry.variables, &name, &file.defaults);
        let expand = |template: &str| {
            vars.substitute(template)
                .map_err(|variable| ConfigError::MissingVariable {
                    secret: name.clone(),
                    variable,
                })
        };

        let raw_path = match (&entry.path, &file.path_template) {
            (Some(path), _) => expand(path)?,
            (None, Some(template)) => expand(template)?,
            (None, None) => name.clone(),
        };
        let path = self.normalize(&raw_path, &format!("{}.path", field))?;

        let mut symlinks = Vec::with_capacity(entry.symlinks.len());
        for (i, link) in entry.symlinks.iter().enumerate() {
            let link = self.normalize(&expand(link)?, &format!("{}.symlinks[{}]", field, i))?;
            if !symlinks.contains(&link) {
                symlinks.push(link);
            }
        }

        let services = normalize_services(entry.services.as_ref(), &field)?;

        Ok(SecretSpec {
            name,
            reference: entry.reference.clone(),
            path,
            owner: entry.owner.clone(),
            group: entry.group.clone(),
            mode,
            symlinks,
            services,
        })
    }

    /// Anchor relative paths at the output directory and reject `..`
    fn normalize(&self, raw: &str, field: &str) -> Result<PathBuf, ConfigError> {
        if raw.trim().is_empty() {
            return Err(ConfigError::invalid(field, "path cannot be empty"));
        }

        let candidate = Path::new(raw);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.output_dir.join(candidate)
        };

        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(ConfigError::invalid(
                        field,
                        format!("'{}' must not contain '..'", raw),
                    ));
                }
                other => normalized.push(other),
            }
        }

        if normalized.file_name().is_none() {
            return Err(ConfigError::invalid(
                field,
                format!("'{}' does not name a file", raw),
            ));
        }
        Ok(normalized)
    }
}

/// Check a `scheme://vault/item/field` locator
pub fn is_valid_reference(reference: &str) -> bool {
    static REF_RE: OnceLock<Regex> = OnceLock::new();
    let re = REF_RE.get_or_init(|| {
        Regex::new(r"^[a-z][a-z0-9+.-]*://[^/\s]+/[^/\s]+/[^\s]+$").expect("valid reference regex")
    });
    if !re.is_match(reference) {
        return false;
    }
    // Every segment after the scheme must be non-empty
    reference
        .split_once("://")
        .map(|(_, rest)| rest.split('/').all(|segment| !segment.is_empty()))
        .unwrap_or(false)
}

fn normalize_services(
    field: Option<&ServicesField>,
    prefix: &str,
) -> Result<Vec<ServiceAction>, ConfigError> {
    let entries: Vec<(String, Option<ServiceOverrides>)> = match field {
        None => Vec::new(),
        Some(ServicesField::List(list)) => list
            .iter()
            .map(|entry| match entry {
                ServiceEntry::Name(name) => (name.clone(), None),
                ServiceEntry::Detailed(d) => (
                    d.name.clone(),
                    Some(ServiceOverrides {
                        restart: d.restart,
                        signal: d.signal.clone(),
                        after: d.after.clone(),
                    }),
                ),
            })
            .collect(),
        Some(ServicesField::Map(map)) => map
            .iter()
            .map(|(name, overrides)| (name.clone(), Some(overrides.clone())))
            .collect(),
    };

    let mut actions: Vec<ServiceAction> = Vec::with_capacity(entries.len());
    for (i, (name, overrides)) in entries.into_iter().enumerate() {
        let field = format!("{}.services[{}]", prefix, i);

        if name.trim().is_empty() {
            return Err(ConfigError::invalid(field, "service name cannot be empty"));
        }
        if actions.iter().any(|a| a.name() == name) {
            return Err(ConfigError::invalid(
                field,
                format!("service '{}' is listed twice", name),
            ));
        }

        let action = match overrides {
            None => ServiceAction::Simple(name),
            Some(o) => {
                if o.after.iter().any(|dep| *dep == name) {
                    return Err(ConfigError::invalid(
                        format!("{}.after", field),
                        format!("service '{}' cannot be ordered after itself", name),
                    ));
                }
                if let Some(signal) = &o.signal {
                    if !is_valid_signal(signal) {
                        return Err(ConfigError::invalid(
                            format!("{}.signal", field),
                            format!("'{}' is not a signal name", signal),
                        ));
                    }
                }
                ServiceAction::Detailed {
                    name,
                    restart: o.restart.unwrap_or(true),
                    signal: o.signal,
                    after: o.after,
                }
            }
        };
        actions.push(action);
    }
    Ok(actions)
}

fn is_valid_signal(signal: &str) -> bool {
    !signal.is_empty() && signal.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-')
}

/// Every destination and symlink path must belong to exactly one secret
fn check_path_collisions(manifest: &SecretManifest) -> Result<(), ConfigError> {
    let mut owners: HashMap<&Path, &str> = HashMap::new();

    for secret in &manifest.secrets {
        let paths = std::iter::once(&secret.path).chain(secret.symlinks.iter());
        for path in paths {
            if let Some(first) = owners.insert(path.as_path(), &secret.name) {
                return Err(ConfigError::PathCollision {
                    first: first.to_string(),
                    second: secret.name.clone(),
                    path: path.clone(),
                });
            }
        }
    }
    Ok(())
}
