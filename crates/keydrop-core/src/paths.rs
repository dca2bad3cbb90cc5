//! Standard paths used by keydrop

use std::path::PathBuf;

/// System-wide state directory, used when it exists
const SYSTEM_STATE_DIR: &str = "/var/lib/keydrop";

/// System-wide output directory for materialized secrets
const SYSTEM_OUTPUT_DIR: &str = "/run/keydrop";

/// Default location of the engine configuration file
const SYSTEM_CONFIG_FILE: &str = "/etc/keydrop/config.json";

/// Default location of the vault service account token
const SYSTEM_TOKEN_FILE: &str = "/etc/opnix-token";

/// Standard keydrop paths
#[derive(Debug, Clone)]
pub struct Paths {
    /// State directory (/var/lib/keydrop or ~/.local/share/keydrop)
    pub state: PathBuf,
    /// Output directory for secrets (/run/keydrop or <state>/secrets)
    pub output: PathBuf,
    /// Configuration file (/etc/keydrop/config.json)
    pub config: PathBuf,
    /// Service account token file
    pub token: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        let system_state = PathBuf::from(SYSTEM_STATE_DIR);

        // Prefer the system directories (NixOS module, root daemon),
        // fall back to the user's data dir for unprivileged runs
        let state = if system_state.exists() {
            system_state
        } else {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("~/.local/share"))
                .join("keydrop")
        };

        let output = if PathBuf::from(SYSTEM_OUTPUT_DIR).exists() {
            PathBuf::from(SYSTEM_OUTPUT_DIR)
        } else {
            state.join("secrets")
        };

        Self {
            state,
            output,
            config: PathBuf::from(SYSTEM_CONFIG_FILE),
            token: PathBuf::from(SYSTEM_TOKEN_FILE),
        }
    }

    /// Get the hash store file path
    pub fn hash_store(&self) -> PathBuf {
        self.state.join("hashes.json")
    }
}
