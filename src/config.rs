//! Configuration for hookguard.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (HOOKGUARD_HOME, HOOKGUARD_STORE)
//! 2. Config file (.hookguard/config.yaml)
//! 3. Defaults (~/.hookguard, sqlite store)
//!
//! Config file discovery:
//! - Searches current directory and parents for .hookguard/config.yaml
//! - Paths in config file are relative to the .hookguard/ directory

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::webhook::WebhookSettings;
use crate::core::{
    BreakerSettings, GuardContext, GuardSettings, LedgerSettings, LockSettings, SweeperSettings,
    UrlPolicy,
};
use crate::store::{FileStore, SqliteStore, StateStore, DEFAULT_MAX_VALUE_BYTES};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub home: Option<String>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ledger: LedgerSettings,
    #[serde(default)]
    pub lock: LockSettings,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub sweeper: SweeperSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    pub backend: Option<StoreBackend>,
    /// Store location (relative to .hookguard/)
    pub path: Option<String>,
    pub max_value_bytes: Option<usize>,
}

/// Webhook section: client settings and URL policy side by side
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    #[serde(flatten)]
    pub client: WebhookSettings,
    #[serde(flatten)]
    pub policy: UrlPolicy,
}

/// Shared store backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// One JSON file per key, last-write-wins
    File,
    /// SQLite table with compare-and-swap
    #[default]
    Sqlite,
}

impl StoreBackend {
    fn default_location(&self, home: &Path) -> PathBuf {
        match self {
            Self::File => home.join("state"),
            Self::Sqlite => home.join("state.db"),
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => f.write_str("file"),
            Self::Sqlite => f.write_str("sqlite"),
        }
    }
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            other => anyhow::bail!("Unknown store backend '{}' (expected file or sqlite)", other),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Absolute path to hookguard home
    pub home: PathBuf,
    pub store_backend: StoreBackend,
    /// Store file (sqlite) or directory (file)
    pub store_path: PathBuf,
    pub max_value_bytes: usize,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Component settings
    pub guard: GuardSettings,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".hookguard").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge a parsed config file with env overrides
fn resolve(
    file: ConfigFile,
    config_file: Option<PathBuf>,
    env_home: Option<String>,
    env_store: Option<String>,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let config_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);

    let home = match (env_home, &file.home, &config_dir) {
        (Some(env_home), _, _) => PathBuf::from(env_home),
        (None, Some(home), Some(dir)) => resolve_path(dir, home),
        _ => default_home,
    };

    let store_backend = match env_store {
        Some(raw) => raw
            .parse::<StoreBackend>()
            .context("Invalid HOOKGUARD_STORE")?,
        None => file.store.backend.unwrap_or_default(),
    };

    let store_path = match (&file.store.path, &config_dir) {
        (Some(path), Some(dir)) => resolve_path(dir, path),
        (Some(path), None) => PathBuf::from(path),
        (None, _) => store_backend.default_location(&home),
    };

    let guard = GuardSettings {
        ledger: file.ledger,
        lock: file.lock,
        breaker: file.breaker,
        webhook: file.webhook.client,
        safety: file.webhook.policy,
        sweeper: file.sweeper,
    };

    Ok(ResolvedConfig {
        home,
        store_backend,
        store_path,
        max_value_bytes: file.store.max_value_bytes.unwrap_or(DEFAULT_MAX_VALUE_BYTES),
        config_file,
        guard,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".hookguard");

    let config_file = find_config_file();
    let file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    resolve(
        file,
        config_file,
        std::env::var("HOOKGUARD_HOME").ok(),
        std::env::var("HOOKGUARD_STORE").ok(),
        default_home,
    )
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Open the configured shared store, creating its location if needed
pub fn open_store(config: &ResolvedConfig) -> Result<Arc<dyn StateStore>> {
    std::fs::create_dir_all(&config.home)
        .with_context(|| format!("Failed to create home: {}", config.home.display()))?;

    let store: Arc<dyn StateStore> = match config.store_backend {
        StoreBackend::Sqlite => Arc::new(
            SqliteStore::open(&config.store_path)
                .with_context(|| {
                    format!("Failed to open sqlite store: {}", config.store_path.display())
                })?
                .with_max_value_bytes(config.max_value_bytes),
        ),
        StoreBackend::File => Arc::new(
            FileStore::open(&config.store_path)?.with_max_value_bytes(config.max_value_bytes),
        ),
    };

    Ok(store)
}

/// Build a context over the configured store
pub fn guard_context(config: &ResolvedConfig) -> Result<GuardContext> {
    Ok(GuardContext::new(open_store(config)?, config.guard.clone()))
}
