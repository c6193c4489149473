//! Application configuration for Genie.
//!
//! User config lives at `~/.genie/genie.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GenieError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "genie.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".genie";

// ---------------------------------------------------------------------------
// Config structs (matching genie.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Fetcher limits.
    #[serde(default)]
    pub fetch: FetchSection,

    /// Compressor budgets.
    #[serde(default)]
    pub compress: CompressSection,

    /// Proposer/refiner bridge subprocess.
    #[serde(default)]
    pub bridge: BridgeSection,
}

/// `[fetch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchSection {
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Bodies are truncated at this many bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Maximum URLs accepted in one batch.
    #[serde(default = "default_max_urls")]
    pub max_urls: usize,

    /// Upper bound on concurrent fetches.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// User-Agent header sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
            max_urls: default_max_urls(),
            max_workers: default_max_workers(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    15
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_max_urls() -> usize {
    10
}
fn default_max_workers() -> usize {
    5
}
fn default_user_agent() -> String {
    concat!("Mozilla/5.0 (compatible; Genie/", env!("CARGO_PKG_VERSION"), ")").into()
}

/// `[compress]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressSection {
    /// Characters kept per text node before the ellipsis.
    #[serde(default = "default_text_limit")]
    pub text_limit: usize,

    /// Minimum text length for a block to count as main content.
    #[serde(default = "default_min_main_text")]
    pub min_main_text: usize,

    /// Characters of each compressed page handed to the proposer.
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
}

impl Default for CompressSection {
    fn default() -> Self {
        Self {
            text_limit: default_text_limit(),
            min_main_text: default_min_main_text(),
            max_prompt_chars: default_max_prompt_chars(),
        }
    }
}

fn default_text_limit() -> usize {
    30
}
fn default_min_main_text() -> usize {
    200
}
fn default_max_prompt_chars() -> usize {
    8000
}

/// `[bridge]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSection {
    /// Runtime used to launch the bridge script (e.g. `bun`).
    #[serde(default = "default_bridge_cmd")]
    pub cmd: String,

    /// Bridge script path, relative to `working_dir`.
    #[serde(default = "default_bridge_script")]
    pub script: String,

    /// Working directory for the bridge subprocess.
    #[serde(default = "default_working_dir")]
    pub working_dir: String,

    /// Model identifier forwarded to the bridge.
    #[serde(default = "default_model")]
    pub model: String,

    /// Seconds to wait for any single bridge message before giving up.
    #[serde(default = "default_bridge_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            cmd: default_bridge_cmd(),
            script: default_bridge_script(),
            working_dir: default_working_dir(),
            model: default_model(),
            timeout_secs: default_bridge_timeout_secs(),
        }
    }
}

fn default_bridge_cmd() -> String {
    "bun".into()
}
fn default_bridge_script() -> String {
    "bridge/genie-bridge.ts".into()
}
fn default_working_dir() -> String {
    ".".into()
}
fn default_model() -> String {
    "google/gemini-2.5-flash".into()
}
fn default_bridge_timeout_secs() -> u64 {
    180
}

// ---------------------------------------------------------------------------
// Fetch config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime fetch configuration.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub max_body_bytes: usize,
    pub max_urls: usize,
    pub max_workers: usize,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for FetchConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.fetch.timeout_secs),
            max_body_bytes: config.fetch.max_body_bytes,
            max_urls: config.fetch.max_urls,
            max_workers: config.fetch.max_workers.max(1),
            user_agent: config.fetch.user_agent.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.genie/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| GenieError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.genie/genie.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| GenieError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| GenieError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| GenieError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| GenieError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| GenieError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
