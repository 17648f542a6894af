//! Engine Configuration
//!
//! Loads an [`EngineConfig`] from TOML, YAML, JSON, JSON5, RON or INI,
//! with `${VAR}` / `$VAR` substitution in file contents and `OCRBRIDGE_`
//! prefixed environment overrides (`__` separates nested keys, e.g.
//! `OCRBRIDGE_SESSION__STAGE_TIMEOUT_MS=5000`).

use config::builder::{ConfigBuilder, DefaultState};
use config::{Config as Cfg, Environment, File, FileFormat};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use crate::guest::{GuestAbi, RuntimeConfig};
use crate::stage::StageKind;

/// Environment variable naming a configuration file
pub const CONFIG_PATH_ENV: &str = "OCRBRIDGE_CONFIG";

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "OCRBRIDGE";

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no configuration format for `{0}`")]
    UnknownFormat(String),

    #[error("malformed configuration: {0}")]
    Malformed(String),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// How the guest build obtains its weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightsMode {
    /// Embedded iff the guest exports the embedded-init entry point
    #[default]
    Auto,
    /// Weights are compiled into the guest
    Embedded,
    /// Weights must be supplied as a model bundle
    External,
}

/// Where the compiled guest module comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Path to the `.wasm` (or `.wat`) file
    pub path: PathBuf,
    pub weights: WeightsMode,
    /// Read chunk size used while reporting load progress
    pub read_chunk_bytes: usize,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("retto_wasm.wasm"),
            weights: WeightsMode::Auto,
            read_chunk_bytes: 256 * 1024,
        }
    }
}

/// Session correlation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Per-stage wait bound in milliseconds; 0 waits forever
    pub stage_timeout_ms: u64,
    /// Notifications parked without a waiter before the oldest is evicted
    pub max_unclaimed_notifications: usize,
    /// Longest session token read out of guest memory
    pub max_token_len: usize,
    /// Longest stage payload read out of guest memory
    pub max_payload_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stage_timeout_ms: 60_000,
            max_unclaimed_notifications: 64,
            max_token_len: 128,
            max_payload_len: 16 * 1024 * 1024,
        }
    }
}

impl SessionConfig {
    pub fn stage_timeout(&self) -> Option<Duration> {
        (self.stage_timeout_ms > 0).then(|| Duration::from_millis(self.stage_timeout_ms))
    }

    /// A synchronous guest parks all three stages of a submission before
    /// its stream can claim them, so the bound must hold at least that many.
    pub fn validate(&self) -> ConfigResult<()> {
        let stages = StageKind::ORDER.len();
        if self.max_unclaimed_notifications < stages {
            return Err(ConfigError::Invalid {
                field: "session.max_unclaimed_notifications",
                reason: format!(
                    "{} is below the {} stages of one submission",
                    self.max_unclaimed_notifications, stages
                ),
            });
        }
        Ok(())
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub module: ModuleConfig,
    pub abi: GuestAbi,
    pub runtime: RuntimeConfig,
    pub session: SessionConfig,
}

impl EngineConfig {
    /// Load from a file, applying environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let config: Self = load_with_env(path.as_ref(), ENV_PREFIX)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `OCRBRIDGE_CONFIG` when set, otherwise defaults plus
    /// environment overrides.
    pub fn from_env() -> ConfigResult<Self> {
        let config: Self = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => return Self::from_file(path),
            Err(_) => deserialize(
                Cfg::builder().add_source(Environment::with_prefix(ENV_PREFIX).separator("__")),
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.session.validate()
    }

    pub fn with_module_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.module.path = path.into();
        self
    }

    pub fn with_weights(mut self, weights: WeightsMode) -> Self {
        self.module.weights = weights;
        self
    }
}

/// Config file format, chosen by extension
pub fn file_format(path: &Path) -> ConfigResult<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let format = match ext.as_str() {
        "toml" => FileFormat::Toml,
        "yaml" | "yml" => FileFormat::Yaml,
        "json" => FileFormat::Json,
        "json5" => FileFormat::Json5,
        "ron" => FileFormat::Ron,
        "ini" => FileFormat::Ini,
        _ => return Err(ConfigError::UnknownFormat(path.display().to_string())),
    };
    Ok(format)
}

static BRACED_VAR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").ok());
static BARE_VAR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").ok());

/// Substitute `${VAR}` and `$VAR` references; unknown variables are left as written.
pub fn substitute_env_vars(content: &str) -> String {
    let mut result = content.to_string();

    for re in [&*BRACED_VAR, &*BARE_VAR].into_iter().flatten() {
        result = re
            .replace_all(&result, |caps: &regex::Captures| {
                std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
            })
            .to_string();
    }

    result
}

fn deserialize<T>(builder: ConfigBuilder<DefaultState>) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    builder
        .build()
        .and_then(|cfg| cfg.try_deserialize())
        .map_err(|e| ConfigError::Malformed(e.to_string()))
}

/// Parse `content` in the given format after variable substitution.
pub fn from_str<T>(content: &str, format: FileFormat) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let content = substitute_env_vars(content);
    deserialize(Cfg::builder().add_source(File::from_str(&content, format)))
}

/// Load `path`, then apply `{env_prefix}_` environment overrides on top.
pub fn load_with_env<T>(path: &Path, env_prefix: &str) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let format = file_format(path)?;
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let content = substitute_env_vars(&content);

    deserialize(
        Cfg::builder()
            .add_source(File::from_str(&content, format))
            .add_source(Environment::with_prefix(env_prefix).separator("__")),
    )
}
