//! Dispatch configuration
//!
//! Loaded from a TOML or JSON file, then optionally overridden by
//! `CONDUIT_*` environment variables:
//!
//! ```toml
//! temp_root = "/var/tmp/conduit"
//! max_form_parts = 200
//! max_form_bytes = 10485760
//!
//! [log]
//! level = "debug"
//! format = "compact"
//! ```

use crate::error::ConfigError;
use crate::form::FormLimits;
use crate::logging::{LogConfig, LogSettings};
use crate::media::WILDCARD;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Prefix of the environment variables read by [`DispatchConfig::with_env_overrides`]
pub const ENV_PREFIX: &str = "CONDUIT";

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Toml,
    Json,
}

impl FileFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "toml" => Some(FileFormat::Toml),
            "json" => Some(FileFormat::Json),
            _ => None,
        }
    }
}

/// Source of environment variables
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// The process environment
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Root of the per-request scratch directories
    pub temp_root: PathBuf,

    /// Media type assumed for requests without a content type
    pub default_media_type: String,

    pub max_form_parts: usize,

    pub max_form_bytes: Option<usize>,

    /// Apply COOKIE defaults even when the request has no `Cookie` header.
    /// Off by default: a missing header binds an absent value.
    pub cookie_default_without_header: bool,

    pub log: Option<LogSettings>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            temp_root: std::env::temp_dir().join("conduit-temp"),
            default_media_type: WILDCARD.to_string(),
            max_form_parts: FormLimits::default().max_parts,
            max_form_bytes: None,
            cookie_default_without_header: false,
            log: None,
        }
    }
}

impl DispatchConfig {
    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        let format = FileFormat::from_extension(ext)
            .ok_or_else(|| ConfigError::UnsupportedFormat(path.display().to_string()))?;
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        match format {
            FileFormat::Toml => Self::from_toml_str(&content),
            FileFormat::Json => Self::from_json_str(&content),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Apply `CONDUIT_*` variables from the process environment
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(&ProcessEnv)
    }

    pub fn with_overrides_from(mut self, env: &dyn EnvSource) -> Result<Self, ConfigError> {
        let lookup = |name: &str| env.var(&format!("{ENV_PREFIX}_{name}"));

        if let Some(root) = lookup("TEMP_ROOT") {
            self.temp_root = PathBuf::from(root);
        }
        if let Some(media_type) = lookup("DEFAULT_MEDIA_TYPE") {
            self.default_media_type = media_type;
        }
        if let Some(value) = lookup("MAX_FORM_PARTS") {
            self.max_form_parts = parse_var("MAX_FORM_PARTS", &value)?;
        }
        if let Some(value) = lookup("MAX_FORM_BYTES") {
            self.max_form_bytes = Some(parse_var("MAX_FORM_BYTES", &value)?);
        }
        if let Some(value) = lookup("COOKIE_DEFAULT_WITHOUT_HEADER") {
            self.cookie_default_without_header = parse_var("COOKIE_DEFAULT_WITHOUT_HEADER", &value)?;
        }
        Ok(self)
    }

    pub fn form_limits(&self) -> FormLimits {
        FormLimits {
            max_parts: self.max_form_parts,
            max_bytes: self.max_form_bytes,
        }
    }

    /// Logging configuration from the `[log]` section, if present
    pub fn log_config(&self) -> Option<LogConfig> {
        self.log.as_ref().map(LogConfig::from)
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}_{name}"),
        value: value.to_string(),
    })
}
