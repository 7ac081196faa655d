//! Harness configuration.
//!
//! Key=value format (`startstop.conf`), `#` comments, optional quotes.
//! Precedence: CLI flags > `STARTSTOP_*` environment > config file > defaults.

use crate::types::Mode;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Prefix for environment overrides (`iterations` -> `STARTSTOP_ITERATIONS`).
pub const ENV_PREFIX: &str = "STARTSTOP_";

/// Keys accepted by [`HarnessConfig::apply_value`], also scanned for env overrides.
pub const KEYS: &[&str] = &[
    "repo_dir",
    "apps_file",
    "workspace_dir",
    "archive_dir",
    "local_repo",
    "version",
    "iterations",
    "cold_start",
    "cleanup",
    "host",
    "port",
    "expected_listen_host",
    "accept_invalid_certs",
    "build_timeout_sec",
    "start_timeout_sec",
    "cold_start_timeout_sec",
    "stop_wait_sec",
    "port_close_timeout_sec",
    "probe_poll_ms",
    "port_poll_ms",
    "connect_timeout_ms",
    "request_timeout_ms",
    "build_cmd",
    "run_cmd",
    "native_build_cmd",
    "native_run_cmd",
    "dev_cmd",
    "generate_cmd",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid value for {key}: must be positive")]
    NotPositive { key: String },
}

/// Command template overrides (whitespace-separated tokens).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateOverrides {
    pub build: Option<Vec<String>>,
    pub run: Option<Vec<String>>,
    pub native_build: Option<Vec<String>>,
    pub native_run: Option<Vec<String>>,
    pub dev: Option<Vec<String>>,
    pub generate: Option<Vec<String>>,
}

/// Harness settings, loaded once and threaded through the orchestrator.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    // Locations
    pub repo_dir: PathBuf,
    pub apps_file: PathBuf,
    pub workspace_dir: PathBuf,
    pub archive_dir: PathBuf,
    /// Local artifact cache handed to the build tool.
    pub local_repo: PathBuf,

    // Target
    pub version: String,
    pub host: String,
    pub port: u16,
    /// When set, run logs must report listening on this host.
    pub expected_listen_host: Option<String>,
    /// Accept self-signed certificates when probing. Test-only relaxation.
    pub accept_invalid_certs: bool,

    // Scenario
    pub iterations: u32,
    pub cold_start: bool,
    /// Delete the workspace after archiving (disable to inspect it).
    pub cleanup: bool,

    // Bounds
    pub build_timeout_sec: u64,
    pub start_timeout_sec: u64,
    pub cold_start_timeout_sec: u64,
    pub stop_wait_sec: u64,
    pub port_close_timeout_sec: u64,
    pub probe_poll_ms: u64,
    pub port_poll_ms: u64,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,

    pub templates: TemplateOverrides,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            repo_dir: PathBuf::from("."),
            apps_file: PathBuf::from("apps.toml"),
            workspace_dir: PathBuf::from("target/startstop"),
            archive_dir: PathBuf::from("target/startstop-archive"),
            local_repo: default_local_repo(),
            version: "999-SNAPSHOT".to_string(),
            host: "localhost".to_string(),
            port: 8080,
            expected_listen_host: None,
            accept_invalid_certs: true,
            iterations: 10,
            cold_start: false,
            cleanup: true,
            build_timeout_sec: 20 * 60,
            start_timeout_sec: 60,
            cold_start_timeout_sec: 10 * 60,
            stop_wait_sec: 3 * 60,
            port_close_timeout_sec: 60,
            probe_poll_ms: 100,
            port_poll_ms: 1000,
            connect_timeout_ms: 500,
            request_timeout_ms: 5000,
            templates: TemplateOverrides::default(),
        }
    }
}

/// `~/.m2/repository`, or a relative fallback when there is no home directory.
fn default_local_repo() -> PathBuf {
    dirs::home_dir().map_or_else(|| PathBuf::from(".m2/repository"), |h| h.join(".m2/repository"))
}

impl HarnessConfig {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Apply `STARTSTOP_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, called with `STARTSTOP_<KEY>` names.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in KEYS {
            let name = format!("{ENV_PREFIX}{}", key.to_ascii_uppercase());
            if let Some(value) = lookup(&name) {
                self.apply_value(key, value.trim())?;
            }
        }
        Ok(())
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    pub fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "repo_dir" => self.repo_dir = PathBuf::from(value),
            "apps_file" => self.apps_file = PathBuf::from(value),
            "workspace_dir" => self.workspace_dir = PathBuf::from(value),
            "archive_dir" => self.archive_dir = PathBuf::from(value),
            "local_repo" => self.local_repo = PathBuf::from(value),
            "version" => self.version = value.to_string(),
            "host" => self.host = value.to_string(),
            "port" => self.port = Self::parse_int(key, value)?,
            "expected_listen_host" => {
                self.expected_listen_host = (!value.is_empty()).then(|| value.to_string());
            }
            "accept_invalid_certs" => self.accept_invalid_certs = Self::parse_bool(key, value)?,
            "iterations" => self.iterations = Self::parse_positive(key, value)?,
            "cold_start" => self.cold_start = Self::parse_bool(key, value)?,
            "cleanup" => self.cleanup = Self::parse_bool(key, value)?,
            "build_timeout_sec" => self.build_timeout_sec = Self::parse_int(key, value)?,
            "start_timeout_sec" => self.start_timeout_sec = Self::parse_int(key, value)?,
            "cold_start_timeout_sec" => self.cold_start_timeout_sec = Self::parse_int(key, value)?,
            "stop_wait_sec" => self.stop_wait_sec = Self::parse_int(key, value)?,
            "port_close_timeout_sec" => self.port_close_timeout_sec = Self::parse_int(key, value)?,
            "probe_poll_ms" => self.probe_poll_ms = Self::parse_positive(key, value)?,
            "port_poll_ms" => self.port_poll_ms = Self::parse_positive(key, value)?,
            "connect_timeout_ms" => self.connect_timeout_ms = Self::parse_positive(key, value)?,
            "request_timeout_ms" => self.request_timeout_ms = Self::parse_positive(key, value)?,
            "build_cmd" => self.templates.build = Self::parse_tokens(value),
            "run_cmd" => self.templates.run = Self::parse_tokens(value),
            "native_build_cmd" => self.templates.native_build = Self::parse_tokens(value),
            "native_run_cmd" => self.templates.native_run = Self::parse_tokens(value),
            "dev_cmd" => self.templates.dev = Self::parse_tokens(value),
            "generate_cmd" => self.templates.generate = Self::parse_tokens(value),
            _ => {
                return Err(ConfigError::InvalidLine(format!("unknown config key: {key}")));
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Integer that must be greater than zero.
    fn parse_positive<T>(key: &str, value: &str) -> Result<T, ConfigError>
    where
        T: std::str::FromStr + Default + PartialEq,
    {
        let parsed: T = Self::parse_int(key, value)?;
        if parsed == T::default() {
            return Err(ConfigError::NotPositive {
                key: key.to_string(),
            });
        }
        Ok(parsed)
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Empty value clears the override and restores the built-in template.
    fn parse_tokens(value: &str) -> Option<Vec<String>> {
        let tokens: Vec<String> = value.split_whitespace().map(str::to_string).collect();
        (!tokens.is_empty()).then_some(tokens)
    }

    /// Resolve relative paths against a base directory.
    pub fn resolve_paths(&mut self, base: &Path) {
        for path in [
            &mut self.repo_dir,
            &mut self.apps_file,
            &mut self.workspace_dir,
            &mut self.archive_dir,
            &mut self.local_repo,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// Readiness timeout for a run, longer for cold starts.
    pub fn start_timeout(&self) -> Duration {
        if self.cold_start {
            Duration::from_secs(self.cold_start_timeout_sec)
        } else {
            Duration::from_secs(self.start_timeout_sec)
        }
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_sec)
    }

    pub fn stop_wait(&self) -> Duration {
        Duration::from_secs(self.stop_wait_sec)
    }

    pub fn port_close_timeout(&self) -> Duration {
        Duration::from_secs(self.port_close_timeout_sec)
    }

    /// Base URL probed for readiness (`http://localhost:8080`).
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Cumulative measurements CSV for `mode`.
    pub fn measurements_log(&self, mode: Mode) -> PathBuf {
        self.archive_dir.join(format!("measurements-{mode}.csv"))
    }
}
