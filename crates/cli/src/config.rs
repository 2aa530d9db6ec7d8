//! Configuration management for the CLI
//!
//! Sources, later ones overriding earlier ones: built-in defaults, a YAML
//! config file, `KPICTL_*` environment variables, explicit flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Environment, File, FileFormat};
use serde::Deserialize;
use tracing::info;

/// Environment variable prefix
const ENV_PREFIX: &str = "KPICTL";

/// Config file looked up in the home directory
const DEFAULT_CONFIG_FILE: &str = ".kpictl.yaml";

/// CLI configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub verbose: bool,

    /// Upper bound on concurrent network calls
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Skip TLS certificate verification
    #[serde(default)]
    pub insecure: bool,

    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub password: Option<String>,

    /// Seconds before a platform request is abandoned; searches use their own
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Retries of a failed request before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_concurrency() -> usize {
    10
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8089
}

fn default_user() -> String {
    "admin".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

/// Values given explicitly on the command line
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_file: Option<PathBuf>,
    pub verbose: bool,
    pub concurrency: Option<usize>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub insecure: bool,
    pub access_token: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// How requests authenticate against the platform
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    Bearer(String),
    Basic { user: String, password: String },
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::Bearer(_) => f.write_str("Bearer(***)"),
            Auth::Basic { user, .. } => write!(f, "Basic({}:***)", user),
        }
    }
}

impl Config {
    /// Load and validate the configuration
    pub fn load(overrides: &ConfigOverrides) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some((path, required)) = resolve_config_file(overrides.config_file.as_deref()) {
            builder = builder.add_source(
                File::from(path.as_path())
                    .format(FileFormat::Yaml)
                    .required(required),
            );
        }

        builder = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .set_override_option("concurrency", overrides.concurrency.map(|c| c as u64))?
            .set_override_option("host", overrides.host.clone())?
            .set_override_option("port", overrides.port.map(u64::from))?
            .set_override_option("access_token", overrides.access_token.clone())?
            .set_override_option("user", overrides.user.clone())?
            .set_override_option("password", overrides.password.clone())?;

        // Switches only ever turn these on
        if overrides.verbose {
            builder = builder.set_override("verbose", true)?;
        }
        if overrides.insecure {
            builder = builder.set_override("insecure", true)?;
        }

        let config: Config = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency < 1 {
            bail!("concurrency must be at least 1");
        }
        if self.request_timeout_secs < 1 {
            bail!("request_timeout_secs must be at least 1");
        }
        self.auth().map(|_| ())
    }

    /// Bearer token when one is configured, else basic credentials
    pub fn auth(&self) -> Result<Auth> {
        if let Some(token) = self.access_token.as_ref().filter(|t| !t.is_empty()) {
            return Ok(Auth::Bearer(token.clone()));
        }
        match self.password.as_ref().filter(|p| !p.is_empty()) {
            Some(password) if !self.user.is_empty() => Ok(Auth::Basic {
                user: self.user.clone(),
                password: password.clone(),
            }),
            _ => bail!("Must provide user/password or access token"),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }

    /// Log the effective configuration, without secrets
    pub fn log_effective(&self) {
        info!(
            host = %self.host,
            port = self.port,
            concurrency = self.concurrency,
            insecure = self.insecure,
            request_timeout_secs = self.request_timeout_secs,
            max_retries = self.max_retries,
            user = %self.user,
            access_token_set = self.access_token.is_some(),
            password_set = self.password.is_some(),
            "Effective configuration"
        );
    }
}

/// Config file to read and whether it must exist.
///
/// An explicit path must exist; the home directory default is optional.
fn resolve_config_file(explicit: Option<&Path>) -> Option<(PathBuf, bool)> {
    if let Some(path) = explicit {
        return Some((path.to_path_buf(), true));
    }
    dirs_next::home_dir().map(|home| (home.join(DEFAULT_CONFIG_FILE), false))
}
