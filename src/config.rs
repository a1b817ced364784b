//! Configuration loading and validation.
//!
//! Loads `./config.toml` (or `$MATRIX_RELAY_CONFIG`), then applies
//! environment overrides. A `.env` file in the working directory is read
//! first so its values take part in the override step.
//!
//! Precedence: env vars > config file > defaults.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::channel::ChannelError;
use crate::matrix::Credentials;
use crate::types::RegisteredGroup;

/// Env var naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "MATRIX_RELAY_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Homeserver and account settings.
    pub matrix: MatrixConfig,
    /// Assistant identity.
    pub assistant: AssistantConfig,
    /// Log output settings.
    pub logging: LoggingConfig,
    /// Registered conversations keyed by jid (`mx:<room id>`).
    pub groups: BTreeMap<String, RegisteredGroup>,
}

/// Matrix homeserver and account settings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    /// Homeserver base URL, e.g. `https://matrix.org`. Required.
    pub homeserver_url: Option<String>,
    /// Pre-issued access token.
    pub access_token: Option<String>,
    /// User id owning `access_token`. Required alongside a token.
    pub user_id: Option<String>,
    /// Login username (used when no token is set).
    pub username: Option<String>,
    /// Login password (used when no token is set).
    pub password: Option<String>,
    /// Device display name registered at login.
    pub device_name: String,
    /// Upper bound on the initial sync, in seconds.
    pub initial_sync_timeout_secs: u64,
    /// Long-poll timeout for incremental syncs, in milliseconds.
    pub sync_poll_timeout_ms: u64,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            homeserver_url: None,
            access_token: None,
            user_id: None,
            username: None,
            password: None,
            device_name: "matrix-relay".to_owned(),
            initial_sync_timeout_secs: 30,
            sync_poll_timeout_ms: 30_000,
        }
    }
}

impl std::fmt::Debug for MatrixConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("MatrixConfig")
            .field("homeserver_url", &self.homeserver_url)
            .field("access_token", &redact(&self.access_token))
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("device_name", &self.device_name)
            .field("initial_sync_timeout_secs", &self.initial_sync_timeout_secs)
            .field("sync_poll_timeout_ms", &self.sync_poll_timeout_ms)
            .finish()
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

impl MatrixConfig {
    /// The configured homeserver URL.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Config`] when it is missing or blank.
    pub fn homeserver_url(&self) -> Result<&str, ChannelError> {
        self.homeserver_url
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ChannelError::Config("MATRIX_HOMESERVER is not set".to_owned()))
    }

    /// Resolve which credential form to use. A token wins over a password.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Config`] when neither a token nor a complete
    /// username/password pair is configured, or a token lacks its user id.
    pub fn credentials(&self) -> Result<Credentials, ChannelError> {
        if let Some(token) = non_empty(&self.access_token) {
            let user_id = non_empty(&self.user_id).ok_or_else(|| {
                ChannelError::Config("MATRIX_ACCESS_TOKEN needs MATRIX_USER_ID".to_owned())
            })?;
            return Ok(Credentials::AccessToken { token, user_id });
        }
        match (non_empty(&self.username), non_empty(&self.password)) {
            (Some(username), Some(password)) => Ok(Credentials::Password { username, password }),
            _ => Err(ChannelError::Config(
                "no Matrix credentials: set MATRIX_ACCESS_TOKEN, or MATRIX_USERNAME and MATRIX_PASSWORD"
                    .to_owned(),
            )),
        }
    }
}

/// Assistant identity.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Name used as the reply prefix (`"<name>: ..."`).
    pub name: String,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            name: "Andy".to_owned(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for rotated JSON logs. Defaults to `~/.matrix-relay/logs`.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            dir: None,
        }
    }
}

impl Config {
    /// Load with precedence env vars > TOML file > defaults.
    ///
    /// `path` overrides `$MATRIX_RELAY_CONFIG` and `./config.toml`. A missing
    /// file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        // A missing .env is normal.
        let _ = dotenvy::dotenv();
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Load using a custom env resolver (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_with(
        path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => env(CONFIG_PATH_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.toml")),
        };
        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::debug!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to parse config at {}", path.display()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "failed to read config at {}: {e}",
                    path.display()
                ))
            }
        };
        config.apply_overrides(env);
        Ok(config)
    }

    /// Parse a TOML string (no env overrides).
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function so tests avoid mutating process env.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("MATRIX_HOMESERVER") {
            self.matrix.homeserver_url = Some(v);
        }
        if let Some(v) = env("MATRIX_ACCESS_TOKEN") {
            self.matrix.access_token = Some(v);
        }
        if let Some(v) = env("MATRIX_USER_ID") {
            self.matrix.user_id = Some(v);
        }
        if let Some(v) = env("MATRIX_USERNAME") {
            self.matrix.username = Some(v);
        }
        if let Some(v) = env("MATRIX_PASSWORD") {
            self.matrix.password = Some(v);
        }
        if let Some(v) = env("ASSISTANT_NAME").filter(|v| !v.trim().is_empty()) {
            self.assistant.name = v;
        }
        if let Some(v) = env("MATRIX_RELAY_LOG_LEVEL") {
            self.logging.level = v;
        }
    }

    /// Registered groups as the map handed to the channel registry query.
    pub fn registered_groups(&self) -> HashMap<String, RegisteredGroup> {
        self.groups
            .iter()
            .map(|(jid, group)| (jid.clone(), group.clone()))
            .collect()
    }
}

/// Resolve the default data directory (`~/.matrix-relay/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn data_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".matrix-relay"))
}
