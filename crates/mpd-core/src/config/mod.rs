//! Persistent daemon configuration.
//!
//! The configuration lives in a TOML file (`mpd.toml` by default) and is
//! exposed to consoles as a flat key/value store through `set`, `get`,
//! `delete` and `config`. A handful of well-known keys map onto typed fields;
//! everything else lands in the `[values]` table. Every mutation is written
//! back to disk atomically.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::wire::quote;

/// Default ring port.
pub const DEFAULT_PORT: u16 = 8675;

/// Default shared passphrase.
pub const DEFAULT_PHRASE: &str = "behappy";

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "mpd.toml";

/// Well-known key names, preserved verbatim.
pub mod names {
    pub const HOST: &str = "host";
    pub const PORT: &str = "port";
    pub const PHRASE: &str = "phrase";
    pub const SINGLE_USER: &str = "SingleUser";
    pub const TEMP: &str = "temp";
    pub const LEFT_HOST: &str = "LeftHost";
    pub const RIGHT_HOST: &str = "RightHost";
    pub const MPD_USER: &str = "MPDUserAccount";
    pub const MPD_USER_PASSWORD: &str = "MPDUserPassword";
    pub const USE_MPD_USER: &str = "UseMPDUser";
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading or writing the configuration file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for [`MpdConfig`].
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be serialized.
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A well-known key was given a value of the wrong shape.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Key being set.
        key: String,
        /// Rejected value.
        value: String,
    },
}

/// On-disk configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MpdConfig {
    /// Name this node is known by on the ring. Defaults to the system host
    /// name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Ring port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared passphrase for the challenge/response handshake.
    #[serde(default = "default_phrase")]
    pub phrase: String,

    /// Whether launches without credentials are allowed.
    #[serde(rename = "SingleUser", default = "default_single_user")]
    pub single_user: bool,

    /// Directory for `createtmpfile`. Defaults to the OS temp directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp: Option<PathBuf>,

    /// Left neighbor at the time of the last ring change.
    #[serde(rename = "LeftHost", default, skip_serializing_if = "Option::is_none")]
    pub left_host: Option<String>,

    /// Right neighbor at the time of the last ring change. Used to rejoin on
    /// restart.
    #[serde(rename = "RightHost", default, skip_serializing_if = "Option::is_none")]
    pub right_host: Option<String>,

    /// Account used for credential-less launches when enabled.
    #[serde(rename = "MPDUserAccount", default, skip_serializing_if = "Option::is_none")]
    pub mpd_user: Option<String>,

    /// Hex-encoded password for [`MpdConfig::mpd_user`].
    #[serde(rename = "MPDUserPassword", default, skip_serializing_if = "Option::is_none")]
    pub mpd_user_password: Option<String>,

    #[serde(rename = "UseMPDUser", default)]
    pub use_mpd_user: bool,

    /// Free-form `set`/`lset` pairs.
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

const fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_phrase() -> String {
    DEFAULT_PHRASE.to_string()
}

const fn default_single_user() -> bool {
    true
}

impl Default for MpdConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
            phrase: default_phrase(),
            single_user: true,
            temp: None,
            left_host: None,
            right_host: None,
            mpd_user: None,
            mpd_user_password: None,
            use_mpd_user: false,
            values: BTreeMap::new(),
        }
    }
}

impl MpdConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Directory used for temporary files.
    #[must_use]
    pub fn temp_dir(&self) -> PathBuf {
        self.temp.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Looks up a key the way `get` sees it.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            names::HOST => self.host.clone(),
            names::PORT => Some(self.port.to_string()),
            names::PHRASE => Some(self.phrase.clone()),
            names::SINGLE_USER => Some(yes_no(self.single_user).to_string()),
            names::TEMP => Some(self.temp_dir().display().to_string()),
            names::LEFT_HOST => self.left_host.clone(),
            names::RIGHT_HOST => self.right_host.clone(),
            names::MPD_USER => self.mpd_user.clone(),
            names::MPD_USER_PASSWORD => self.mpd_user_password.clone(),
            names::USE_MPD_USER => Some(yes_no(self.use_mpd_user).to_string()),
            _ => self.values.get(key).cloned(),
        }
    }

    /// Stores a key the way `set` sees it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when a typed key is given a value
    /// it cannot hold.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            names::HOST => self.host = Some(value.to_string()),
            names::PORT => self.port = value.trim().parse().map_err(|_| invalid())?,
            names::PHRASE => self.phrase = value.to_string(),
            names::SINGLE_USER => self.single_user = parse_flag(value).ok_or_else(invalid)?,
            names::TEMP => self.temp = Some(PathBuf::from(value)),
            names::LEFT_HOST => self.left_host = Some(value.to_string()),
            names::RIGHT_HOST => self.right_host = Some(value.to_string()),
            names::MPD_USER => self.mpd_user = Some(value.to_string()),
            names::MPD_USER_PASSWORD => self.mpd_user_password = Some(value.to_string()),
            names::USE_MPD_USER => self.use_mpd_user = parse_flag(value).ok_or_else(invalid)?,
            _ => {
                self.values.insert(key.to_string(), value.to_string());
            },
        }
        Ok(())
    }

    /// Removes a key. Keys with a built-in default (`port`, `phrase`,
    /// `SingleUser`) cannot be deleted and report `false`.
    pub fn delete(&mut self, key: &str) -> bool {
        match key {
            names::PORT | names::PHRASE | names::SINGLE_USER => false,
            names::HOST => self.host.take().is_some(),
            names::TEMP => self.temp.take().is_some(),
            names::LEFT_HOST => self.left_host.take().is_some(),
            names::RIGHT_HOST => self.right_host.take().is_some(),
            names::MPD_USER => self.mpd_user.take().is_some(),
            names::MPD_USER_PASSWORD => self.mpd_user_password.take().is_some(),
            names::USE_MPD_USER => std::mem::take(&mut self.use_mpd_user),
            _ => self.values.remove(key).is_some(),
        }
    }

    /// Space-separated `key=value` dump. The launch password is never shown.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut pairs: Vec<(String, String)> = Vec::new();
        let mut push = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                pairs.push((key.to_string(), value));
            }
        };
        push(names::HOST, self.host.clone());
        push(names::PORT, Some(self.port.to_string()));
        push(names::PHRASE, Some(self.phrase.clone()));
        push(names::SINGLE_USER, Some(yes_no(self.single_user).to_string()));
        push(names::TEMP, Some(self.temp_dir().display().to_string()));
        push(names::LEFT_HOST, self.left_host.clone());
        push(names::RIGHT_HOST, self.right_host.clone());
        push(names::MPD_USER, self.mpd_user.clone());
        push(names::USE_MPD_USER, Some(yes_no(self.use_mpd_user).to_string()));
        for (key, value) in &self.values {
            pairs.push((key.clone(), value.clone()));
        }

        pairs
            .iter()
            .map(|(key, value)| format!("{key}={}", quote(value)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

const fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" | "on" => Some(true),
        "no" | "false" | "0" | "off" => Some(false),
        _ => None,
    }
}

/// Shared, persisted configuration.
///
/// Reads take a snapshot under the lock. Writes mutate the in-memory copy and
/// then rewrite the backing file (if any) with a temp-file-and-rename so a
/// crash never leaves a truncated file behind.
#[derive(Debug)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    config: Mutex<MpdConfig>,
}

impl ConfigStore {
    /// Loads the store from `path`. A missing file yields the defaults; it is
    /// created on the first write.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            MpdConfig::from_file(path)?
        } else {
            MpdConfig::default()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            config: Mutex::new(config),
        })
    }

    /// Wraps `config` with a backing file.
    #[must_use]
    pub fn with_path(config: MpdConfig, path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            config: Mutex::new(config),
        }
    }

    /// A store that is never written to disk.
    #[must_use]
    pub fn in_memory(config: MpdConfig) -> Self {
        Self {
            path: None,
            config: Mutex::new(config),
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns a copy of the current configuration.
    #[must_use]
    pub fn snapshot(&self) -> MpdConfig {
        self.config.lock().expect("lock poisoned").clone()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.config.lock().expect("lock poisoned").get(key)
    }

    /// Sets one key and persists.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is invalid for the key or the file
    /// cannot be written.
    pub fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.update(|config| config.set(key, value))
    }

    /// Deletes one key and persists. Returns whether the key existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn delete(&self, key: &str) -> Result<bool, ConfigError> {
        self.update(|config| Ok(config.delete(key)))
    }

    /// Applies `f` to the configuration and persists the result.
    ///
    /// The in-memory change is kept even when writing the file fails.
    ///
    /// # Errors
    ///
    /// Returns the error from `f` or from writing the file.
    pub fn update<T>(
        &self,
        f: impl FnOnce(&mut MpdConfig) -> Result<T, ConfigError>,
    ) -> Result<T, ConfigError> {
        let (result, snapshot) = {
            let mut config = self.config.lock().expect("lock poisoned");
            let result = f(&mut config)?;
            (result, config.clone())
        };
        self.persist(&snapshot)?;
        Ok(result)
    }

    #[must_use]
    pub fn dump(&self) -> String {
        self.config.lock().expect("lock poisoned").dump()
    }

    #[must_use]
    pub fn phrase(&self) -> String {
        self.config.lock().expect("lock poisoned").phrase.clone()
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.config.lock().expect("lock poisoned").port
    }

    #[must_use]
    pub fn single_user(&self) -> bool {
        self.config.lock().expect("lock poisoned").single_user
    }

    #[must_use]
    pub fn temp_dir(&self) -> PathBuf {
        self.config.lock().expect("lock poisoned").temp_dir()
    }

    fn persist(&self, config: &MpdConfig) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = config.to_toml()?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(&dir)?;
        file.write_all(content.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| ConfigError::Io(e.error))?;
        Ok(())
    }
}
