//! Daemon configuration.
//!
//! Values are merged in order: built-in defaults, then the TOML file (if
//! present), then environment variables. Command-line flags are applied by
//! the binary on top.
//!
//! ```toml
//! bind_address = "0.0.0.0"
//! port = 5298
//! identity = "alice@workstation"
//! download_dir = "/home/alice/Downloads/presence"
//!
//! [oob]
//! allowed_schemes = ["https"]
//! allow_private_hosts = true
//! ```
//!
//! Env overrides: `PRESENCE_PORT`, `PRESENCE_DOWNLOAD_DIR`.

use std::ffi::CStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 5298;

/// Default bind address (all interfaces).
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Environment variable overriding `port`.
pub const ENV_PORT: &str = "PRESENCE_PORT";

/// Environment variable overriding `download_dir`.
pub const ENV_DOWNLOAD_DIR: &str = "PRESENCE_DOWNLOAD_DIR";

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub bind_address: String,
    pub port: u16,

    /// Name this endpoint answers to
    pub identity: String,

    /// Where received files are stored; transfers are refused when unset
    pub download_dir: Option<PathBuf>,

    /// Connect timeout for stream hosts and HTTP fetches
    pub connect_timeout_secs: u64,

    /// Upper bound on a single stanza write
    pub write_timeout_secs: u64,

    /// Upper bound on a single read while receiving a file
    pub transfer_timeout_secs: u64,

    /// Send the `hello` banner right after the stream header
    pub greet_on_open: bool,

    pub oob: OobPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            identity: default_identity(),
            download_dir: None,
            connect_timeout_secs: 10,
            write_timeout_secs: 10,
            transfer_timeout_secs: 30,
            greet_on_open: false,
            oob: OobPolicy::default(),
        }
    }
}

/// Which URLs an out-of-band offer may point at.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OobPolicy {
    /// Lowercase URL schemes that may be fetched
    pub allowed_schemes: Vec<String>,

    /// Permit loopback, private and link-local destinations
    pub allow_private_hosts: bool,
}

impl Default for OobPolicy {
    fn default() -> Self {
        Self {
            allowed_schemes: vec!["http".to_string(), "https".to_string()],
            allow_private_hosts: false,
        }
    }
}

impl Config {
    /// Loads the configuration.
    ///
    /// An explicitly given `path` must exist; without one, `default_path` is
    /// read when present and the built-in defaults are used otherwise.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a file cannot be read or parsed.
    pub fn load(path: Option<&Path>, default_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match (path, default_path) {
            (Some(path), _) => Self::from_file(path)?,
            (None, Some(path)) if path.exists() => Self::from_file(path)?,
            _ => {
                debug!("No configuration file, using defaults");
                Self::default()
            }
        };
        config.apply_env();
        Ok(config)
    }

    /// Parses a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Read` or `ConfigError::Parse`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        let config = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Applies `PRESENCE_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var(ENV_PORT).ok().as_deref(),
            std::env::var_os(ENV_DOWNLOAD_DIR).map(PathBuf::from),
        );
    }

    fn apply_overrides(&mut self, port: Option<&str>, download_dir: Option<PathBuf>) {
        if let Some(port) = port {
            match port.trim().parse::<u16>() {
                Ok(p) => self.port = p,
                Err(_) => warn!(value = %port, "Ignoring invalid {}", ENV_PORT),
            }
        }
        if let Some(dir) = download_dir {
            self.download_dir = Some(dir);
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }
}

/// `<hostname>.local`, or `localhost` when the host name is unavailable.
pub fn default_identity() -> String {
    match host_name() {
        Some(name) if !name.is_empty() => format!("{name}.local"),
        _ => "localhost".to_string(),
    }
}

fn host_name() -> Option<String> {
    let mut buf = [0 as libc::c_char; 256];
    // SAFETY: buf is valid for buf.len() bytes; the last byte stays zero, so
    // the result is always NUL-terminated.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len() - 1) };
    if rc != 0 {
        return None;
    }
    // SAFETY: NUL-terminated as above, and buf outlives the borrow.
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Some(name.to_string_lossy().into_owned())
}

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Invalid config file {path}: {error}")]
    Parse { path: PathBuf, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 5298);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert!(config.download_dir.is_none());
        assert!(!config.greet_on_open);
        assert_eq!(config.oob.allowed_schemes, vec!["http", "https"]);
        assert!(!config.oob.allow_private_hosts);
    }

    #[test]
    fn test_default_identity_is_not_empty() {
        let identity = default_identity();
        assert!(identity == "localhost" || identity.ends_with(".local"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "port = 6000\nidentity = \"me@here\"\n[oob]\nallow_private_hosts = true\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.identity, "me@here");
        assert_eq!(config.bind_address, "0.0.0.0");
        assert!(config.oob.allow_private_hosts);
        assert_eq!(config.oob.allowed_schemes, vec!["http", "https"]);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "prot = 1\n").unwrap();
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(
            Config::load(Some(&path), None),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config.apply_overrides(Some("7000"), Some(PathBuf::from("/tmp/dl")));
        assert_eq!(config.port, 7000);
        assert_eq!(config.download_dir, Some(PathBuf::from("/tmp/dl")));

        config.apply_overrides(Some("not-a-port"), None);
        assert_eq!(config.port, 7000);
    }
}
