//! Server configuration.
//!
//! Loaded from a TOML file named on the command line. The `[local_mirror]`
//! table configures the export; the optional `[hal]` table configures the
//! bring-up transport used when no vendor HAL is attached.
//!
//! ```toml
//! [local_mirror]
//! dir = "/srv/export"
//! metadata_timeout = 1.0
//! uring_cq_polling = false
//! uring_cq_polling_nthreads = 1
//! ```

use std::error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Default socket path of the bring-up transport.
const DEFAULT_HAL_SOCKET: &str = "/run/mirrorfsd.sock";

/// Error produced while loading or validating the configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read(PathBuf, io::Error),
    Parse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(path, e) => write!(f, "cannot read {}: {e}", path.display()),
            ConfigError::Parse(path, e) => write!(f, "cannot parse {}: {e}", path.display()),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl error::Error for ConfigError {}

/// Top-level configuration file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub local_mirror: LocalMirror,
    #[serde(default)]
    pub hal: Hal,
}

/// The `[local_mirror]` table.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalMirror {
    /// Absolute path of the directory to export.
    pub dir: PathBuf,
    /// Entry/attr cache TTL in seconds; 0 disables the writeback cache
    /// and enables the unlink pre-invalidation dance.
    pub metadata_timeout: f64,
    /// Busy-poll the completion queue instead of blocking in the kernel.
    pub uring_cq_polling: bool,
    /// Reaper threads when polling is enabled.
    pub uring_cq_polling_nthreads: usize,
    /// HAL poll threads pumping the request queue.
    #[serde(default = "default_poll_nthreads")]
    pub poll_nthreads: usize,
}

/// The optional `[hal]` table.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Hal {
    /// Listening socket of the bring-up transport.
    pub socket: PathBuf,
}

impl Default for Hal {
    fn default() -> Self {
        Self {
            socket: PathBuf::from(DEFAULT_HAL_SOCKET),
        }
    }
}

fn default_poll_nthreads() -> usize {
    1
}

impl LocalMirror {
    /// The metadata timeout as a [`Duration`].
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.metadata_timeout)
    }
}

impl Config {
    /// Loads and validates the configuration at `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let config: Config =
            toml::from_str(&raw).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let lm = &self.local_mirror;
        if !lm.dir.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "local_mirror.dir must be absolute, got {}",
                lm.dir.display()
            )));
        }
        if !(lm.metadata_timeout.is_finite() && lm.metadata_timeout >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "local_mirror.metadata_timeout must be a non-negative number of seconds, got {}",
                lm.metadata_timeout
            )));
        }
        if lm.uring_cq_polling_nthreads == 0 {
            return Err(ConfigError::Invalid(
                "local_mirror.uring_cq_polling_nthreads must be at least 1".into(),
            ));
        }
        if lm.poll_nthreads == 0 {
            return Err(ConfigError::Invalid(
                "local_mirror.poll_nthreads must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load_str(raw: &str) -> Result<Config, ConfigError> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(raw.as_bytes()).unwrap();
        Config::load(file.path())
    }

    #[test]
    fn full_config_parses() {
        let config = load_str(
            r#"
            [local_mirror]
            dir = "/srv/export"
            metadata_timeout = 1.5
            uring_cq_polling = true
            uring_cq_polling_nthreads = 2
            poll_nthreads = 4

            [hal]
            socket = "/tmp/queue.sock"
            "#,
        )
        .unwrap();
        assert_eq!(config.local_mirror.dir, PathBuf::from("/srv/export"));
        assert_eq!(
            config.local_mirror.metadata_timeout(),
            Duration::from_millis(1500)
        );
        assert!(config.local_mirror.uring_cq_polling);
        assert_eq!(config.local_mirror.uring_cq_polling_nthreads, 2);
        assert_eq!(config.local_mirror.poll_nthreads, 4);
        assert_eq!(config.hal.socket, PathBuf::from("/tmp/queue.sock"));
    }

    #[test]
    fn defaults_apply() {
        let config = load_str(
            r#"
            [local_mirror]
            dir = "/srv/export"
            metadata_timeout = 0
            uring_cq_polling = false
            uring_cq_polling_nthreads = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.local_mirror.poll_nthreads, 1);
        assert_eq!(config.hal.socket, PathBuf::from(DEFAULT_HAL_SOCKET));
        assert_eq!(config.local_mirror.metadata_timeout(), Duration::ZERO);
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let err = load_str(
            r#"
            [local_mirror]
            dir = "/srv/export"
            metadata_timeout = 1.0
            uring_cq_polling = false
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(..)));
    }

    #[test]
    fn relative_dir_is_rejected() {
        let err = load_str(
            r#"
            [local_mirror]
            dir = "export"
            metadata_timeout = 1.0
            uring_cq_polling = false
            uring_cq_polling_nthreads = 1
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_reapers_is_rejected() {
        let err = load_str(
            r#"
            [local_mirror]
            dir = "/srv/export"
            metadata_timeout = 1.0
            uring_cq_polling = true
            uring_cq_polling_nthreads = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
