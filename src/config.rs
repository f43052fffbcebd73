use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::snapshot::BuildSettings;

/// System-wide configuration file, consulted when `--config` is not given.
const SYSTEM_CONFIG: &str = "/etc/maxima-pool/config.yaml";
/// Fallback next to the working directory.
const LOCAL_CONFIG: &str = "config.yaml";

/// Default upstream STACK repository.
const DEFAULT_REPOSITORY: &str = "https://github.com/maths/moodle-qtype_stack.git";

/// HTTP listener settings.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Default: 127.0.0.1
    pub host: Option<String>,
    /// Default: 80
    pub port: Option<u16>,
    /// Prefix of every route. Default: /
    pub base_path: Option<String>,
    /// Key required on the job route. Unset disables authentication.
    pub api_key: Option<String>,
    /// How long in-flight requests may run after a shutdown signal. Default: 3000
    pub shutdown_grace_ms: Option<u64>,
}

impl ServerConfig {
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("127.0.0.1")
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(80)
    }

    /// Base path normalized to a leading slash and no trailing slash; the
    /// root path is the empty string.
    pub fn base_path(&self) -> String {
        let raw = self.base_path.as_deref().unwrap_or("/");
        raw.trim_end_matches('/').to_string()
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.is_empty())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms.unwrap_or(3000))
    }
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Snapshot images and the registry record. Default: /tmp/maxima-data
    pub data: Option<PathBuf>,
    /// Parent of per-job and per-build scratch directories. Default: /tmp
    pub workspace: Option<PathBuf>,
}

impl StorageConfig {
    pub fn data(&self) -> PathBuf {
        self.data
            .clone()
            .unwrap_or_else(|| PathBuf::from("/tmp/maxima-data"))
    }

    pub fn workspace(&self) -> PathBuf {
        self.workspace
            .clone()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
    }
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    /// Ceiling for a job's run time. Default: 30000
    pub timeout_ms: Option<u64>,
    /// Unprivileged account jobs run as. Unset keeps the service's identity.
    pub user: Option<String>,
}

impl JobConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(30_000))
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref().filter(|u| !u.is_empty())
    }
}

/// Snapshot build settings.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct MaximaConfig {
    pub repository: Option<String>,
    /// Oldest STACK release to build, e.g. "4.4.0".
    pub min_version: Option<String>,
    /// Maxima executable used for building. Default: maxima
    pub command: Option<String>,
    /// Deadline for one image build. Default: 600000
    pub build_timeout_ms: Option<u64>,
}

impl MaximaConfig {
    pub fn repository(&self) -> &str {
        self.repository.as_deref().unwrap_or(DEFAULT_REPOSITORY)
    }

    pub fn command(&self) -> &str {
        self.command.as_deref().unwrap_or("maxima")
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms.unwrap_or(600_000))
    }
}

/// Configuration for maxima-pool, read from YAML.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Tracing filter directive. Default: info
    pub log_level: Option<String>,
    /// Write logs here instead of stderr.
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub maxima: MaximaConfig,
}

impl Config {
    /// Load the configuration.
    ///
    /// An explicit path must exist. Otherwise the system location and then
    /// `./config.yaml` are tried; when neither exists the defaults apply.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => [PathBuf::from(SYSTEM_CONFIG), PathBuf::from(LOCAL_CONFIG)]
                .into_iter()
                .find(|p| p.is_file()),
        };

        let config = match path {
            Some(path) => {
                debug!(path = %path.display(), "config:loading");
                Self::from_file(&path)?
            }
            None => {
                debug!("config:no file found, using defaults");
                Self::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        // An empty document deserializes as unit, not as an empty mapping.
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file at {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if let Some(base) = self.server.base_path.as_deref()
            && !base.starts_with('/')
        {
            bail!("server.base_path must start with '/', got '{base}'");
        }
        if self.job.timeout().is_zero() {
            bail!("job.timeout_ms must be greater than zero");
        }
        if self.maxima.build_timeout().is_zero() {
            bail!("maxima.build_timeout_ms must be greater than zero");
        }
        if self.server.port() == 0 {
            bail!("server.port must be greater than zero");
        }
        Ok(())
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn build_settings(&self) -> BuildSettings {
        BuildSettings {
            repository: self.maxima.repository().to_string(),
            min_version: self.maxima.min_version.clone().filter(|v| !v.is_empty()),
            command: self.maxima.command().to_string(),
            timeout: self.maxima.build_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(contents: &str) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn defaults_apply_when_keys_are_missing() {
        let config = Config::default();
        assert_eq!(config.log_level(), "info");
        assert_eq!(config.server.host(), "127.0.0.1");
        assert_eq!(config.server.port(), 80);
        assert_eq!(config.server.base_path(), "");
        assert_eq!(config.server.api_key(), None);
        assert_eq!(config.server.shutdown_grace(), Duration::from_secs(3));
        assert_eq!(config.storage.data(), PathBuf::from("/tmp/maxima-data"));
        assert_eq!(config.storage.workspace(), PathBuf::from("/tmp"));
        assert_eq!(config.job.timeout(), Duration::from_secs(30));
        assert_eq!(config.job.user(), None);
        assert_eq!(config.maxima.command(), "maxima");
        assert_eq!(config.maxima.build_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn parses_full_file() {
        let (_dir, path) = write_config(
            r#"
log_level: debug
server:
  host: 0.0.0.0
  port: 8080
  base_path: /pool/
  api_key: abcdefghijklmnopqrstuvwxyz
storage:
  data: /srv/maxima
  workspace: /var/tmp
job:
  timeout_ms: 5000
  user: nobody
maxima:
  repository: /srv/stack.git
  min_version: "4.4.0"
  command: /usr/bin/maxima
"#,
        );
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.log_level(), "debug");
        assert_eq!(config.server.host(), "0.0.0.0");
        assert_eq!(config.server.port(), 8080);
        assert_eq!(config.server.base_path(), "/pool");
        assert_eq!(config.server.api_key(), Some("abcdefghijklmnopqrstuvwxyz"));
        assert_eq!(config.storage.data(), PathBuf::from("/srv/maxima"));
        assert_eq!(config.job.timeout(), Duration::from_secs(5));
        assert_eq!(config.job.user(), Some("nobody"));

        let settings = config.build_settings();
        assert_eq!(settings.repository, "/srv/stack.git");
        assert_eq!(settings.min_version.as_deref(), Some("4.4.0"));
        assert_eq!(settings.command, "/usr/bin/maxima");
    }

    #[test]
    fn empty_file_means_defaults() {
        let (_dir, path) = write_config("\n");
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.port(), 80);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(Config::load(Some(&dir.path().join("absent.yaml"))).is_err());
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let (_dir, path) = write_config("server: [unterminated");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let (_dir, path) = write_config("job:\n  timeout: 5\n");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        for contents in [
            "job:\n  timeout_ms: 0\n",
            "maxima:\n  build_timeout_ms: 0\n",
            "server:\n  base_path: pool\n",
            "server:\n  port: 0\n",
        ] {
            let (_dir, path) = write_config(contents);
            assert!(Config::load(Some(&path)).is_err(), "accepted: {contents}");
        }
    }

    #[test]
    fn empty_strings_count_as_unset() {
        let (_dir, path) = write_config("server:\n  api_key: ''\njob:\n  user: ''\nmaxima:\n  min_version: ''\n");
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.api_key(), None);
        assert_eq!(config.job.user(), None);
        assert_eq!(config.build_settings().min_version, None);
    }
}
