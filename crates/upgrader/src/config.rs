//! Agent configuration.
//!
//! Configuration is resolved once at startup from environment variables plus
//! CLI overrides, validated, and then immutable for the lifetime of the
//! process. Directory layout is derived from a single data directory:
//!
//! ```text
//! <data>/downloads/temp       in-progress downloads
//! <data>/downloads/packages   verified artifacts
//! <data>/deployed/frontend    default frontend deploy root
//! <data>/deployed/backend     default backend deploy root
//! <data>/backup               snapshots + <project>-latest pointers
//! <data>/config               device-info.json, deploy-paths.json
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use upgrader_retry::ReconnectPolicy;
use url::Url;

use crate::error::AgentError;
use crate::types::Project;

/// Control-plane endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Endpoint URL; `http(s)` and `ws(s)` schemes are accepted and mapped
    /// to the right scheme per use (WebSocket connect vs. package HTTP).
    pub url: String,
    /// Transport connect timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9005".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Filesystem layout, all derived from `data_dir` unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirsConfig {
    pub data_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub package_dir: PathBuf,
    pub frontend_dir: PathBuf,
    pub backend_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub config_dir: PathBuf,
}

impl DirsConfig {
    pub fn under(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            temp_dir: data_dir.join("downloads").join("temp"),
            package_dir: data_dir.join("downloads").join("packages"),
            frontend_dir: data_dir.join("deployed").join("frontend"),
            backend_dir: data_dir.join("deployed").join("backend"),
            backup_dir: data_dir.join("backup"),
            config_dir: data_dir.join("config"),
        }
    }
}

/// The immutable runtime configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub server: ServerConfig,
    pub reconnect: ReconnectPolicy,
    pub dirs: DirsConfig,
    /// Historical snapshots kept per project; 0 keeps everything.
    pub max_backups: usize,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Operator-configured device name (`DEVICE_NAME`).
    pub device_name: Option<String>,
    /// Prefer the configured name over the real hostname.
    pub prefer_config_name: bool,
    /// Allow hostname discovery via OS calls and native commands.
    pub use_real_hostname: bool,
    /// Distinguishes multiple agents on one host (`AGENT_INSTANCE_ID`).
    pub instance_id: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            reconnect: ReconnectPolicy::default(),
            dirs: DirsConfig::under(Path::new(".")),
            max_backups: 5,
            heartbeat_interval: Duration::from_secs(30),
            device_name: None,
            prefer_config_name: false,
            use_real_hostname: true,
            instance_id: None,
        }
    }
}

impl AgentConfig {
    /// Resolve configuration from the environment, rooting the directory
    /// layout at `data_dir`. `server_url` (from the CLI) wins over
    /// `SERVER_URL`.
    pub fn from_env(data_dir: &Path, server_url: Option<String>) -> Result<Self, AgentError> {
        let mut cfg = AgentConfig {
            dirs: DirsConfig::under(data_dir),
            ..Default::default()
        };

        if let Some(url) = server_url.or_else(|| env_nonempty("SERVER_URL")) {
            cfg.server.url = url;
        }
        if let Some(secs) = env_u64("SERVER_TIMEOUT") {
            cfg.server.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("HEARTBEAT_INTERVAL") {
            cfg.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("MAX_BACKUPS") {
            cfg.max_backups = n as usize;
        }
        cfg.device_name = env_nonempty("DEVICE_NAME");
        cfg.prefer_config_name = env_flag("PREFER_CONFIG_NAME");
        cfg.use_real_hostname = !matches!(
            std::env::var("USE_REAL_HOSTNAME").ok().as_deref(),
            Some("false") | Some("0")
        );
        cfg.instance_id = env_nonempty("AGENT_INSTANCE_ID");

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.server.url.trim().is_empty() {
            return Err(AgentError::ConfigInvalid("server.url is empty".to_string()));
        }
        let url = Url::parse(&self.server.url)
            .map_err(|e| AgentError::ConfigInvalid(format!("server.url: {e}")))?;
        match url.scheme() {
            "http" | "https" | "ws" | "wss" => {}
            other => {
                return Err(AgentError::ConfigInvalid(format!(
                    "server.url has unsupported scheme {other}"
                )));
            }
        }
        if self.server.timeout.is_zero() {
            return Err(AgentError::ConfigInvalid(
                "server.timeout must be positive".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(AgentError::ConfigInvalid(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        if self.reconnect.base_delay.is_zero() {
            return Err(AgentError::ConfigInvalid(
                "reconnect base delay must be positive".to_string(),
            ));
        }
        if self.reconnect.max_delay < self.reconnect.base_delay {
            return Err(AgentError::ConfigInvalid(
                "reconnect max delay is below the base delay".to_string(),
            ));
        }
        Ok(())
    }

    /// The WebSocket endpoint (`http`→`ws`, `https`→`wss`).
    pub fn websocket_url(&self) -> Result<String, AgentError> {
        let mut url = Url::parse(&self.server.url)
            .map_err(|e| AgentError::ConfigInvalid(format!("server.url: {e}")))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(AgentError::ConfigInvalid(format!(
                    "server.url has unsupported scheme {other}"
                )));
            }
        };
        let _ = url.set_scheme(scheme);
        Ok(url.to_string())
    }

    /// The HTTP base for package endpoints (`ws`→`http`, `wss`→`https`),
    /// without a trailing slash.
    pub fn http_base(&self) -> String {
        let swapped = match Url::parse(&self.server.url) {
            Ok(mut url) => {
                let scheme: String = match url.scheme() {
                    "ws" => "http".to_string(),
                    "wss" => "https".to_string(),
                    s => s.to_string(),
                };
                let _ = url.set_scheme(&scheme);
                url.to_string()
            }
            Err(_) => self.server.url.clone(),
        };
        swapped.trim_end_matches('/').to_string()
    }

    /// Default deploy root for a project (overridable per command and via
    /// `deploy-paths.json`).
    pub fn deploy_root(&self, project: Project) -> &Path {
        match project {
            Project::Frontend => &self.dirs.frontend_dir,
            Project::Backend => &self.dirs.backend_dir,
        }
    }

    pub fn deploy_paths_file(&self) -> PathBuf {
        self.dirs.config_dir.join("deploy-paths.json")
    }

    pub fn device_info_file(&self) -> PathBuf {
        let name = match &self.instance_id {
            Some(instance) => format!("device-info-{instance}.json"),
            None => "device-info.json".to_string(),
        };
        self.dirs.config_dir.join(name)
    }

    /// Create the directory layout. Called once at startup.
    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        use anyhow::Context;

        for dir in [
            &self.dirs.temp_dir,
            &self.dirs.package_dir,
            &self.dirs.frontend_dir,
            &self.dirs.backend_dir,
            &self.dirs.backup_dir,
            &self.dirs.config_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).ok().as_deref(),
        Some("true") | Some("1") | Some("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn from_env_applies_overrides() {
        temp_env::with_vars(
            [
                ("SERVER_URL", Some("https://upgrade.example.com/agent")),
                ("SERVER_TIMEOUT", Some("10")),
                ("MAX_BACKUPS", Some("3")),
                ("AGENT_INSTANCE_ID", Some("2")),
            ],
            || {
                let cfg = AgentConfig::from_env(Path::new("/data/agent"), None).unwrap();
                assert_eq!(cfg.server.url, "https://upgrade.example.com/agent");
                assert_eq!(cfg.server.timeout, Duration::from_secs(10));
                assert_eq!(cfg.max_backups, 3);
                assert_eq!(
                    cfg.device_info_file(),
                    PathBuf::from("/data/agent/config/device-info-2.json")
                );
            },
        );
    }

    #[test]
    #[serial]
    fn cli_url_wins_over_env() {
        temp_env::with_var("SERVER_URL", Some("http://env.example.com"), || {
            let cfg = AgentConfig::from_env(
                Path::new("."),
                Some("http://cli.example.com".to_string()),
            )
            .unwrap();
            assert_eq!(cfg.server.url, "http://cli.example.com");
        });
    }

    #[test]
    fn invalid_scheme_is_fatal() {
        let cfg = AgentConfig {
            server: ServerConfig {
                url: "ftp://example.com".to_string(),
                timeout: Duration::from_secs(30),
            },
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(AgentError::ConfigInvalid(_))));
    }

    #[test]
    fn zero_timeout_is_fatal() {
        let cfg = AgentConfig {
            server: ServerConfig {
                url: "http://example.com".to_string(),
                timeout: Duration::ZERO,
            },
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(AgentError::ConfigInvalid(_))));
    }

    #[test]
    fn scheme_mapping_round_trips() {
        let cfg = AgentConfig {
            server: ServerConfig {
                url: "http://example.com:9005".to_string(),
                timeout: Duration::from_secs(30),
            },
            ..Default::default()
        };
        assert_eq!(cfg.websocket_url().unwrap(), "ws://example.com:9005/");
        assert_eq!(cfg.http_base(), "http://example.com:9005");

        let wss = AgentConfig {
            server: ServerConfig {
                url: "wss://example.com/agent".to_string(),
                timeout: Duration::from_secs(30),
            },
            ..Default::default()
        };
        assert_eq!(wss.http_base(), "https://example.com/agent");
    }

    #[test]
    fn directory_layout_derives_from_data_dir() {
        let dirs = DirsConfig::under(Path::new("/srv/agent"));
        assert_eq!(dirs.temp_dir, PathBuf::from("/srv/agent/downloads/temp"));
        assert_eq!(
            dirs.package_dir,
            PathBuf::from("/srv/agent/downloads/packages")
        );
        assert_eq!(dirs.backup_dir, PathBuf::from("/srv/agent/backup"));
    }
}
