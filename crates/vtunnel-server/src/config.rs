//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use vtunnel_core::{Endpoint, TunnelError, TunnelResult, MAX_LINE};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub policy: PolicySection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_max_line")]
    pub max_line: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub max_sessions: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            max_line: default_max_line(),
            buffer_size: default_buffer_size(),
            poll_interval_ms: default_poll_interval_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_sessions: 0,
        }
    }
}

/// `[policy]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicySection {
    /// Empty = every port may be tunneled.
    #[serde(default)]
    pub allowed_ports: Vec<u16>,
}

fn default_listen() -> String {
    Endpoint::default_listen().to_string()
}
fn default_backlog() -> i32 {
    10
}
fn default_max_line() -> usize {
    MAX_LINE
}
fn default_buffer_size() -> usize {
    64 * 1024
}
fn default_poll_interval_ms() -> u64 {
    30_000
}
/// 0 = wait for the command line until the peer disconnects.
fn default_command_timeout_ms() -> u64 {
    0
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}

/// Values given on the command line; `None` / empty leaves the file value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub listen: Option<String>,
    pub allowed_ports: Vec<u16>,
    pub max_sessions: Option<usize>,
}

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: Endpoint,
    pub backlog: i32,
    pub max_line: usize,
    pub buffer_size: usize,
    pub poll_interval: Duration,
    /// `None` waits for the command line forever.
    pub command_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    /// 0 = unlimited.
    pub max_sessions: usize,
    pub allowed_ports: Vec<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default())
            .expect("built-in defaults are valid")
    }
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    ///
    /// A missing file is not an error; defaults are used instead.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> TunnelResult<Self> {
        let mut file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| TunnelError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        // Merge CLI overrides
        if let Some(listen) = overrides.listen {
            file_config.server.listen = listen;
        }
        if !overrides.allowed_ports.is_empty() {
            file_config.policy.allowed_ports = overrides.allowed_ports;
        }
        if let Some(max_sessions) = overrides.max_sessions {
            file_config.server.max_sessions = max_sessions;
        }

        Self::from_file(file_config)
    }

    fn from_file(file: ConfigFile) -> TunnelResult<Self> {
        let server = file.server;
        let listen: Endpoint = server.listen.parse()?;

        if server.max_line == 0 {
            return Err(TunnelError::Config("max_line must be positive".into()));
        }
        if server.buffer_size == 0 {
            return Err(TunnelError::Config("buffer_size must be positive".into()));
        }
        if server.poll_interval_ms == 0 {
            return Err(TunnelError::Config("poll_interval_ms must be positive".into()));
        }
        if file.policy.allowed_ports.contains(&0) {
            return Err(TunnelError::Config("allowed_ports may not contain 0".into()));
        }

        Ok(Self {
            listen,
            backlog: server.backlog,
            max_line: server.max_line,
            buffer_size: server.buffer_size,
            poll_interval: Duration::from_millis(server.poll_interval_ms),
            command_timeout: (server.command_timeout_ms > 0)
                .then(|| Duration::from_millis(server.command_timeout_ms)),
            connect_timeout: Duration::from_millis(server.connect_timeout_ms),
            max_sessions: server.max_sessions,
            allowed_ports: file.policy.allowed_ports,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen, Endpoint::default_listen());
        assert_eq!(config.backlog, 10);
        assert_eq!(config.max_line, 256);
        assert_eq!(config.buffer_size, 65536);
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.command_timeout, None);
        assert_eq!(config.max_sessions, 0);
        assert!(config.allowed_ports.is_empty());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        let config = ServerConfig::load(Some(&path), ConfigOverrides::default()).unwrap();
        assert_eq!(config.listen, Endpoint::default_listen());
    }

    #[test]
    fn load_file_with_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
listen = "tcp://127.0.0.1:7000"
poll_interval_ms = 250
command_timeout_ms = 1500
max_sessions = 4

[policy]
allowed_ports = [80, 443]
"#
        )
        .unwrap();

        let config = ServerConfig::load(Some(file.path()), ConfigOverrides::default()).unwrap();
        assert_eq!(config.listen, "tcp://127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.command_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.max_sessions, 4);
        assert_eq!(config.allowed_ports, vec![80, 443]);
        assert_eq!(config.buffer_size, 65536);

        let overrides = ConfigOverrides {
            listen: Some("unix:///tmp/vt.sock".into()),
            allowed_ports: vec![8080],
            max_sessions: Some(0),
        };
        let config = ServerConfig::load(Some(file.path()), overrides).unwrap();
        assert_eq!(config.listen, Endpoint::Unix(PathBuf::from("/tmp/vt.sock")));
        assert_eq!(config.allowed_ports, vec![8080]);
        assert_eq!(config.max_sessions, 0);
    }

    #[test]
    fn invalid_values_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nbuffer_size = 0").unwrap();
        assert!(matches!(
            ServerConfig::load(Some(file.path()), ConfigOverrides::default()),
            Err(TunnelError::Config(_))
        ));

        let overrides = ConfigOverrides {
            listen: Some("ftp://nowhere".into()),
            ..Default::default()
        };
        assert!(matches!(
            ServerConfig::load(None, overrides),
            Err(TunnelError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn malformed_toml_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nlisten = 1").unwrap();
        assert!(matches!(
            ServerConfig::load(Some(file.path()), ConfigOverrides::default()),
            Err(TunnelError::Config(_))
        ));
    }
}
