use serde::Deserialize;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Public listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend process configuration
    #[serde(default)]
    pub backend: BackendConfig,

    /// Timeout and buffer settings
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e)
        })?;
        let config = toml::from_str(&contents).map_err(|e| {
            anyhow::anyhow!("Failed to parse config file {}: {}", path.display(), e)
        })?;
        Ok(config)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the public listener (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Public listen port (default: 5000)
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl ServerConfig {
    /// Resolve the configured bind address and port into a socket address
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", self.bind, e))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
        }
    }
}

/// Configuration for the single backend process fronted by the proxy
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Command to launch the backend (default: streamlit)
    #[serde(default = "default_backend_command")]
    pub command: String,

    /// Arguments passed before the generated server flags
    #[serde(default = "default_backend_args")]
    pub args: Vec<String>,

    /// Loopback port the backend listens on (default: 8501)
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// Working directory for the backend process
    pub working_dir: Option<String>,

    /// Extra environment variables for the backend process
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl BackendConfig {
    /// Loopback address the backend is expected to listen on
    pub fn loopback_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.port))
    }

    /// Flags appended to the configured command line so the backend binds
    /// the loopback port headlessly, with no interactive prompts.
    pub fn server_flags(&self) -> Vec<String> {
        vec![
            "--server.port".to_string(),
            self.port.to_string(),
            "--server.address".to_string(),
            "127.0.0.1".to_string(),
            "--server.headless".to_string(),
            "true".to_string(),
            "--server.enableCORS".to_string(),
            "false".to_string(),
            "--server.enableXsrfProtection".to_string(),
            "false".to_string(),
        ]
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: default_backend_command(),
            args: default_backend_args(),
            port: default_backend_port(),
            working_dir: None,
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutConfig {
    /// Timeout in seconds for reading the request line and headers (default: 10)
    #[serde(default = "default_header_read_secs")]
    pub header_read_secs: u64,

    /// Timeout in seconds for connecting to the backend (default: 5)
    #[serde(default = "default_upstream_connect_secs")]
    pub upstream_connect_secs: u64,

    /// Interval in seconds between readiness probe attempts (default: 1)
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    /// Chunk size in bytes for the relay copy loops (default: 65536)
    #[serde(default = "default_relay_chunk_bytes")]
    pub relay_chunk_bytes: usize,
}

impl TimeoutConfig {
    pub fn header_read(&self) -> Duration {
        Duration::from_secs(self.header_read_secs)
    }

    pub fn upstream_connect(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            header_read_secs: default_header_read_secs(),
            upstream_connect_secs: default_upstream_connect_secs(),
            probe_interval_secs: default_probe_interval_secs(),
            relay_chunk_bytes: default_relay_chunk_bytes(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    5000
}

fn default_backend_command() -> String {
    "streamlit".to_string()
}

fn default_backend_args() -> Vec<String> {
    vec!["run".to_string(), "app.py".to_string()]
}

fn default_backend_port() -> u16 {
    8501
}

fn default_header_read_secs() -> u64 {
    10
}

fn default_upstream_connect_secs() -> u64 {
    5
}

fn default_probe_interval_secs() -> u64 {
    1
}

fn default_relay_chunk_bytes() -> usize {
    65536
}
