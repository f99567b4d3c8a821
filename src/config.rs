use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub format: Option<LogFormat>,
}

fn default_local_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_num_threads() -> usize {
    8
}

fn default_buffer_size() -> usize {
    1
}

fn default_max_header_size() -> usize {
    16 * 1024
}

/// Relay settings. Built once at startup and shared read-only by every
/// worker and the watchdog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Upstream host. IPv6 literals may be bracketed (`[::1]`).
    pub host: String,
    pub port: u16,
    /// Listening port; falls back to `port` when unset.
    #[serde(default)]
    pub local_port: Option<u16>,
    #[serde(default = "default_local_addr")]
    pub local_addr: String,
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
    /// Upper bound on a single upstream read while streaming the body.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Watchdog deadline in seconds; 0 disables the watchdog.
    #[serde(default)]
    pub sigkill_timeout: u64,
    #[serde(default)]
    pub sigkill_on_stream_stop: bool,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl RelayConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            local_port: None,
            local_addr: default_local_addr(),
            num_threads: default_num_threads(),
            buffer_size: default_buffer_size(),
            sigkill_timeout: 0,
            sigkill_on_stream_stop: false,
            max_header_size: default_max_header_size(),
            logging: None,
        }
    }

    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn local_port(&self) -> u16 {
        self.local_port.unwrap_or(self.port)
    }

    /// Upstream host with IPv6 brackets removed, suitable for socket APIs.
    pub fn remote_host(&self) -> &str {
        strip_brackets(&self.host)
    }

    pub fn local_host(&self) -> &str {
        strip_brackets(&self.local_addr)
    }

    /// `host:port` as it belongs in a `Host` header.
    pub fn remote_authority(&self) -> String {
        let host = self.remote_host();
        if host.contains(':') {
            format!("[{}]:{}", host, self.port)
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    pub fn watchdog_enabled(&self) -> bool {
        self.sigkill_timeout > 0
    }
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}
