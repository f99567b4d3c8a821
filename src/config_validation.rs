//! Startup validation for relay configuration
//!
//! Errors stop the relay before it binds anything. Warnings and suggestions
//! are logged and startup continues.

use crate::config::RelayConfig;
use crate::error::RelayError;

/// Upper bound on worker tasks; each one holds an upstream connection open.
const MAX_NUM_THREADS: usize = 1024;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
            suggestions: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn add_suggestion(&mut self, suggestion: String) {
        self.suggestions.push(suggestion);
    }

    /// Logs warnings and suggestions, and folds errors into one `RelayError`.
    pub fn into_result(self) -> Result<(), RelayError> {
        for warning in &self.warnings {
            log::warn!("{}", warning);
        }
        for suggestion in &self.suggestions {
            log::info!("Suggestion: {}", suggestion);
        }

        if self.is_valid {
            Ok(())
        } else {
            Err(RelayError::Config(self.errors.join("; ")))
        }
    }
}

pub struct RelayConfigValidator<'a> {
    config: &'a RelayConfig,
}

impl<'a> RelayConfigValidator<'a> {
    pub fn new(config: &'a RelayConfig) -> Self {
        Self { config }
    }

    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::success();

        self.validate_addresses(&mut result);
        self.validate_workers(&mut result);
        self.validate_watchdog(&mut result);

        result
    }

    fn validate_addresses(&self, result: &mut ValidationResult) {
        let config = self.config;

        if config.remote_host().is_empty() {
            result.add_error("Remote host cannot be empty".to_string());
        }
        if config.port == 0 {
            result.add_error("Remote port 0 is reserved".to_string());
        }
        if config.local_host().is_empty() {
            result.add_error("Local address cannot be empty".to_string());
        }

        let local_port = config.local_port();
        if local_port != 0 && local_port < 1024 {
            result.add_warning(format!(
                "Using privileged port {} - may require elevated privileges",
                local_port
            ));
        }

        if is_loopback(config.remote_host())
            && is_loopback_or_any(config.local_host())
            && local_port == config.port
        {
            result.add_error(format!(
                "Relay would listen on its own upstream ({}:{})",
                config.remote_host(),
                config.port
            ));
        }
    }

    fn validate_workers(&self, result: &mut ValidationResult) {
        let config = self.config;

        if config.num_threads == 0 {
            result.add_error("num_threads must be at least 1".to_string());
        } else if config.num_threads > MAX_NUM_THREADS {
            result.add_error(format!("num_threads must not exceed {}", MAX_NUM_THREADS));
        }

        if config.buffer_size == 0 {
            result.add_error("buffer_size must be at least 1".to_string());
        } else if config.buffer_size == 1 {
            result.add_suggestion(
                "buffer_size of 1 relays byte by byte; raise it for bulk transfers".to_string(),
            );
        }

        if config.max_header_size < 256 {
            result.add_error("max_header_size must be at least 256 bytes".to_string());
        }
    }

    fn validate_watchdog(&self, result: &mut ValidationResult) {
        let config = self.config;

        if config.watchdog_enabled() && !config.sigkill_on_stream_stop {
            result.add_warning(format!(
                "Watchdog is not streaming-aware: the process will be killed every {} seconds regardless of traffic",
                config.sigkill_timeout
            ));
        }

        if config.sigkill_on_stream_stop && !config.watchdog_enabled() {
            result.add_warning(
                "sigkill_on_stream_stop has no effect while sigkill_timeout is 0".to_string(),
            );
        }

        if config.watchdog_enabled() && config.sigkill_timeout < 2 {
            result.add_warning(
                "A watchdog timeout under 2 seconds will kill slow but healthy streams".to_string(),
            );
        }
    }
}

fn is_loopback(host: &str) -> bool {
    host == "localhost" || host.parse::<std::net::IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

fn is_loopback_or_any(host: &str) -> bool {
    is_loopback(host)
        || host.parse::<std::net::IpAddr>().map(|ip| ip.is_unspecified()).unwrap_or(false)
}
