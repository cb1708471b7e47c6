// This module holds the runtime configuration of both ends of the remote-compilation link.
// ServerConfig covers the listening address, compilation thread count, memory budget used by
// the load monitor, the timed wait applied to out-of-sequence requests and the session purge
// cadence. ClientConfig names the server to connect to and embeds RetryConfig, which bounds
// the exponential back-off applied after a stream failure and the number of remote retries a
// single method gets. Values come from JITSERVER_* variables; parsing goes through a lookup
// closure so tests can supply values without touching the process environment.

//! Server, client and retry configuration.

use crate::core::error::ConfigError;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 38400;

/// Configuration of a JITServer process.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    /// Number of compilation threads; also the denominator of the thread-load state.
    pub compilation_threads: usize,
    /// Memory available to compilation arenas, in bytes.
    pub memory_budget: usize,
    /// How long an out-of-sequence request waits for its turn before forcing progress.
    pub sequencing_timeout: Duration,
    /// Sessions idle for longer than this are purged.
    pub session_old_age: Duration,
    /// Minimum time between two purge passes.
    pub purge_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            compilation_threads: 4,
            memory_budget: 256 * 1024 * 1024,
            sequencing_timeout: Duration::from_millis(1000),
            session_old_age: Duration::from_secs(1000 * 60),
            purge_interval: Duration::from_secs(30 * 60),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(address) = lookup("JITSERVER_ADDRESS") {
            config.address = address;
        }
        if let Some(port) = parse_var(&lookup, "JITSERVER_PORT")? {
            config.port = port;
        }
        if let Some(threads) = parse_var::<usize, _>(&lookup, "JITSERVER_THREADS")? {
            if threads == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "JITSERVER_THREADS",
                    value: threads.to_string(),
                });
            }
            config.compilation_threads = threads;
        }
        if let Some(mb) = parse_var::<usize, _>(&lookup, "JITSERVER_MEMORY_BUDGET_MB")? {
            config.memory_budget = mb * 1024 * 1024;
        }
        if let Some(ms) = parse_var(&lookup, "JITSERVER_SEQ_TIMEOUT_MS")? {
            config.sequencing_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var(&lookup, "JITSERVER_SESSION_OLD_AGE_SECS")? {
            config.session_old_age = Duration::from_secs(secs);
        }
        Ok(config)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_compilation_threads(mut self, threads: usize) -> Self {
        self.compilation_threads = threads.max(1);
        self
    }

    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn with_sequencing_timeout(mut self, timeout: Duration) -> Self {
        self.sequencing_timeout = timeout;
        self
    }

    pub fn with_session_old_age(mut self, age: Duration) -> Self {
        self.session_old_age = age;
        self
    }

    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }

    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Back-off and retry limits applied by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Remote attempts per method before the caller gives up on remote compilation.
    pub max_remote_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            max_remote_attempts: 2,
        }
    }
}

impl RetryConfig {
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(ms) = parse_var(&lookup, "JITSERVER_RETRY_MIN_MS")? {
            config.min_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "JITSERVER_RETRY_MAX_MS")? {
            config.max_backoff = Duration::from_millis(ms);
        }
        if config.max_backoff < config.min_backoff {
            return Err(ConfigError::InvalidValue {
                key: "JITSERVER_RETRY_MAX_MS",
                value: config.max_backoff.as_millis().to_string(),
            });
        }
        Ok(config)
    }

    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_backoff = min;
        self.max_backoff = max.max(min);
        self
    }

    pub fn with_max_remote_attempts(mut self, attempts: u32) -> Self {
        self.max_remote_attempts = attempts;
        self
    }
}

/// Configuration of a client VM's remote-compilation support.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub server_address: String,
    pub server_port: u16,
    /// Upper bound on compilation threads admission control may run.
    pub compilation_threads: usize,
    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: DEFAULT_PORT,
            compilation_threads: 4,
            retry: RetryConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self {
            retry: RetryConfig::from_lookup(&lookup)?,
            ..Self::default()
        };
        if let Some(address) = lookup("JITSERVER_ADDRESS") {
            config.server_address = address;
        }
        if let Some(port) = parse_var(&lookup, "JITSERVER_PORT")? {
            config.server_port = port;
        }
        if let Some(threads) = parse_var::<usize, _>(&lookup, "JITSERVER_CLIENT_THREADS")? {
            config.compilation_threads = threads.max(1);
        }
        Ok(config)
    }

    pub fn with_compilation_threads(mut self, threads: usize) -> Self {
        self.compilation_threads = threads.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.server_address, self.server_port)
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}
