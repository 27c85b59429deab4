use serde::Deserialize;
use std::convert::TryFrom;
use std::time::Duration;

/// Configuration for the HTTP server.
///
/// Both transports read the same configuration; fields that only apply to one
/// of them say so. It can be initialized from environment variables with the
/// "TRELLIS_" prefix or from a config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server host address. Defaults to the loopback address "127.0.0.1".
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port number. Defaults to 8080. Port 0 picks a free port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum number of worker threads for the blocking transport.
    /// Defaults to CPU count * 15.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Seconds an idle blocking worker waits for work before exiting. Defaults to 60.
    #[serde(default = "default_keep_alive_secs")]
    pub worker_keep_alive_secs: u64,
    /// Number of event loop threads for the evented transport.
    /// Defaults to CPU count * 2.
    #[serde(default = "default_event_loop_threads")]
    pub event_loop_threads: usize,
    /// Maximum size of a request (head and body). Defaults to 512kb (524,288 bytes).
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
    /// Seconds to wait for request bytes before dropping the connection.
    /// Defaults to 30; 0 disables the timeout.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Seconds a running evented server waits for in-flight requests when it
    /// is dropped. Defaults to 5.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

/// Implements conversion from the config crate's Config type to ServerConfig.
impl TryFrom<config::Config> for ServerConfig {
    type Error = config::ConfigError;

    fn try_from(config: config::Config) -> Result<Self, Self::Error> {
        config.try_deserialize()
    }
}

impl ServerConfig {
    /// Creates a new ServerConfig instance from environment variables and config file.
    ///
    /// This method will:
    /// 1. Load environment variables from a .env file if present
    /// 2. Load configuration from a "config" file (if it exists)
    /// 3. Override with environment variables prefixed with "TRELLIS_"
    ///
    /// # Errors
    /// Returns a ConfigError if configuration loading or parsing fails.
    pub fn new() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("TRELLIS"));

        builder.build()?.try_into()
    }

    /// Default configuration listening on `port`.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// The `host:port` string the listener binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Converts the worker_keep_alive_secs value into a Duration.
    pub fn worker_keep_alive(&self) -> Duration {
        Duration::from_secs(self.worker_keep_alive_secs)
    }

    /// The read timeout, or `None` when disabled.
    pub fn read_timeout(&self) -> Option<Duration> {
        match self.read_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Default value for max_workers. Returns CPU count * 15.
fn default_max_workers() -> usize {
    num_cpus::get() * 15
}

/// Default worker keep-alive duration in seconds.
fn default_keep_alive_secs() -> u64 {
    60
}

/// Default event loop size. Returns CPU count * 2.
fn default_event_loop_threads() -> usize {
    num_cpus::get() * 2
}

/// Default host address.
fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// Default port number.
fn default_port() -> u16 {
    8080
}

/// Default maximum request size (512kb).
fn default_max_request_bytes() -> usize {
    524_288
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_drain_timeout_secs() -> u64 {
    5
}

/// Provides default values for all configuration options.
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_workers: default_max_workers(),
            worker_keep_alive_secs: default_keep_alive_secs(),
            event_loop_threads: default_event_loop_threads(),
            max_request_bytes: default_max_request_bytes(),
            read_timeout_secs: default_read_timeout_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}
