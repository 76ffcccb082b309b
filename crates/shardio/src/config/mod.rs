//! Engine configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder methods (programmatic)
//! 2. Environment variables (`from_env()` only)
//! 3. Library defaults (`defaults` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use shardio::config::EngineConfig;
//!
//! // Defaults with env overrides
//! let config = EngineConfig::from_env();
//!
//! // Or customize programmatically
//! let config = EngineConfig::new()
//!     .network(NetworkKind::Datagram)
//!     .addrs(["127.0.0.1:5353"])
//!     .num_workers(2);
//! ```

pub mod defaults;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use shardio_core::env::{env_get, env_get_bool, env_get_list, env_get_millis, env_get_opt};
use shardio_core::{BindAddr, ConfigError, NetworkKind};

/// What happens to queued writes when the shutdown deadline force-closes a
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForcedWritePolicy {
    /// Discard queued bytes.
    Drop,
    /// One non-blocking flush attempt, then discard whatever is left.
    #[default]
    BestEffort,
}

impl FromStr for ForcedWritePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "drop" | "discard" => Ok(ForcedWritePolicy::Drop),
            "best-effort" | "besteffort" | "flush" => Ok(ForcedWritePolicy::BestEffort),
            _ => Err(ConfigError::InvalidValue(
                "forced_write_policy must be drop or best-effort",
            )),
        }
    }
}

impl fmt::Display for ForcedWritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForcedWritePolicy::Drop => write!(f, "drop"),
            ForcedWritePolicy::BestEffort => write!(f, "best-effort"),
        }
    }
}

/// Engine configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Transport for every address
    pub network: NetworkKind,
    /// Addresses to bind (`":port"`, `ip:port`, `host:port`, or a path for unix)
    pub addrs: Vec<String>,
    /// Number of worker threads, each with its own epoll instance
    pub num_workers: usize,
    /// Register with `EPOLLONESHOT` and re-arm after every dispatch
    pub oneshot: bool,
    /// Register with `EPOLLET`
    pub edge_triggered: bool,
    /// Default deadline for graceful shutdown
    pub shutdown_deadline: Duration,
    /// Upper bound on a single `epoll_wait`
    pub poll_interval: Duration,
    /// Events fetched per `epoll_wait`
    pub max_events: usize,
    /// Size hint for the default read buffer hook
    pub read_buffer_size: usize,
    /// Reads per readiness event before yielding to other connections
    pub max_reads_per_event: usize,
    /// Bytes a connection may have queued before `write()` fails
    pub write_buffer_limit: usize,
    /// Flush queued writes before closing on `close()`
    pub drain_on_close: bool,
    /// Queued writes at the shutdown deadline
    pub forced_write_policy: ForcedWritePolicy,
    /// Close datagram sessions after this much silence
    pub datagram_idle_timeout: Option<Duration>,
    /// Set `TCP_NODELAY` on accepted TCP sockets
    pub tcp_nodelay: bool,
    /// `listen()` backlog for TCP listeners
    pub listen_backlog: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl EngineConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `SHARDIO_NETWORK` - tcp, udp or unix
    /// - `SHARDIO_ADDRS` - Comma-separated bind addresses
    /// - `SHARDIO_WORKERS` - Number of worker threads
    /// - `SHARDIO_ONESHOT` - One-shot registration (0/1)
    /// - `SHARDIO_EDGE_TRIGGERED` - Edge-triggered registration (0/1)
    /// - `SHARDIO_SHUTDOWN_MS` - Shutdown deadline in milliseconds
    /// - `SHARDIO_POLL_MS` - Poll interval in milliseconds
    /// - `SHARDIO_MAX_EVENTS` - Events per wait
    /// - `SHARDIO_READ_BUFFER` - Read buffer size hint
    /// - `SHARDIO_MAX_READS` - Reads per readiness event
    /// - `SHARDIO_WRITE_LIMIT` - Per-connection queued write limit in bytes
    /// - `SHARDIO_DRAIN_ON_CLOSE` - Flush queued writes on close (0/1)
    /// - `SHARDIO_FORCED_WRITES` - drop or best-effort
    /// - `SHARDIO_DGRAM_IDLE_MS` - Datagram idle timeout, 0 = none
    /// - `SHARDIO_TCP_NODELAY` - TCP_NODELAY on accepted sockets (0/1)
    /// - `SHARDIO_BACKLOG` - Listen backlog
    ///
    /// Unparsable values fall back to the default.
    pub fn from_env() -> Self {
        let idle_ms = env_get("SHARDIO_DGRAM_IDLE_MS", defaults::DGRAM_IDLE_MS);

        Self {
            network: env_get("SHARDIO_NETWORK", defaults::NETWORK),
            addrs: env_get_list("SHARDIO_ADDRS", defaults::ADDRS),
            num_workers: env_get("SHARDIO_WORKERS", defaults::num_workers()),
            oneshot: env_get_bool("SHARDIO_ONESHOT", defaults::ONESHOT),
            edge_triggered: env_get_bool("SHARDIO_EDGE_TRIGGERED", defaults::EDGE_TRIGGERED),
            shutdown_deadline: env_get_millis("SHARDIO_SHUTDOWN_MS", defaults::SHUTDOWN_MS),
            poll_interval: env_get_millis("SHARDIO_POLL_MS", defaults::POLL_MS),
            max_events: env_get("SHARDIO_MAX_EVENTS", defaults::MAX_EVENTS),
            read_buffer_size: env_get("SHARDIO_READ_BUFFER", defaults::READ_BUFFER_SIZE),
            max_reads_per_event: env_get("SHARDIO_MAX_READS", defaults::MAX_READS_PER_EVENT),
            write_buffer_limit: env_get("SHARDIO_WRITE_LIMIT", defaults::WRITE_BUFFER_LIMIT),
            drain_on_close: env_get_bool("SHARDIO_DRAIN_ON_CLOSE", defaults::DRAIN_ON_CLOSE),
            forced_write_policy: env_get_opt("SHARDIO_FORCED_WRITES").unwrap_or_default(),
            datagram_idle_timeout: millis_opt(idle_ms),
            tcp_nodelay: env_get_bool("SHARDIO_TCP_NODELAY", defaults::TCP_NODELAY),
            listen_backlog: env_get("SHARDIO_BACKLOG", defaults::LISTEN_BACKLOG),
        }
    }

    /// Create config with library defaults (no env override).
    /// Useful for tests and embedding.
    pub fn new() -> Self {
        Self {
            network: defaults::NETWORK,
            addrs: defaults::ADDRS.iter().map(|s| s.to_string()).collect(),
            num_workers: defaults::num_workers(),
            oneshot: defaults::ONESHOT,
            edge_triggered: defaults::EDGE_TRIGGERED,
            shutdown_deadline: Duration::from_millis(defaults::SHUTDOWN_MS),
            poll_interval: Duration::from_millis(defaults::POLL_MS),
            max_events: defaults::MAX_EVENTS,
            read_buffer_size: defaults::READ_BUFFER_SIZE,
            max_reads_per_event: defaults::MAX_READS_PER_EVENT,
            write_buffer_limit: defaults::WRITE_BUFFER_LIMIT,
            drain_on_close: defaults::DRAIN_ON_CLOSE,
            forced_write_policy: ForcedWritePolicy::default(),
            datagram_idle_timeout: millis_opt(defaults::DGRAM_IDLE_MS),
            tcp_nodelay: defaults::TCP_NODELAY,
            listen_backlog: defaults::LISTEN_BACKLOG,
        }
    }

    // Builder methods

    pub fn network(mut self, network: NetworkKind) -> Self {
        self.network = network;
        self
    }

    pub fn addrs<I, S>(mut self, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addrs = addrs.into_iter().map(Into::into).collect();
        self
    }

    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addrs.push(addr.into());
        self
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn oneshot(mut self, enable: bool) -> Self {
        self.oneshot = enable;
        self
    }

    pub fn edge_triggered(mut self, enable: bool) -> Self {
        self.edge_triggered = enable;
        self
    }

    pub fn shutdown_deadline(mut self, d: Duration) -> Self {
        self.shutdown_deadline = d;
        self
    }

    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn max_reads_per_event(mut self, n: usize) -> Self {
        self.max_reads_per_event = n;
        self
    }

    pub fn write_buffer_limit(mut self, bytes: usize) -> Self {
        self.write_buffer_limit = bytes;
        self
    }

    pub fn drain_on_close(mut self, enable: bool) -> Self {
        self.drain_on_close = enable;
        self
    }

    pub fn forced_write_policy(mut self, policy: ForcedWritePolicy) -> Self {
        self.forced_write_policy = policy;
        self
    }

    pub fn datagram_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.datagram_idle_timeout = timeout.filter(|d| !d.is_zero());
        self
    }

    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.tcp_nodelay = enable;
        self
    }

    pub fn listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue("num_workers must be > 0"));
        }
        if self.num_workers > defaults::MAX_WORKERS {
            return Err(ConfigError::InvalidValue("num_workers must be <= 256"));
        }
        if self.addrs.is_empty() {
            return Err(ConfigError::InvalidValue("at least one address is required"));
        }
        if self.max_events == 0 {
            return Err(ConfigError::InvalidValue("max_events must be > 0"));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::InvalidValue("read_buffer_size must be > 0"));
        }
        if self.max_reads_per_event == 0 {
            return Err(ConfigError::InvalidValue("max_reads_per_event must be > 0"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue("poll_interval must be > 0"));
        }
        if self.poll_interval > Duration::from_millis(defaults::MAX_POLL_MS) {
            return Err(ConfigError::InvalidValue("poll_interval must be <= 60s"));
        }
        Ok(())
    }

    /// Resolve every configured address for the configured network.
    pub fn bind_addrs(&self) -> Result<Vec<BindAddr>, ConfigError> {
        self.addrs
            .iter()
            .map(|a| BindAddr::parse(self.network, a))
            .collect()
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("shardio configuration:");
        eprintln!("  network:                {}", self.network);
        eprintln!("  addrs:                  {}", self.addrs.join(","));
        eprintln!("  num_workers:            {}", self.num_workers);
        eprintln!("  oneshot:                {}", self.oneshot);
        eprintln!("  edge_triggered:         {}", self.edge_triggered);
        eprintln!("  shutdown_deadline:      {:?}", self.shutdown_deadline);
        eprintln!("  poll_interval:          {:?}", self.poll_interval);
        eprintln!("  max_events:             {}", self.max_events);
        eprintln!("  read_buffer_size:       {}", self.read_buffer_size);
        eprintln!("  max_reads_per_event:    {}", self.max_reads_per_event);
        eprintln!("  write_buffer_limit:     {}", self.write_buffer_limit);
        eprintln!("  drain_on_close:         {}", self.drain_on_close);
        eprintln!("  forced_write_policy:    {}", self.forced_write_policy);
        eprintln!("  datagram_idle_timeout:  {:?}", self.datagram_idle_timeout);
        eprintln!("  tcp_nodelay:            {}", self.tcp_nodelay);
        eprintln!("  listen_backlog:         {}", self.listen_backlog);
    }
}

fn millis_opt(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}
