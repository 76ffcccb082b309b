//! Library defaults for `EngineConfig`.
//!
//! Overridden at runtime by `SHARDIO_*` environment variables, see
//! [`EngineConfig::from_env`](super::EngineConfig::from_env).

use shardio_core::NetworkKind;

pub const NETWORK: NetworkKind = NetworkKind::Stream;
pub const ADDRS: &[&str] = &[":9000"];

/// Used when hardware parallelism cannot be queried
pub const FALLBACK_WORKERS: usize = 4;
pub const MAX_WORKERS: usize = 256;

pub const ONESHOT: bool = true;
pub const EDGE_TRIGGERED: bool = true;

pub const SHUTDOWN_MS: u64 = 5000;
pub const POLL_MS: u64 = 100;
pub const MAX_POLL_MS: u64 = 60_000;

/// How long `shutdown` waits for workers to exit after forcing them; a
/// worker still inside a hook after that is detached
pub const FORCE_GRACE_MS: u64 = 250;

pub const MAX_EVENTS: usize = 1024;
pub const READ_BUFFER_SIZE: usize = 4096;
pub const MAX_READS_PER_EVENT: usize = 16;
pub const WRITE_BUFFER_LIMIT: usize = 8 * 1024 * 1024;

pub const DRAIN_ON_CLOSE: bool = true;

/// 0 disables the datagram idle sweep
pub const DGRAM_IDLE_MS: u64 = 0;

pub const TCP_NODELAY: bool = true;
pub const LISTEN_BACKLOG: i32 = 1024;

pub fn num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_WORKERS)
        .min(MAX_WORKERS)
}
