//! # shardio-core
//!
//! Platform-agnostic types for the shardio readiness engine.
//!
//! Everything OS-specific (epoll, eventfd, sockets) lives in `shardio`.
//!
//! ## Modules
//!
//! - `buffer` - Size-classed pool of reusable read buffers
//! - `error` - Engine, connection and config errors; close reasons
//! - `addr` - Network kinds, bind addresses, peer addresses
//! - `id` - Connection identifier type
//! - `state` - Connection and engine lifecycle states
//! - `env` - Environment variable helpers

pub mod buffer;
pub mod error;
pub mod addr;
pub mod id;
pub mod state;
pub mod env;

// Re-exports for convenience
pub use buffer::{Buffer, BufferPool, PoolStats, SizeClass};
pub use error::{CloseReason, ConfigError, ConnError, EngineError, Result};
pub use addr::{Address, BindAddr, NetworkKind};
pub use id::ConnId;
pub use state::{ConnState, EngineState};
