//! # shardio
//!
//! Readiness-driven connection engine for Linux.
//!
//! ```text
//!                       ┌──────────────────────────────────┐
//!   listeners ─accept─▶ │ shardio-acceptor (round-robin)   │
//!                       └──────┬───────────┬───────────────┘
//!                        Adopt │           │ Adopt
//!                   ┌──────────▼──┐   ┌────▼────────┐
//!                   │ worker 0    │   │ worker N    │   each: own epoll,
//!                   │ epoll+slab  │...│ epoll+slab  │   own connections,
//!                   └─────────────┘   └─────────────┘   own datagram sockets
//!                         │ OnOpen / OnData / OnClose
//!                         ▼
//!                     application
//! ```
//!
//! This crate provides:
//! - `Engine` / `EngineBuilder` - lifecycle and hook registration
//! - `Conn` - thread-safe connection handle (`write`, `close`, context)
//! - `EngineConfig` - builder config with `SHARDIO_*` env overrides
//!
//! # Example
//!
//! ```rust,ignore
//! use shardio::{Engine, EngineConfig};
//!
//! let engine = Engine::builder(EngineConfig::from_env())
//!     .on_data(|conn, data| {
//!         let _ = conn.write(data);
//!     })
//!     .build();
//! engine.start()?;
//! engine.shutdown(std::time::Duration::from_secs(5))?;
//! ```

// Platform detection
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod acceptor;
        mod conn;
        mod engine;
        mod handler;
        mod notifier;
        mod poller;
        mod shutdown;
        mod slab;
        mod socket;
        mod worker;

        pub mod config;

        pub use config::{EngineConfig, ForcedWritePolicy};
        pub use conn::{Conn, Context};
        pub use engine::{Engine, EngineBuilder};
        pub use handler::{AllocHook, CloseHook, DataHook, FreeHook, OpenHook};
        pub use worker::current_worker;
    } else {
        compile_error!("shardio requires Linux (epoll, eventfd)");
    }
}

pub use shardio_core::{
    buffer, Address, BindAddr, Buffer, BufferPool, CloseReason, ConfigError, ConnError, ConnId,
    ConnState, EngineError, EngineState, NetworkKind, PoolStats, Result, SizeClass,
};
