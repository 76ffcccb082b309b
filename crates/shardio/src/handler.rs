//! Callback table.
//!
//! Built once by `EngineBuilder` and shared read-only by every worker.
//! Hooks run on worker threads; at most one hook runs at a time for any
//! given connection.

use shardio_core::{Buffer, BufferPool, CloseReason};

use crate::conn::Conn;

/// A new connection is registered. Fires before any `OnData` for it.
pub type OpenHook = Box<dyn Fn(&Conn) + Send + Sync>;
/// Fires exactly once per opened connection, after its socket is released.
pub type CloseHook = Box<dyn Fn(&Conn, &CloseReason) + Send + Sync>;
/// Bytes from one read (or one datagram). Valid only during the call.
pub type DataHook = Box<dyn Fn(&Conn, &[u8]) + Send + Sync>;
/// Supplies the buffer for the next read.
pub type AllocHook = Box<dyn Fn(&Conn) -> Buffer + Send + Sync>;
/// Takes the read buffer back after `OnData` (or after a failed read).
pub type FreeHook = Box<dyn Fn(&Conn, Buffer) + Send + Sync>;

pub struct Handlers {
    pub(crate) on_open: OpenHook,
    pub(crate) on_close: CloseHook,
    pub(crate) on_data: DataHook,
    pub(crate) alloc: AllocHook,
    pub(crate) free: FreeHook,
}

impl Handlers {
    /// No-op lifecycle hooks; read buffers from the global pool.
    pub(crate) fn with_defaults(read_buffer_size: usize) -> Self {
        Self {
            on_open: Box::new(|_| {}),
            on_close: Box::new(|_, _| {}),
            on_data: Box::new(|_, _| {}),
            alloc: Box::new(move |_| BufferPool::global().allocate(read_buffer_size)),
            free: Box::new(|_, buf| BufferPool::global().release(buf)),
        }
    }
}
