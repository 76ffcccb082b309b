//! `Conn`, the application's handle to one connection.
//!
//! ```text
//!   any thread                         owning worker
//!   ──────────                         ─────────────
//!   write() ──lock io──▶ socket        read / flush ──lock io──▶ socket
//!      │ would block: queue + Flush ─────▶ arm EPOLLOUT
//!   close() ── Open→Closing + Close ─────▶ drain queue, then finalize
//!                                          finalize: lock io, take socket, drop (close fd)
//! ```
//!
//! The socket lives inside the I/O mutex and only the owning worker ever
//! takes it out, so a write from a foreign thread either sees the live
//! socket or sees `None`, never a recycled descriptor.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::trace;
use shardio_core::{Address, CloseReason, ConnError, ConnId, ConnState};

use crate::poller::Token;
use crate::socket::Stream;
use crate::worker::{current_worker, Command, Mailbox};

/// Application state attached to a connection
pub type Context = Arc<dyn Any + Send + Sync>;

pub(crate) enum Transport {
    Stream(Stream),
    /// Shares the bound socket with every session on it
    Datagram { socket: Arc<UdpSocket>, peer: SocketAddr },
}

/// Everything guarded by the I/O lock.
pub(crate) struct Io {
    /// `None` once the worker has closed the connection
    pub transport: Option<Transport>,
    pub out: Vec<u8>,
    pub out_pos: usize,
    pub reason: Option<CloseReason>,
}

impl Io {
    #[inline]
    pub fn queued(&self) -> usize {
        self.out.len() - self.out_pos
    }

    fn enqueue(&mut self, data: &[u8]) {
        // Compact before growing once more than half is already sent.
        if self.out_pos > 0 && self.out_pos * 2 >= self.out.len() {
            self.out.drain(..self.out_pos);
            self.out_pos = 0;
        }
        self.out.extend_from_slice(data);
    }

    /// Write queued bytes until done or the socket would block.
    /// `Ok(true)` when the queue is empty.
    pub fn flush(&mut self) -> io::Result<bool> {
        let stream = match &self.transport {
            Some(Transport::Stream(s)) => s,
            _ => return Ok(true),
        };
        while self.out_pos < self.out.len() {
            match stream.write(&self.out[self.out_pos..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.out_pos += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        self.out.clear();
        self.out_pos = 0;
        Ok(true)
    }
}

pub(crate) struct ConnInner {
    id: ConnId,
    token: Token,
    worker: usize,
    local: Address,
    remote: Address,
    datagram: bool,
    state: AtomicU8,
    busy: AtomicBool,
    io: Mutex<Io>,
    mailbox: Arc<Mailbox>,
    write_limit: usize,
    context: Mutex<Option<Context>>,
}

/// Handle to a connection. Cheap to clone, usable from any thread.
///
/// Equality and hashing are by identity.
#[derive(Clone)]
pub struct Conn {
    inner: Arc<ConnInner>,
}

impl Conn {
    pub(crate) fn new(
        token: Token,
        worker: usize,
        transport: Transport,
        local: Address,
        remote: Address,
        mailbox: Arc<Mailbox>,
        write_limit: usize,
    ) -> Self {
        let datagram = matches!(transport, Transport::Datagram { .. });
        Self {
            inner: Arc::new(ConnInner {
                id: ConnId::next(),
                token,
                worker,
                local,
                remote,
                datagram,
                state: AtomicU8::new(ConnState::Open as u8),
                busy: AtomicBool::new(false),
                io: Mutex::new(Io {
                    transport: Some(transport),
                    out: Vec::new(),
                    out_pos: 0,
                    reason: None,
                }),
                mailbox,
                write_limit,
                context: Mutex::new(None),
            }),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    #[inline]
    pub fn id(&self) -> ConnId {
        self.inner.id
    }

    /// Peer address. Unix-domain peers are usually unnamed.
    pub fn remote_addr(&self) -> &Address {
        &self.inner.remote
    }

    /// The bound address this connection arrived on.
    pub fn local_addr(&self) -> &Address {
        &self.inner.local
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        ConnState::from(self.inner.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.state() == ConnState::Open
    }

    /// Whether this is a per-peer session on a datagram socket.
    #[inline]
    pub fn is_datagram(&self) -> bool {
        self.inner.datagram
    }

    /// Index of the worker that owns this connection.
    #[inline]
    pub fn worker(&self) -> usize {
        self.inner.worker
    }

    /// Bytes accepted by `write()` but not yet on the wire.
    pub fn queued(&self) -> usize {
        self.lock_io().queued()
    }

    pub fn set_context(&self, ctx: Context) {
        *self.inner.context.lock().unwrap_or_else(PoisonError::into_inner) = Some(ctx);
    }

    pub fn context(&self) -> Option<Context> {
        self.inner.context.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// The context downcast to `T`, if set and of that type.
    pub fn context_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.context().and_then(|ctx| ctx.downcast::<T>().ok())
    }

    // ── Write / close ───────────────────────────────────────────────

    /// Send `data`, queuing whatever the socket does not take right now.
    ///
    /// Returns `data.len()` once every byte is written or queued; ordering
    /// of successive writes is preserved. A single payload is always
    /// accepted when nothing is queued; `BufferFull` is returned only when
    /// appending to an existing backlog would cross the write limit.
    ///
    /// Datagram connections send exactly one datagram per call and never
    /// queue.
    pub fn write(&self, data: &[u8]) -> Result<usize, ConnError> {
        if !self.state().is_writable() {
            return Err(ConnError::ConnectionClosed);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let mut io = self.lock_io();
        // Re-check under the lock: the worker may have closed meanwhile.
        if !self.state().is_writable() {
            return Err(ConnError::ConnectionClosed);
        }

        let stream = match &io.transport {
            None => return Err(ConnError::ConnectionClosed),
            Some(Transport::Datagram { socket, peer }) => {
                return socket.send_to(data, *peer).map_err(ConnError::Write);
            }
            Some(Transport::Stream(s)) => s,
        };

        let queued = io.queued();
        if queued > 0 {
            if queued + data.len() > self.inner.write_limit {
                return Err(ConnError::BufferFull { queued, limit: self.inner.write_limit });
            }
            io.enqueue(data);
            return Ok(data.len());
        }

        let mut written = 0;
        while written < data.len() {
            match stream.write(&data[written..]) {
                Ok(0) => {
                    drop(io);
                    return Err(self.fail_write(io::ErrorKind::WriteZero.into()));
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    drop(io);
                    return Err(self.fail_write(e));
                }
            }
        }

        if written < data.len() {
            io.enqueue(&data[written..]);
            trace!("{} queued {} bytes", self.id(), data.len() - written);
            drop(io);
            // Inside this connection's own dispatch the worker re-arms
            // afterwards anyway.
            if !self.is_dispatching_here() {
                self.inner.mailbox.post(Command::Flush(self.clone()));
            }
        }
        Ok(data.len())
    }

    /// Begin closing. Queued writes are flushed first when the engine is
    /// configured to drain on close.
    pub fn close(&self) -> Result<(), ConnError> {
        if self.begin_close(CloseReason::Local) {
            Ok(())
        } else {
            Err(ConnError::AlreadyClosed)
        }
    }

    fn fail_write(&self, err: io::Error) -> ConnError {
        self.begin_close(CloseReason::io(clone_io_error(&err)));
        ConnError::Write(err)
    }

    // ── Worker side ─────────────────────────────────────────────────

    #[inline]
    pub(crate) fn token(&self) -> Token {
        self.inner.token
    }

    #[inline]
    pub(crate) fn ptr_eq(&self, other: &Conn) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn lock_io(&self) -> MutexGuard<'_, Io> {
        self.inner.io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `Open → Closing` and hand the close to the owning worker.
    /// False when the connection was already closing or closed.
    pub(crate) fn begin_close(&self, reason: CloseReason) -> bool {
        if !self.mark_closing(reason) {
            return false;
        }
        self.inner.mailbox.post(Command::Close(self.clone()));
        true
    }

    /// `Open → Closing` without notifying anyone; for the worker itself.
    ///
    /// State and reason change together under the I/O lock, so a worker
    /// that sees `Closing` also sees why.
    pub(crate) fn mark_closing(&self, reason: CloseReason) -> bool {
        let mut io = self.lock_io();
        let swapped = self
            .inner
            .state
            .compare_exchange(
                ConnState::Open as u8,
                ConnState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if swapped {
            io.reason = Some(reason);
        }
        swapped
    }

    /// Reason recorded by `begin_close`, if any.
    pub(crate) fn pending_reason(&self) -> Option<CloseReason> {
        self.lock_io().reason.clone()
    }

    /// Mark closed and take the socket out. The caller drops it.
    pub(crate) fn finish(&self) -> Option<Transport> {
        let mut io = self.lock_io();
        self.inner.state.store(ConnState::Closed as u8, Ordering::Release);
        io.out = Vec::new();
        io.out_pos = 0;
        io.transport.take()
    }

    pub(crate) fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.lock_io().transport {
            Some(Transport::Stream(s)) => s.read(buf),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Mark this connection as being dispatched by its worker.
    pub(crate) fn enter(&self) -> BusyGuard<'_> {
        let was = self.inner.busy.swap(true, Ordering::AcqRel);
        debug_assert!(!was, "{} dispatched twice concurrently", self.id());
        BusyGuard(&self.inner.busy)
    }

    fn is_dispatching_here(&self) -> bool {
        current_worker() == Some(self.inner.worker) && self.inner.busy.load(Ordering::Acquire)
    }
}

pub(crate) struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl PartialEq for Conn {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Conn {}

impl Hash for Conn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .field("state", &self.state())
            .field("worker", &self.inner.worker)
            .finish()
    }
}

fn clone_io_error(err: &io::Error) -> io::Error {
    match err.raw_os_error() {
        Some(code) => io::Error::from_raw_os_error(code),
        None => io::Error::new(err.kind(), err.to_string()),
    }
}
