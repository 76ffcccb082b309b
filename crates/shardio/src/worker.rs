//! Worker thread, one reactor shard.
//!
//! Each worker is an OS thread with its own epoll instance, a slab of the
//! connections it owns, and a command inbox other threads post to.
//!
//! ```text
//!   acceptor ──Adopt──┐                       ┌──────────── worker N ─────────────┐
//!   Conn::write ─Flush┼─▶ SegQueue + eventfd ─┼▶ epoll_wait(poll_interval)        │
//!   Conn::close ─Close┤                       │   ├ conn ready  → read / flush    │
//!   engine ─Drain/Force                       │   ├ dgram ready → recv_from       │
//!                                             │   └ eventfd     → (wake only)     │
//!                                             │  run commands, sweep idle, loop   │
//!                                             └───────────────────────────────────┘
//! ```
//!
//! Only this thread registers, re-arms, deregisters or closes the sockets
//! it owns. Every dispatch for a connection runs under its `busy` flag, so
//! at most one hook is active per connection at any time.

use std::cell::Cell;
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_queue::SegQueue;
use log::{debug, error, info, trace, warn};
use nix::sys::epoll::EpollEvent;
use shardio_core::{Address, Buffer, BufferPool, CloseReason};

use crate::config::{EngineConfig, ForcedWritePolicy};
use crate::conn::{Conn, Transport};
use crate::handler::Handlers;
use crate::notifier::Notifier;
use crate::poller::{decode, event_buffer, Interest, Mode, Poller, Readiness, Token, WAKE_TOKEN};
use crate::shutdown::Latch;
use crate::slab::Slab;
use crate::socket::{peek_datagram_len, Stream};

/// Tokens with this bit set name a datagram socket, not a connection.
const DGRAM_BIT: Token = 1 << 62;

// ── Current worker ──────────────────────────────────────────────────

thread_local! {
    static CURRENT_WORKER: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Index of the worker running on this thread, if any.
#[inline]
pub fn current_worker() -> Option<usize> {
    CURRENT_WORKER.with(|c| c.get())
}

// ── Commands ────────────────────────────────────────────────────────

pub(crate) enum Command {
    /// Register a freshly accepted stream
    Adopt { stream: Stream, peer: Address },
    /// Close after `Conn::close()` or a failed write
    Close(Conn),
    /// Writes were queued from outside a dispatch; arm writable interest
    Flush(Conn),
    /// Stop reading, close idle connections, let queued writes finish
    Drain,
    /// Close everything now and exit
    Force,
}

/// A worker's inbox: lock-free queue plus the eventfd that wakes it.
pub(crate) struct Mailbox {
    queue: SegQueue<Command>,
    notifier: Notifier,
    /// Set as soon as `Force` is posted, before the worker reaches it
    forced: AtomicBool,
}

impl Mailbox {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            queue: SegQueue::new(),
            notifier: Notifier::new()?,
            forced: AtomicBool::new(false),
        })
    }

    pub fn post(&self, cmd: Command) {
        if matches!(cmd, Command::Force) {
            self.forced.store(true, Ordering::Release);
        }
        self.queue.push(cmd);
        if let Err(e) = self.notifier.notify() {
            error!("worker wakeup failed: {}", e);
        }
    }

    #[inline]
    pub fn pop(&self) -> Option<Command> {
        self.queue.pop()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::Acquire)
    }
}

// ── Per-connection bookkeeping ──────────────────────────────────────

struct Entry {
    conn: Conn,
    /// Stream fd while registered; the socket itself lives in the conn
    fd: Option<RawFd>,
    armed: Interest,
    /// Datagram session: owning socket index and peer
    dgram: Option<(usize, SocketAddr)>,
    last_active: Instant,
}

/// A bound datagram socket owned by this worker.
struct Port {
    socket: Arc<UdpSocket>,
    local: Address,
    sessions: HashMap<SocketAddr, usize>,
    reading: bool,
}

/// Released at thread exit, even on unwind.
struct ExitGuard(Arc<Latch>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        CURRENT_WORKER.with(|c| c.set(None));
        self.0.count_down();
    }
}

// ── Worker ──────────────────────────────────────────────────────────

pub(crate) struct Worker {
    index: usize,
    poller: Poller,
    mailbox: Arc<Mailbox>,
    handlers: Arc<Handlers>,
    config: Arc<EngineConfig>,
    slab: Slab<Entry>,
    ports: Vec<Port>,
    events: Vec<EpollEvent>,
    open: Arc<AtomicUsize>,
    latch: Arc<Latch>,
    draining: bool,
    last_sweep: Instant,
}

impl Worker {
    /// Create the epoll instance and inbox and register `sockets` (bound
    /// datagram sockets assigned to this worker). Nothing runs yet.
    pub fn new(
        index: usize,
        config: Arc<EngineConfig>,
        handlers: Arc<Handlers>,
        open: Arc<AtomicUsize>,
        latch: Arc<Latch>,
        sockets: Vec<(UdpSocket, Address)>,
    ) -> io::Result<Self> {
        let poller = Poller::new(Mode {
            oneshot: config.oneshot,
            edge: config.edge_triggered,
        })?;
        let mailbox = Arc::new(Mailbox::new()?);
        poller.register_level(&mailbox.notifier, WAKE_TOKEN)?;

        let mut ports = Vec::with_capacity(sockets.len());
        for (i, (socket, local)) in sockets.into_iter().enumerate() {
            poller.register(&socket, DGRAM_BIT | i as Token, Interest::READ)?;
            ports.push(Port {
                socket: Arc::new(socket),
                local,
                sessions: HashMap::new(),
                reading: true,
            });
        }

        Ok(Self {
            index,
            poller,
            mailbox,
            handlers,
            events: event_buffer(config.max_events),
            config,
            slab: Slab::new(),
            ports,
            open,
            latch,
            draining: false,
            last_sweep: Instant::now(),
        })
    }

    pub fn mailbox(&self) -> Arc<Mailbox> {
        self.mailbox.clone()
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("shardio-worker-{}", self.index))
            .spawn(move || self.run())
    }

    fn run(mut self) {
        let _exit = ExitGuard(self.latch.clone());
        CURRENT_WORKER.with(|c| c.set(Some(self.index)));
        debug!("worker {} started ({} datagram sockets)", self.index, self.ports.len());

        let interval = self.config.poll_interval;
        loop {
            let n = match self.poller.wait(&mut self.events, interval) {
                Ok(n) => n,
                Err(e) => {
                    error!("worker {} epoll_wait: {}", self.index, e);
                    thread::sleep(interval);
                    0
                }
            };

            for i in 0..n {
                if self.mailbox.is_forced() {
                    break;
                }
                let (token, ready) = decode(&self.events[i]);
                if token == WAKE_TOKEN {
                    self.mailbox.notifier.drain();
                } else if token & DGRAM_BIT != 0 {
                    self.on_datagram_ready((token & !DGRAM_BIT) as usize);
                } else {
                    self.on_stream_ready(token as usize, ready);
                }
            }

            if !self.run_commands() {
                break;
            }
            self.sweep_idle();

            if self.draining && self.slab.is_empty() {
                break;
            }
        }

        self.teardown();
        debug!("worker {} stopped", self.index);
    }

    /// Execute queued commands. False once the worker must exit.
    fn run_commands(&mut self) -> bool {
        while let Some(cmd) = self.mailbox.pop() {
            match cmd {
                Command::Adopt { stream, peer } => self.adopt(stream, peer),
                Command::Close(conn) => {
                    if let Some(key) = self.lookup(&conn) {
                        self.settle(key, false, false);
                    }
                }
                Command::Flush(conn) => {
                    if let Some(key) = self.lookup(&conn) {
                        self.settle(key, false, false);
                    }
                }
                // The deadline already passed: no graceful close.
                Command::Drain if self.mailbox.is_forced() => {
                    self.force_close();
                    return false;
                }
                Command::Drain => self.begin_drain(),
                Command::Force => {
                    self.force_close();
                    return false;
                }
            }
        }
        true
    }

    /// Slab index of `conn`, if it is still the connection in that slot.
    fn lookup(&self, conn: &Conn) -> Option<usize> {
        let key = conn.token() as usize;
        match self.slab.get(key) {
            Some(entry) if entry.conn.ptr_eq(conn) => Some(key),
            _ => None,
        }
    }

    // ── Stream connections ──────────────────────────────────────────

    fn adopt(&mut self, stream: Stream, peer: Address) {
        if self.draining {
            debug!("worker {} draining, dropping connection from {}", self.index, peer);
            return;
        }

        let local = match stream.local_addr() {
            Ok(local) => local,
            Err(e) => {
                warn!("worker {} local address for {}: {}", self.index, peer, e);
                return;
            }
        };

        let key = self.slab.next_key();
        if let Err(e) = self.poller.register(&stream, key as Token, Interest::READ) {
            warn!("worker {} register {}: {}", self.index, peer, e);
            return;
        }

        let fd = stream.as_fd().as_raw_fd();
        let conn = Conn::new(
            key as Token,
            self.index,
            Transport::Stream(stream),
            local,
            peer,
            self.mailbox.clone(),
            self.config.write_buffer_limit,
        );
        self.slab.insert(Entry {
            conn: conn.clone(),
            fd: Some(fd),
            armed: Interest::READ,
            dgram: None,
            last_active: Instant::now(),
        });
        self.open.fetch_add(1, Ordering::AcqRel);
        trace!("worker {} opened {} from {}", self.index, conn.id(), conn.remote_addr());

        {
            let _busy = conn.enter();
            (self.handlers.on_open)(&conn);
        }
        self.settle(key, false, false);
    }

    fn on_stream_ready(&mut self, key: usize, ready: Readiness) {
        // A stale event may name a slot since reused by a datagram session.
        let conn = match self.slab.get(key) {
            Some(entry) if entry.fd.is_some() => entry.conn.clone(),
            _ => return,
        };

        let outcome = {
            let _busy = conn.enter();
            self.dispatch(&conn, ready)
        };

        match outcome {
            Ok(more) => self.settle(key, true, more),
            Err(reason) => self.finalize(key, reason),
        }
    }

    /// Read and/or flush for one readiness event.
    /// `Ok(true)` when the read cap was hit with data possibly left.
    fn dispatch(&self, conn: &Conn, ready: Readiness) -> Result<bool, CloseReason> {
        let mut more = false;
        if conn.is_open() && (ready.readable() || ready.is_hup_or_error()) {
            more = self.read_ready(conn)?;
        }
        if ready.writable() || ready.is_hup_or_error() || conn.queued() > 0 {
            conn.lock_io().flush().map_err(CloseReason::io)?;
        }
        Ok(more)
    }

    fn read_ready(&self, conn: &Conn) -> Result<bool, CloseReason> {
        let edge = self.poller.mode().edge;
        let reads = if edge { self.config.max_reads_per_event } else { 1 };

        for _ in 0..reads {
            // A hook may have closed it.
            if !conn.is_open() {
                return Ok(false);
            }

            let mut buf = (self.handlers.alloc)(conn);
            if buf.capacity() == 0 {
                (self.handlers.free)(conn, buf);
                return Err(CloseReason::io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "read buffer hook returned an empty buffer",
                )));
            }

            let result = conn.read(buf.spare_mut());
            match result {
                Ok(0) => {
                    (self.handlers.free)(conn, buf);
                    return Err(CloseReason::PeerClosed);
                }
                Ok(n) => {
                    buf.set_len(n);
                    (self.handlers.on_data)(conn, &buf);
                    (self.handlers.free)(conn, buf);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    (self.handlers.free)(conn, buf);
                    return Ok(false);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    (self.handlers.free)(conn, buf);
                }
                Err(e) => {
                    (self.handlers.free)(conn, buf);
                    return Err(CloseReason::io(e));
                }
            }
        }
        Ok(edge)
    }

    /// Bring the registration in line with the connection's state, or close
    /// it when there is nothing left to do.
    ///
    /// `fired`: a one-shot registration was consumed and must be re-armed.
    /// `force`: re-arm even if interest is unchanged (re-reports readiness
    /// left behind by the read cap).
    fn settle(&mut self, key: usize, fired: bool, force: bool) {
        let (conn, fd, armed) = match self.slab.get(key) {
            Some(entry) => (entry.conn.clone(), entry.fd, entry.armed),
            None => return,
        };

        let open = conn.is_open();
        let queued = conn.queued();
        if !open && !(queued > 0 && self.should_drain(&conn)) {
            let reason = conn.pending_reason().unwrap_or(CloseReason::Local);
            self.finalize(key, reason);
            return;
        }

        // Datagram sessions are not registered themselves.
        let Some(fd) = fd else { return };

        let want = Interest { read: open, write: queued > 0 };
        let oneshot = self.poller.mode().oneshot;
        if want == armed && !force && !(fired && oneshot) {
            return;
        }

        // Safety: the fd stays open until `finalize`, which only this
        // thread calls and which removes the entry first.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match self.poller.reregister(borrowed, key as Token, want) {
            Ok(()) => {
                if let Some(entry) = self.slab.get_mut(key) {
                    entry.armed = want;
                }
            }
            Err(e) => {
                warn!("worker {} re-arm {}: {}", self.index, conn.id(), e);
                self.finalize(key, CloseReason::io(e));
            }
        }
    }

    fn should_drain(&self, conn: &Conn) -> bool {
        match conn.pending_reason() {
            Some(CloseReason::Shutdown) => true,
            Some(CloseReason::Local) | None => self.config.drain_on_close,
            Some(_) => false,
        }
    }

    /// Release the socket, forget the connection and fire the close hook.
    fn finalize(&mut self, key: usize, reason: CloseReason) {
        let Some(entry) = self.slab.remove(key) else { return };
        let conn = entry.conn;

        if let Some(transport) = conn.finish() {
            if let Transport::Stream(stream) = &transport {
                if let Err(e) = self.poller.deregister(stream) {
                    debug!("worker {} deregister {}: {}", self.index, conn.id(), e);
                }
            }
            drop(transport);
        }
        if let Some((port, peer)) = entry.dgram {
            if let Some(p) = self.ports.get_mut(port) {
                p.sessions.remove(&peer);
            }
        }
        self.open.fetch_sub(1, Ordering::AcqRel);

        if reason.is_clean() {
            trace!("worker {} closed {}: {}", self.index, conn.id(), reason);
        } else {
            debug!("worker {} closed {}: {}", self.index, conn.id(), reason);
        }
        let _busy = conn.enter();
        (self.handlers.on_close)(&conn, &reason);
    }

    // ── Datagram sockets ────────────────────────────────────────────

    fn on_datagram_ready(&mut self, port: usize) {
        let socket = match self.ports.get(port) {
            Some(p) if p.reading => p.socket.clone(),
            _ => return,
        };

        let edge = self.poller.mode().edge;
        let reads = if edge { self.config.max_reads_per_event } else { 1 };
        let mut drained = false;

        for _ in 0..reads {
            // Learn the sender before picking a buffer for it.
            let peer = match socket.peek_from(&mut []) {
                Ok((_, peer)) => peer,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    drained = true;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Pending ICMP errors surface here and are cleared.
                    debug!("worker {} datagram socket {}: {}", self.index, port, e);
                    continue;
                }
            };

            let key = match self.session(port, peer) {
                Some(key) => key,
                None => {
                    discard_datagram(&socket);
                    continue;
                }
            };
            if !self.deliver_datagram(key, &socket) {
                drained = true;
                break;
            }
        }

        if self.poller.mode().oneshot || (edge && !drained) {
            let token = DGRAM_BIT | port as Token;
            if let Err(e) = self.poller.reregister(&*socket, token, Interest::READ) {
                error!("worker {} re-arm datagram socket {}: {}", self.index, port, e);
            }
        }
    }

    /// Existing session for `peer`, or a new one (fires the open hook).
    fn session(&mut self, port: usize, peer: SocketAddr) -> Option<usize> {
        if let Some(&key) = self.ports[port].sessions.get(&peer) {
            return Some(key);
        }
        if self.draining {
            return None;
        }

        let key = self.slab.next_key();
        let conn = Conn::new(
            key as Token,
            self.index,
            Transport::Datagram { socket: self.ports[port].socket.clone(), peer },
            self.ports[port].local.clone(),
            Address::from(peer),
            self.mailbox.clone(),
            self.config.write_buffer_limit,
        );
        self.slab.insert(Entry {
            conn: conn.clone(),
            fd: None,
            armed: Interest::NONE,
            dgram: Some((port, peer)),
            last_active: Instant::now(),
        });
        self.ports[port].sessions.insert(peer, key);
        self.open.fetch_add(1, Ordering::AcqRel);
        trace!("worker {} opened datagram session {} for {}", self.index, conn.id(), peer);

        let _busy = conn.enter();
        (self.handlers.on_open)(&conn);
        Some(key)
    }

    /// Receive the pending datagram for session `key`. False when the
    /// socket turned out to be empty.
    fn deliver_datagram(&mut self, key: usize, socket: &UdpSocket) -> bool {
        let conn = match self.slab.get_mut(key) {
            Some(entry) => {
                entry.last_active = Instant::now();
                entry.conn.clone()
            }
            None => return true,
        };

        let _busy = conn.enter();
        if !conn.is_open() {
            discard_datagram(socket);
            return true;
        }

        let len = match peek_datagram_len(socket) {
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(e) => {
                debug!("worker {} peek for {}: {}", self.index, conn.id(), e);
                return true;
            }
        };

        let mut buf = (self.handlers.alloc)(&conn);
        let result = if buf.capacity() >= len {
            self.recv_datagram(&conn, socket, &mut buf)
        } else {
            // Too small for this datagram; a pool buffer takes its place so
            // nothing is cut off. The hook still gets its own buffer back.
            trace!(
                "worker {} {}-byte datagram for {} exceeds read buffer of {}",
                self.index,
                len,
                conn.id(),
                buf.capacity()
            );
            let mut large = BufferPool::global().allocate(len);
            let result = self.recv_datagram(&conn, socket, &mut large);
            BufferPool::global().release(large);
            result
        };
        (self.handlers.free)(&conn, buf);

        match result {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) => {
                debug!("worker {} recv_from for {}: {}", self.index, conn.id(), e);
                true
            }
        }
    }

    fn recv_datagram(
        &self,
        conn: &Conn,
        socket: &UdpSocket,
        buf: &mut Buffer,
    ) -> io::Result<()> {
        let (n, _) = socket.recv_from(buf.spare_mut())?;
        if n > 0 {
            buf.set_len(n);
            (self.handlers.on_data)(conn, buf.as_slice());
        }
        Ok(())
    }

    fn sweep_idle(&mut self) {
        let Some(timeout) = self.config.datagram_idle_timeout else { return };
        let now = Instant::now();
        if now.duration_since(self.last_sweep) < self.config.poll_interval {
            return;
        }
        self.last_sweep = now;

        let expired: Vec<usize> = self
            .slab
            .iter()
            .filter(|(_, e)| e.dgram.is_some() && now.duration_since(e.last_active) >= timeout)
            .map(|(key, _)| key)
            .collect();
        for key in expired {
            if let Some(entry) = self.slab.get(key) {
                entry.conn.mark_closing(CloseReason::IdleTimeout);
            }
            self.finalize(key, CloseReason::IdleTimeout);
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────

    fn begin_drain(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;

        for port in &mut self.ports {
            if port.reading {
                port.reading = false;
                if let Err(e) = self.poller.deregister(&*port.socket) {
                    debug!("worker {} deregister datagram socket: {}", self.index, e);
                }
            }
        }

        for key in self.slab.keys() {
            if let Some(entry) = self.slab.get(key) {
                entry.conn.mark_closing(CloseReason::Shutdown);
            }
            self.settle(key, false, false);
        }
        debug!("worker {} draining, {} connections flushing", self.index, self.slab.len());
    }

    fn force_close(&mut self) {
        let keys = self.slab.keys();
        if !keys.is_empty() {
            info!("worker {} force-closing {} connections", self.index, keys.len());
        }
        for key in keys {
            if self.config.forced_write_policy == ForcedWritePolicy::BestEffort {
                if let Some(entry) = self.slab.get(key) {
                    let _ = entry.conn.lock_io().flush();
                }
            }
            if let Some(entry) = self.slab.get(key) {
                entry.conn.mark_closing(CloseReason::ForcedShutdown);
            }
            self.finalize(key, CloseReason::ForcedShutdown);
        }
    }

    fn teardown(&mut self) {
        // Commands posted after the last pass: accepted streams are closed
        // by drop; close/flush requests refer to finalized connections.
        while self.mailbox.pop().is_some() {}

        for port in self.ports.drain(..) {
            if port.reading {
                let _ = self.poller.deregister(&*port.socket);
            }
        }
    }
}

/// Drop one pending datagram.
fn discard_datagram(socket: &UdpSocket) {
    let mut scratch = [0u8; 1];
    let _ = socket.recv_from(&mut scratch);
}

/// Wait for a worker thread and log how it ended.
pub(crate) fn join(handle: JoinHandle<()>) {
    let name = handle.thread().name().unwrap_or("shardio-worker").to_string();
    if handle.join().is_err() {
        error!("{} panicked", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardio_core::ConnState;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Mutex;
    use std::time::Duration;

    fn test_config() -> Arc<EngineConfig> {
        Arc::new(
            EngineConfig::new()
                .addrs(["127.0.0.1:0"])
                .num_workers(1)
                .poll_interval(Duration::from_millis(10)),
        )
    }

    fn accepted_pair() -> (Stream, Address, TcpStream) {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(l.local_addr().unwrap()).unwrap();
        let (s, peer) = l.accept().unwrap();
        s.set_nonblocking(true).unwrap();
        (Stream::Tcp(s), Address::from(peer), client)
    }

    #[test]
    fn test_current_worker_unset_off_worker() {
        assert_eq!(current_worker(), None);
    }

    #[test]
    fn test_mailbox_fifo() {
        let mb = Mailbox::new().unwrap();
        assert!(mb.is_empty());
        mb.post(Command::Drain);
        assert!(!mb.is_forced());
        mb.post(Command::Force);
        assert!(mb.is_forced());
        assert!(matches!(mb.pop(), Some(Command::Drain)));
        assert!(matches!(mb.pop(), Some(Command::Force)));
        assert!(mb.pop().is_none());
    }

    #[test]
    fn test_drain_after_deadline_forces() {
        let reasons: Arc<Mutex<Vec<String>>> = Arc::default();
        let mut handlers = Handlers::with_defaults(1024);
        let r = reasons.clone();
        handlers.on_close = Box::new(move |_, reason| r.lock().unwrap().push(reason.to_string()));

        let open = Arc::new(AtomicUsize::new(0));
        let mut worker = Worker::new(
            0,
            test_config(),
            Arc::new(handlers),
            open.clone(),
            Arc::new(Latch::new(1)),
            Vec::new(),
        )
        .unwrap();

        let (stream, peer, _client) = accepted_pair();
        worker.mailbox.post(Command::Adopt { stream, peer });
        assert!(worker.run_commands());
        assert_eq!(open.load(Ordering::Acquire), 1);

        // Both arrive while the worker is busy elsewhere.
        worker.mailbox.post(Command::Drain);
        worker.mailbox.post(Command::Force);
        assert!(!worker.run_commands());

        assert_eq!(open.load(Ordering::Acquire), 0);
        assert_eq!(*reasons.lock().unwrap(), vec!["forced shutdown".to_string()]);
    }

    #[test]
    fn test_worker_echo_and_drain() {
        let events: Arc<Mutex<Vec<String>>> = Arc::default();
        let mut handlers = Handlers::with_defaults(1024);
        let ev = events.clone();
        handlers.on_open = Box::new(move |c| {
            assert!(current_worker().is_some());
            ev.lock().unwrap().push(format!("open {}", c.id()));
        });
        handlers.on_data = Box::new(|c, data| {
            c.write(data).unwrap();
        });
        let ev = events.clone();
        handlers.on_close = Box::new(move |c, reason| {
            assert_eq!(c.state(), ConnState::Closed);
            ev.lock().unwrap().push(format!("close {}", reason));
        });

        let open = Arc::new(AtomicUsize::new(0));
        let latch = Arc::new(Latch::new(1));
        let worker = Worker::new(
            0,
            test_config(),
            Arc::new(handlers),
            open.clone(),
            latch.clone(),
            Vec::new(),
        )
        .unwrap();
        let mailbox = worker.mailbox();
        let handle = worker.spawn().unwrap();

        let (stream, peer, mut client) = accepted_pair();
        mailbox.post(Command::Adopt { stream, peer });

        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(open.load(Ordering::Acquire), 1);

        mailbox.post(Command::Drain);
        assert!(latch.wait_until(Instant::now() + Duration::from_secs(5)));
        join(handle);

        assert_eq!(open.load(Ordering::Acquire), 0);
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].starts_with("open"));
        assert_eq!(events[1], "close engine shutdown");

        // Socket released: the client sees EOF.
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
