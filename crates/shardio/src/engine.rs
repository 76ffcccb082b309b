//! Engine: listeners, workers, hooks and lifecycle.
//!
//! ```text
//!   Engine::builder(config).on_data(..).build()
//!        │
//!   start()    Created ──▶ Running      bind all, spawn workers (+ acceptor)
//!   shutdown() Running ──▶ Draining ──▶ Stopped
//! ```
//!
//! Hooks are frozen by `build()`; a stopped engine cannot be restarted.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, info};
use shardio_core::{
    Address, BindAddr, Buffer, CloseReason, EngineError, EngineState, NetworkKind, Result,
};

use crate::acceptor::{self, AcceptorHandle};
use crate::config::{defaults, EngineConfig};
use crate::conn::Conn;
use crate::handler::Handlers;
use crate::shutdown::{self, Latch};
use crate::socket::{self, Listener};
use crate::worker::{self, Mailbox, Worker};

/// Collects hooks before the engine is built.
///
/// ```rust,ignore
/// let engine = Engine::builder(EngineConfig::from_env())
///     .on_data(|conn, data| { let _ = conn.write(data); })
///     .build();
/// engine.start()?;
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    handlers: Handlers,
}

impl EngineBuilder {
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&Conn) + Send + Sync + 'static,
    {
        self.handlers.on_open = Box::new(f);
        self
    }

    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&Conn, &CloseReason) + Send + Sync + 'static,
    {
        self.handlers.on_close = Box::new(f);
        self
    }

    pub fn on_data<F>(mut self, f: F) -> Self
    where
        F: Fn(&Conn, &[u8]) + Send + Sync + 'static,
    {
        self.handlers.on_data = Box::new(f);
        self
    }

    /// Replace the default read buffer source (the global pool).
    pub fn on_read_buffer_alloc<F>(mut self, f: F) -> Self
    where
        F: Fn(&Conn) -> Buffer + Send + Sync + 'static,
    {
        self.handlers.alloc = Box::new(f);
        self
    }

    /// Replace the default read buffer release (back to the global pool).
    pub fn on_read_buffer_free<F>(mut self, f: F) -> Self
    where
        F: Fn(&Conn, Buffer) + Send + Sync + 'static,
    {
        self.handlers.free = Box::new(f);
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            config: Arc::new(self.config),
            handlers: Arc::new(self.handlers),
            state: AtomicU8::new(EngineState::Created as u8),
            running: Mutex::new(None),
            open: Arc::new(AtomicUsize::new(0)),
            local_addrs: Mutex::new(Vec::new()),
            stopped: Latch::new(1),
        }
    }
}

/// Everything that exists only while running.
struct Running {
    mailboxes: Vec<Arc<Mailbox>>,
    threads: Vec<JoinHandle<()>>,
    acceptor: Option<AcceptorHandle>,
    drained: Arc<Latch>,
}

pub struct Engine {
    config: Arc<EngineConfig>,
    handlers: Arc<Handlers>,
    state: AtomicU8,
    /// Also serializes `start` against `shutdown`
    running: Mutex<Option<Running>>,
    open: Arc<AtomicUsize>,
    local_addrs: Mutex<Vec<Address>>,
    stopped: Latch,
}

/// What `start` binds before any thread exists.
enum Bound {
    Listeners(Vec<Listener>),
    Datagram(Vec<(UdpSocket, Address)>),
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        let handlers = Handlers::with_defaults(config.read_buffer_size);
        EngineBuilder { config, handlers }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    pub fn state(&self) -> EngineState {
        EngineState::from(self.state.load(Ordering::Acquire))
    }

    /// Connections currently open across all workers.
    #[inline]
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    /// The actually bound addresses (resolves port 0). Empty until started.
    pub fn local_addrs(&self) -> Vec<Address> {
        self.local_addrs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Bind every address, spawn the workers (and the acceptor for stream
    /// and local networks) and return.
    ///
    /// Nothing is spawned unless every address binds.
    pub fn start(&self) -> Result<()> {
        let mut running = self.lock_running();
        match self.state() {
            EngineState::Created => {}
            EngineState::Running | EngineState::Draining => {
                return Err(EngineError::AlreadyStarted);
            }
            EngineState::Stopped => return Err(EngineError::Stopped),
        }

        self.config.validate()?;
        let addrs = self.config.bind_addrs()?;
        let bound = self.bind_all(&addrs)?;

        let local: Vec<Address> = match &bound {
            Bound::Listeners(ls) => ls
                .iter()
                .map(Listener::local_addr)
                .collect::<std::io::Result<Vec<Address>>>()?,
            Bound::Datagram(ss) => ss.iter().map(|(_, a)| a.clone()).collect(),
        };

        let n = self.config.num_workers;
        let drained = Arc::new(Latch::new(n));
        let (listeners, mut per_worker) = match bound {
            Bound::Listeners(ls) => (ls, (0..n).map(|_| Vec::new()).collect::<Vec<_>>()),
            Bound::Datagram(ss) => {
                let mut per_worker: Vec<Vec<(UdpSocket, Address)>> =
                    (0..n).map(|_| Vec::new()).collect();
                for (i, s) in ss.into_iter().enumerate() {
                    per_worker[i % n].push(s);
                }
                (Vec::new(), per_worker)
            }
        };

        // Build every worker before starting any, so a failure leaves
        // nothing running.
        let mut workers = Vec::with_capacity(n);
        for (i, sockets) in per_worker.drain(..).enumerate() {
            workers.push(Worker::new(
                i,
                self.config.clone(),
                self.handlers.clone(),
                self.open.clone(),
                drained.clone(),
                sockets,
            )?);
        }
        let mailboxes: Vec<Arc<Mailbox>> = workers.iter().map(Worker::mailbox).collect();

        let mut threads = Vec::with_capacity(n);
        for (i, w) in workers.into_iter().enumerate() {
            match w.spawn() {
                Ok(handle) => threads.push(handle),
                Err(source) => {
                    abort_workers(&mailboxes, threads);
                    let name = format!("shardio-worker-{}", i);
                    return Err(EngineError::Spawn { name, source });
                }
            }
        }

        let acceptor = if self.config.network.is_accepting() {
            match acceptor::spawn(
                listeners,
                mailboxes.clone(),
                self.config.tcp_nodelay,
                self.config.poll_interval,
            ) {
                Ok(handle) => Some(handle),
                Err(source) => {
                    abort_workers(&mailboxes, threads);
                    let name = "shardio-acceptor".to_string();
                    return Err(EngineError::Spawn { name, source });
                }
            }
        } else {
            None
        };

        info!(
            "engine started: {} on {} with {} workers",
            self.config.network,
            local.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(","),
            n
        );
        *self.local_addrs.lock().unwrap_or_else(PoisonError::into_inner) = local;
        *running = Some(Running { mailboxes, threads, acceptor, drained });
        self.state.store(EngineState::Running as u8, Ordering::Release);
        Ok(())
    }

    fn bind_all(&self, addrs: &[BindAddr]) -> Result<Bound> {
        let bind_err = |addr: &BindAddr, source: std::io::Error| EngineError::Bind {
            addr: addr.to_string(),
            source,
        };

        if self.config.network == NetworkKind::Datagram {
            let mut sockets = Vec::with_capacity(addrs.len());
            for addr in addrs {
                let socket = socket::bind_udp(addr).map_err(|e| bind_err(addr, e))?;
                let local = socket.local_addr().map_err(|e| bind_err(addr, e))?;
                info!("bound udp {}", local);
                sockets.push((socket, Address::from(local)));
            }
            return Ok(Bound::Datagram(sockets));
        }

        // Already-bound listeners are dropped (closed, unlinked) on error.
        let mut listeners = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let listener = Listener::bind(addr, self.config.listen_backlog)
                .map_err(|e| bind_err(addr, e))?;
            info!("listening on {} {}", self.config.network, addr);
            listeners.push(listener);
        }
        Ok(Bound::Listeners(listeners))
    }

    /// Stop accepting, drain every worker for up to `deadline`, then force
    /// the rest closed. Returns once every worker thread has exited, or,
    /// for a worker stuck in a hook, shortly after the deadline; that
    /// worker closes its connections when the hook returns.
    ///
    /// Idempotent; a never-started engine just becomes stopped.
    pub fn shutdown(&self, deadline: Duration) -> Result<()> {
        let mut guard = self.lock_running();
        let Some(running) = guard.take() else {
            if self.state() != EngineState::Stopped {
                self.state.store(EngineState::Stopped as u8, Ordering::Release);
                self.stopped.count_down();
            }
            return Ok(());
        };
        self.state.store(EngineState::Draining as u8, Ordering::Release);

        if let Some(acceptor) = running.acceptor {
            acceptor.stop();
        }

        let result =
            shutdown::drain_workers(&running.mailboxes, &running.drained, &self.open, deadline);

        let grace = Duration::from_millis(defaults::FORCE_GRACE_MS);
        let detached = shutdown::join_workers(running.threads, &running.drained, grace);
        if detached > 0 {
            error!("{} workers detached while inside a hook", detached);
        }

        self.state.store(EngineState::Stopped as u8, Ordering::Release);
        self.stopped.count_down();
        info!("engine stopped");
        result
    }

    /// Shut down with the configured deadline.
    pub fn stop(&self) -> Result<()> {
        self.shutdown(self.config.shutdown_deadline)
    }

    /// Block until the engine is stopped.
    pub fn wait(&self) {
        self.stopped.wait();
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if matches!(self.state(), EngineState::Running | EngineState::Draining) {
            if let Err(e) = self.shutdown(Duration::ZERO) {
                error!("shutdown on drop: {}", e);
            }
        }
    }
}

/// Tear down workers that were already spawned when start fails midway.
fn abort_workers(mailboxes: &[Arc<Mailbox>], threads: Vec<JoinHandle<()>>) {
    for mailbox in mailboxes {
        mailbox.post(worker::Command::Force);
    }
    for handle in threads {
        worker::join(handle);
    }
}
