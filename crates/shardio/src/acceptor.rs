//! Acceptor thread for stream and local networks.
//!
//! Polls every listener plus a stop eventfd, accepts until `EAGAIN` and
//! hands each socket to the workers round-robin through their inboxes.
//! Listeners are closed (and unix paths unlinked) when the thread exits.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::notifier::Notifier;
use crate::poller::{decode, event_buffer, Mode, Poller, Token, WAKE_TOKEN};
use crate::socket::Listener;
use crate::worker::{Command, Mailbox};

/// Back-off when the process or system is out of descriptors.
const FD_EXHAUSTED_BACKOFF: Duration = Duration::from_millis(10);

/// Handle held by the engine to stop the acceptor.
pub(crate) struct AcceptorHandle {
    stop: Arc<AtomicBool>,
    notifier: Arc<Notifier>,
    thread: JoinHandle<()>,
}

impl AcceptorHandle {
    /// Stop accepting and wait until every listener is closed.
    pub fn stop(self) {
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.notifier.notify() {
            error!("acceptor wakeup failed: {}", e);
        }
        if self.thread.join().is_err() {
            error!("shardio-acceptor panicked");
        }
    }
}

struct Acceptor {
    listeners: Vec<Listener>,
    workers: Vec<Arc<Mailbox>>,
    poller: Poller,
    notifier: Arc<Notifier>,
    stop: Arc<AtomicBool>,
    tcp_nodelay: bool,
    poll_interval: Duration,
    next: usize,
}

/// Start accepting on `listeners`. Ownership of the listeners moves to the
/// acceptor thread.
pub(crate) fn spawn(
    listeners: Vec<Listener>,
    workers: Vec<Arc<Mailbox>>,
    tcp_nodelay: bool,
    poll_interval: Duration,
) -> io::Result<AcceptorHandle> {
    let poller = Poller::new(Mode { oneshot: false, edge: false })?;
    let notifier = Arc::new(Notifier::new()?);
    poller.register_level(&*notifier, WAKE_TOKEN)?;
    for (i, listener) in listeners.iter().enumerate() {
        poller.register_level(listener, i as Token)?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let acceptor = Acceptor {
        listeners,
        workers,
        poller,
        notifier: notifier.clone(),
        stop: stop.clone(),
        tcp_nodelay,
        poll_interval,
        next: 0,
    };

    let thread = thread::Builder::new()
        .name("shardio-acceptor".to_string())
        .spawn(move || acceptor.run())?;

    Ok(AcceptorHandle { stop, notifier, thread })
}

impl Acceptor {
    fn run(mut self) {
        let mut events = event_buffer(self.listeners.len() + 1);
        info!("acceptor started on {} listeners", self.listeners.len());

        while !self.stop.load(Ordering::Acquire) {
            let n = match self.poller.wait(&mut events, self.poll_interval) {
                Ok(n) => n,
                Err(e) => {
                    error!("acceptor epoll_wait: {}", e);
                    thread::sleep(self.poll_interval);
                    continue;
                }
            };

            for event in &events[..n] {
                let (token, _) = decode(event);
                if token == WAKE_TOKEN {
                    self.notifier.drain();
                } else {
                    self.accept_all(token as usize);
                }
            }
        }

        info!("acceptor stopped, closing {} listeners", self.listeners.len());
    }

    fn accept_all(&mut self, idx: usize) {
        loop {
            if self.stop.load(Ordering::Acquire) {
                return;
            }
            let Some(listener) = self.listeners.get(idx) else { return };

            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.tcp_nodelay {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("TCP_NODELAY for {}: {}", peer, e);
                        }
                    }
                    let worker = self.next % self.workers.len();
                    self.next = self.next.wrapping_add(1);
                    self.workers[worker].post(Command::Adopt { stream, peer });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => match e.raw_os_error() {
                    Some(libc::EMFILE) | Some(libc::ENFILE) => {
                        warn!("accept: {}, backing off", e);
                        thread::sleep(FD_EXHAUSTED_BACKOFF);
                        return;
                    }
                    _ => {
                        // Level-triggered: anything still pending is reported again.
                        warn!("accept: {}", e);
                        return;
                    }
                },
            }
        }
    }
}
