//! Shutdown coordination.
//!
//! ```text
//!   shutdown(deadline)
//!     │
//!     ├─ Drain ──▶ worker 0 ─┐
//!     ├─ Drain ──▶ worker 1 ─┼─ each counts down when empty (or on exit)
//!     ├─ Drain ──▶ worker N ─┘
//!     │
//!     ├─ latch.wait_until(deadline)
//!     │     reached zero ──▶ Ok
//!     │     timed out    ──▶ Force ──▶ every worker, DeadlineExceeded
//!     │
//!     └─ join_workers: join what exits within the grace period,
//!        detach workers stuck in a hook
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{info, warn};
use shardio_core::{EngineError, Result};

use crate::worker::{self, Command, Mailbox};

/// Countdown latch: `wait` returns once `count_down` was called `n` times.
pub(crate) struct Latch {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Latch {
    pub fn new(n: usize) -> Self {
        Self { count: Mutex::new(n), cv: Condvar::new() }
    }

    pub fn count_down(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.cv.notify_all();
            }
        }
    }

    pub fn remaining(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until zero or `deadline`. True if zero was reached.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = self
                .cv
                .wait_timeout(count, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = self.cv.wait(count).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Ask every worker to drain and wait up to `deadline` for all of them to
/// report empty; past the deadline, force-close what is left.
///
/// Does not join the worker threads.
pub(crate) fn drain_workers(
    mailboxes: &[std::sync::Arc<Mailbox>],
    latch: &Latch,
    open: &AtomicUsize,
    deadline: Duration,
) -> Result<()> {
    let started = Instant::now();
    let until = started.checked_add(deadline).unwrap_or_else(far_future);

    info!(
        "draining {} workers ({} open connections, deadline {:?})",
        mailboxes.len(),
        open.load(Ordering::Acquire),
        deadline
    );
    for mailbox in mailboxes {
        mailbox.post(Command::Drain);
    }

    if latch.wait_until(until) {
        info!("drained in {:?}", started.elapsed());
        return Ok(());
    }

    let remaining = open.load(Ordering::Acquire);
    for mailbox in mailboxes {
        mailbox.post(Command::Force);
    }
    if remaining == 0 {
        // Workers were empty but had not reported yet.
        return Ok(());
    }
    warn!(
        "shutdown deadline {:?} exceeded, force-closing {} connections ({} workers busy)",
        deadline,
        remaining,
        latch.remaining()
    );
    Err(EngineError::DeadlineExceeded { remaining })
}

/// Join the worker threads, waiting at most `grace` for them to exit.
/// A worker still running after that (blocked in a hook) is detached; it
/// force-closes its connections once the hook returns. Returns how many
/// were detached.
pub(crate) fn join_workers(
    threads: Vec<JoinHandle<()>>,
    latch: &Latch,
    grace: Duration,
) -> usize {
    if latch.wait_until(Instant::now() + grace) {
        for handle in threads {
            worker::join(handle);
        }
        return 0;
    }

    let mut detached = 0;
    for handle in threads {
        if handle.is_finished() {
            worker::join(handle);
        } else {
            warn!(
                "{} still inside a hook after {:?}, detaching",
                handle.thread().name().unwrap_or("shardio-worker"),
                grace
            );
            detached += 1;
        }
    }
    detached
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365)
}
