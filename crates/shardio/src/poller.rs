//! Thin wrapper over one epoll instance.
//!
//! ```text
//!   connection fd ── register(token = slab index) ──┐
//!   datagram fd   ── register(token = DGRAM | idx) ─┼──▶ epoll ──wait──▶ [(flags, token)]
//!   eventfd       ── register_level(token = WAKE) ──┘
//! ```
//!
//! Connection registrations carry the engine's trigger mode (edge and/or
//! one-shot). Control fds (eventfd, listeners) are always level-triggered
//! and persistent.

use std::io;
use std::os::fd::AsFd;
use std::time::Duration;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};

/// Opaque value handed back with each event
pub(crate) type Token = u64;

/// Token of a worker's or acceptor's wakeup eventfd
pub(crate) const WAKE_TOKEN: Token = u64::MAX;

/// Readiness a registration asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const NONE: Interest = Interest { read: false, write: false };
    pub const READ: Interest = Interest { read: true, write: false };
}

/// Trigger mode for connection registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Mode {
    pub oneshot: bool,
    pub edge: bool,
}

/// What an event reports, decoded from epoll flags.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness(EpollFlags);

impl Readiness {
    #[inline]
    pub fn readable(&self) -> bool {
        self.0.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI | EpollFlags::EPOLLRDHUP)
    }

    #[inline]
    pub fn writable(&self) -> bool {
        self.0.contains(EpollFlags::EPOLLOUT)
    }

    /// Hang-up or error; a read or write will report the details.
    #[inline]
    pub fn is_hup_or_error(&self) -> bool {
        self.0.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR)
    }
}

pub(crate) struct Poller {
    epoll: Epoll,
    mode: Mode,
}

impl Poller {
    pub fn new(mode: Mode) -> io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self { epoll, mode })
    }

    #[inline]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn flags(&self, interest: Interest) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if interest.read {
            flags |= EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP;
        }
        if interest.write {
            flags |= EpollFlags::EPOLLOUT;
        }
        if self.mode.edge {
            flags |= EpollFlags::EPOLLET;
        }
        if self.mode.oneshot {
            flags |= EpollFlags::EPOLLONESHOT;
        }
        flags
    }

    /// Add a connection or datagram socket with the engine's trigger mode.
    pub fn register<F: AsFd>(&self, fd: F, token: Token, interest: Interest) -> io::Result<()> {
        self.epoll.add(fd, EpollEvent::new(self.flags(interest), token))?;
        Ok(())
    }

    /// Change interest; with one-shot this is also the re-arm.
    pub fn reregister<F: AsFd>(&self, fd: F, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = EpollEvent::new(self.flags(interest), token);
        self.epoll.modify(fd, &mut event)?;
        Ok(())
    }

    pub fn deregister<F: AsFd>(&self, fd: F) -> io::Result<()> {
        self.epoll.delete(fd)?;
        Ok(())
    }

    /// Add a control fd: level-triggered readable, never one-shot.
    pub fn register_level<F: AsFd>(&self, fd: F, token: Token) -> io::Result<()> {
        self.epoll.add(fd, EpollEvent::new(EpollFlags::EPOLLIN, token))?;
        Ok(())
    }

    /// Wait up to `timeout` and fill `events`. EINTR counts as zero events.
    pub fn wait(&self, events: &mut [EpollEvent], timeout: Duration) -> io::Result<usize> {
        let ms = timeout.as_millis().min(u16::MAX as u128) as u16;
        match self.epoll.wait(events, ms) {
            Ok(n) => Ok(n),
            Err(nix::errno::Errno::EINTR) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

/// Pre-sized event buffer for `Poller::wait`.
pub(crate) fn event_buffer(max_events: usize) -> Vec<EpollEvent> {
    vec![EpollEvent::empty(); max_events.max(1)]
}

/// Split an event into its token and readiness.
#[inline]
pub(crate) fn decode(event: &EpollEvent) -> (Token, Readiness) {
    (event.data(), Readiness(event.events()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    fn level() -> Mode {
        Mode { oneshot: false, edge: false }
    }

    #[test]
    fn test_flags_follow_mode() {
        let p = Poller::new(Mode { oneshot: true, edge: true }).unwrap();
        let f = p.flags(Interest::READ);
        assert!(f.contains(EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP));
        assert!(f.contains(EpollFlags::EPOLLET | EpollFlags::EPOLLONESHOT));
        assert!(!f.contains(EpollFlags::EPOLLOUT));

        let p = Poller::new(level()).unwrap();
        let f = p.flags(Interest { read: false, write: true });
        assert_eq!(f, EpollFlags::EPOLLOUT);
    }

    #[test]
    fn test_readable_event_carries_token() {
        let p = Poller::new(level()).unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        p.register(&a, 7, Interest::READ).unwrap();

        let mut events = event_buffer(8);
        assert_eq!(p.wait(&mut events, Duration::from_millis(0)).unwrap(), 0);

        b.write_all(b"x").unwrap();
        let n = p.wait(&mut events, Duration::from_millis(1000)).unwrap();
        assert_eq!(n, 1);
        let (token, ready) = decode(&events[0]);
        assert_eq!(token, 7);
        assert!(ready.readable());
        assert!(!ready.writable());

        p.deregister(&a).unwrap();
    }

    #[test]
    fn test_oneshot_requires_rearm() {
        let p = Poller::new(Mode { oneshot: true, edge: false }).unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        p.register(&a, 1, Interest::READ).unwrap();
        b.write_all(b"x").unwrap();

        let mut events = event_buffer(8);
        assert_eq!(p.wait(&mut events, Duration::from_millis(1000)).unwrap(), 1);
        // Data still unread, but the registration is disarmed.
        assert_eq!(p.wait(&mut events, Duration::from_millis(20)).unwrap(), 0);

        p.reregister(&a, 1, Interest::READ).unwrap();
        assert_eq!(p.wait(&mut events, Duration::from_millis(1000)).unwrap(), 1);
    }
}
