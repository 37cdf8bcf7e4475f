//! Readiness multiplexing over child-process pipe descriptors.
//!
//! Two interchangeable backends satisfy the same contract: [`EpollIoMap`]
//! (level-triggered `epoll`, Linux) and [`PollIoMap`] (a portable `poll(2)`
//! readiness-set call). [`make_iomap`] picks the preferred one.

use std::collections::BTreeMap;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
#[cfg(target_os = "linux")]
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
#[cfg(target_os = "linux")]
use tracing::warn;

use crate::task::TaskPipe;
use crate::Result;

/// Read or write readiness
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Interest {
    /// The descriptor is readable (includes peer hang-up)
    Read,
    /// The descriptor is writable (includes error conditions)
    Write,
}

/// Routing token attached to a registered descriptor
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Token {
    /// Task id within the manager
    pub task: usize,
    /// Which of the task's pipes the descriptor belongs to
    pub pipe: TaskPipe,
}

/// One readiness event collected by a poll
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IoEvent {
    /// Token supplied at registration
    pub token: Token,
    /// Direction the descriptor became ready for
    pub interest: Interest,
}

/// A manager for file descriptors and the tokens routing their events.
///
/// `poll` returns after collecting at least one event, after the timeout
/// elapses, or when the wait is interrupted by a signal (in which case it
/// returns having collected nothing). Every ready descriptor yields at most
/// one event per direction per poll. With nothing registered, `poll` returns
/// immediately.
pub trait IoMap {
    /// Registers a descriptor for read events
    fn register_read(&mut self, fd: RawFd, token: Token) -> Result<()>;
    /// Registers a descriptor for write events
    fn register_write(&mut self, fd: RawFd, token: Token) -> Result<()>;
    /// Unregisters a descriptor. Must be called before the descriptor is
    /// closed.
    fn unregister(&mut self, fd: RawFd) -> Result<()>;
    /// Waits up to `timeout` and appends ready-descriptor events to `events`
    fn poll(&mut self, timeout: Duration, events: &mut Vec<IoEvent>) -> Result<()>;
    /// Returns true if no descriptor is registered
    fn is_empty(&self) -> bool;
}

// Waits above ~65 s are clamped; the scheduler loop simply polls again.
fn poll_millis(timeout: Duration) -> u16 {
    u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX)
}

// SAFETY: the descriptor is owned by a registered task and stays open until
// it is unregistered, which the task does strictly before closing it.
fn borrowed(fd: RawFd) -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(fd) }
}

/// `poll(2)` backend: the full descriptor set is submitted on every call
#[derive(Default)]
pub struct PollIoMap {
    readmap: BTreeMap<RawFd, Token>,
    writemap: BTreeMap<RawFd, Token>,
}

impl PollIoMap {
    /// Creates an empty map
    pub fn new() -> Self {
        Self::default()
    }
}

impl IoMap for PollIoMap {
    fn register_read(&mut self, fd: RawFd, token: Token) -> Result<()> {
        self.readmap.insert(fd, token);
        Ok(())
    }
    fn register_write(&mut self, fd: RawFd, token: Token) -> Result<()> {
        self.writemap.insert(fd, token);
        Ok(())
    }
    fn unregister(&mut self, fd: RawFd) -> Result<()> {
        self.readmap.remove(&fd);
        self.writemap.remove(&fd);
        Ok(())
    }
    fn poll(&mut self, timeout: Duration, events: &mut Vec<IoEvent>) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let mut fds: Vec<PollFd> = Vec::with_capacity(self.readmap.len() + self.writemap.len());
        let mut tokens: Vec<(Token, Interest)> = Vec::with_capacity(fds.capacity());
        for (&fd, &token) in &self.readmap {
            fds.push(PollFd::new(borrowed(fd), PollFlags::POLLIN));
            tokens.push((token, Interest::Read));
        }
        for (&fd, &token) in &self.writemap {
            fds.push(PollFd::new(borrowed(fd), PollFlags::POLLOUT));
            tokens.push((token, Interest::Write));
        }
        match poll(&mut fds, PollTimeout::from(poll_millis(timeout))) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        for (pollfd, &(token, interest)) in fds.iter().zip(&tokens) {
            let Some(revents) = pollfd.revents() else {
                continue;
            };
            let ready = match interest {
                Interest::Read => {
                    revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                }
                Interest::Write => {
                    revents.intersects(PollFlags::POLLOUT | PollFlags::POLLHUP | PollFlags::POLLERR)
                }
            };
            if ready {
                events.push(IoEvent { token, interest });
            }
        }
        Ok(())
    }
    fn is_empty(&self) -> bool {
        self.readmap.is_empty() && self.writemap.is_empty()
    }
}

/// Level-triggered `epoll` backend (Linux)
#[cfg(target_os = "linux")]
pub struct EpollIoMap {
    epoll: Epoll,
    readmap: BTreeMap<RawFd, Token>,
    writemap: BTreeMap<RawFd, Token>,
}

#[cfg(target_os = "linux")]
impl EpollIoMap {
    /// Creates an empty map
    pub fn new() -> Result<Self> {
        Ok(Self {
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?,
            readmap: BTreeMap::new(),
            writemap: BTreeMap::new(),
        })
    }
}

#[cfg(target_os = "linux")]
impl IoMap for EpollIoMap {
    fn register_read(&mut self, fd: RawFd, token: Token) -> Result<()> {
        self.epoll.add(
            borrowed(fd),
            EpollEvent::new(EpollFlags::EPOLLIN, fd as u64),
        )?;
        self.readmap.insert(fd, token);
        Ok(())
    }
    fn register_write(&mut self, fd: RawFd, token: Token) -> Result<()> {
        self.epoll.add(
            borrowed(fd),
            EpollEvent::new(EpollFlags::EPOLLOUT, fd as u64),
        )?;
        self.writemap.insert(fd, token);
        Ok(())
    }
    fn unregister(&mut self, fd: RawFd) -> Result<()> {
        if self.readmap.remove(&fd).is_some() || self.writemap.remove(&fd).is_some() {
            self.epoll.delete(borrowed(fd))?;
        }
        Ok(())
    }
    fn poll(&mut self, timeout: Duration, events: &mut Vec<IoEvent>) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let mut ready = [EpollEvent::empty(); 64];
        let n = match self
            .epoll
            .wait(&mut ready, EpollTimeout::from(poll_millis(timeout)))
        {
            Ok(n) => n,
            Err(Errno::EINTR) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for event in &ready[..n] {
            let flags = event.events();
            #[allow(clippy::cast_possible_truncation)]
            let fd = event.data() as RawFd;
            if flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
                if let Some(&token) = self.readmap.get(&fd) {
                    events.push(IoEvent {
                        token,
                        interest: Interest::Read,
                    });
                }
            }
            if flags.intersects(EpollFlags::EPOLLOUT | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR)
            {
                if let Some(&token) = self.writemap.get(&fd) {
                    events.push(IoEvent {
                        token,
                        interest: Interest::Write,
                    });
                }
            }
        }
        Ok(())
    }
    fn is_empty(&self) -> bool {
        self.readmap.is_empty() && self.writemap.is_empty()
    }
}

/// Returns the preferred backend for the current platform: level-triggered
/// epoll where available, the `poll(2)` readiness set otherwise
pub fn make_iomap() -> Box<dyn IoMap> {
    #[cfg(target_os = "linux")]
    match EpollIoMap::new() {
        Ok(iomap) => return Box::new(iomap),
        Err(e) => warn!(%e, "epoll unavailable, falling back to poll"),
    }
    Box::new(PollIoMap::new())
}

#[cfg(test)]
mod test {
    use std::os::fd::{AsFd as _, AsRawFd as _};
    use std::time::Instant;

    use nix::unistd;

    use super::*;

    fn token(task: usize) -> Token {
        Token {
            task,
            pipe: TaskPipe::Stdout,
        }
    }

    fn check_backend(iomap: &mut dyn IoMap) {
        let mut events = Vec::new();

        // nothing registered: immediate return regardless of timeout
        let start = Instant::now();
        iomap.poll(Duration::from_secs(5), &mut events).unwrap();
        assert!(start.elapsed() < Duration::from_millis(200));
        assert!(events.is_empty());

        let (rx, tx) = unistd::pipe().unwrap();
        iomap.register_read(rx.as_raw_fd(), token(7)).unwrap();

        // no data yet: the timeout elapses
        iomap.poll(Duration::from_millis(20), &mut events).unwrap();
        assert!(events.is_empty());

        unistd::write(tx.as_fd(), b"x").unwrap();
        iomap.poll(Duration::from_secs(5), &mut events).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, token(7));
        assert_eq!(events[0].interest, Interest::Read);

        // peer hang-up arrives as a read event
        drop(tx);
        events.clear();
        iomap.poll(Duration::from_secs(5), &mut events).unwrap();
        assert_eq!(events.len(), 1);

        iomap.unregister(rx.as_raw_fd()).unwrap();
        assert!(iomap.is_empty());
    }

    #[test]
    fn test_poll_backend() {
        check_backend(&mut PollIoMap::new());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_epoll_backend() {
        check_backend(&mut EpollIoMap::new().unwrap());
    }

    #[test]
    fn test_writable() {
        let mut iomap = PollIoMap::new();
        let (_rx, tx) = unistd::pipe().unwrap();
        let mut events = Vec::new();
        iomap
            .register_write(
                tx.as_raw_fd(),
                Token {
                    task: 1,
                    pipe: TaskPipe::Stdin,
                },
            )
            .unwrap();
        iomap.poll(Duration::from_secs(5), &mut events).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].interest, Interest::Write);
    }
}
