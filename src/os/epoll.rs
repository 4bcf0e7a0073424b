// src/os/epoll.rs

//! A small wrapper around `epoll` using raw `libc` FFI calls, multiplexing
//! the two readiness sources the session loop cares about: the display
//! device's event stream and the user input stream. Each registered fd is
//! tagged with a [`ReadySource`] so the caller never touches raw epoll
//! event records.

use anyhow::{Context, Result};
use bitflags::bitflags;
use log::{debug, trace, warn};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

const EPOLL_CREATE_CLOEXEC: libc::c_int = libc::O_CLOEXEC;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EpollFlags: u32 {
        const EPOLLIN = libc::EPOLLIN as u32;
        const EPOLLERR = libc::EPOLLERR as u32;
        const EPOLLHUP = libc::EPOLLHUP as u32;
    }
}

/// Identifies which registered source became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadySource {
    /// The user input fd has at least one byte available.
    Input,
    /// The display device has completion events to dispatch.
    Display,
}

impl ReadySource {
    fn token(self) -> u64 {
        match self {
            ReadySource::Input => 0,
            ReadySource::Display => 1,
        }
    }

    fn from_token(token: u64) -> Option<Self> {
        match token {
            0 => Some(ReadySource::Input),
            1 => Some(ReadySource::Display),
            _ => None,
        }
    }
}

// One slot per registered source is enough; both ready in one wake is the
// maximum.
const MAX_WAIT_EVENTS: usize = 2;

#[derive(Debug)]
pub struct EventMonitor {
    epoll_fd: RawFd,
    event_buffer: [libc::epoll_event; MAX_WAIT_EVENTS],
}

impl EventMonitor {
    pub fn new() -> Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(EPOLL_CREATE_CLOEXEC) };
        if epoll_fd == -1 {
            return Err(io::Error::last_os_error())
                .context("Failed to create epoll instance (epoll_create1)");
        }
        debug!("EventMonitor created with epoll_fd: {}", epoll_fd);
        Ok(Self {
            epoll_fd,
            event_buffer: [unsafe { std::mem::zeroed() }; MAX_WAIT_EVENTS],
        })
    }

    /// Registers `fd` for read readiness, tagged with `source`.
    pub fn watch(&self, fd: RawFd, source: ReadySource) -> Result<()> {
        let mut event = libc::epoll_event {
            events: EpollFlags::EPOLLIN.bits(),
            u64: source.token(),
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) } == -1 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("Failed to add fd {} to epoll ({:?})", fd, source));
        }
        trace!("Watching fd {} as {:?} on epoll_fd {}", fd, source, self.epoll_fd);
        Ok(())
    }

    /// Blocks until a source is ready or `timeout` elapses. Returns the
    /// ready sources; an empty vec means the timeout elapsed (or the wait
    /// was interrupted by a signal, which callers treat the same way:
    /// re-check the deadline and wait again).
    pub fn wait(&mut self, timeout: Duration) -> Result<Vec<ReadySource>> {
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        trace!(
            "EventMonitor: waiting up to {}ms on epoll_fd {}",
            timeout_ms,
            self.epoll_fd
        );

        let num_events = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.event_buffer.as_mut_ptr(),
                MAX_WAIT_EVENTS as libc::c_int,
                timeout_ms,
            )
        };

        if num_events == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                trace!("EventMonitor: epoll_wait interrupted (EINTR)");
                return Ok(Vec::new());
            }
            return Err(err).context("epoll_wait failed in EventMonitor");
        }

        let ready = self.event_buffer[..num_events as usize]
            .iter()
            .filter_map(|event| {
                let token = event.u64;
                let source = ReadySource::from_token(token);
                if source.is_none() {
                    warn!("EventMonitor: unknown epoll token {}", token);
                }
                source
            })
            .collect();
        trace!("EventMonitor: ready sources: {:?}", ready);
        Ok(ready)
    }
}

impl Drop for EventMonitor {
    fn drop(&mut self) {
        if unsafe { libc::close(self.epoll_fd) } == -1 {
            warn!(
                "Failed to close epoll_fd {} in EventMonitor::drop: {}",
                self.epoll_fd,
                io::Error::last_os_error()
            );
        } else {
            debug!("Closed epoll_fd {} in EventMonitor::drop", self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_report_a_readable_fd_with_its_source_tag() -> Result<()> {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (reader, writer) = (fds[0], fds[1]);

        let mut monitor = EventMonitor::new()?;
        monitor.watch(reader, ReadySource::Display)?;

        // Nothing written yet: the wait times out empty.
        assert!(monitor.wait(Duration::from_millis(0))?.is_empty());

        let written =
            unsafe { libc::write(writer, b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(written, 1);

        let ready = monitor.wait(Duration::from_millis(100))?;
        assert_eq!(ready, vec![ReadySource::Display]);

        unsafe {
            libc::close(reader);
            libc::close(writer);
        }
        Ok(())
    }
}
