//! Linux readiness backend: epoll + eventfd tickles.

use std::io;
use std::mem;
use std::os::raw::c_void;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::Event;

/// Marker in `epoll_event.u64` for the tickle eventfd.
const TICKLE_TOKEN: u64 = u64::MAX;

const WAIT_BATCH: usize = 256;

pub(crate) struct Poller {
    epfd: RawFd,
    eventfd: RawFd,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }

        let eventfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if eventfd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err);
        }

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: TICKLE_TOKEN,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, eventfd, &mut ev) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(eventfd);
                libc::close(epfd);
            }
            return Err(err);
        }

        Ok(Poller { epfd, eventfd })
    }

    fn mask(events: Event) -> u32 {
        let mut mask = 0u32;
        if events.contains(Event::READ) {
            mask |= libc::EPOLLIN as u32;
        }
        if events.contains(Event::WRITE) {
            mask |= libc::EPOLLOUT as u32;
        }
        if events.contains(Event::CLOSE) {
            mask |= libc::EPOLLRDHUP as u32;
        }
        mask
    }

    /// Rewrites the interest mask of `fd` from `old` to `new`.
    pub(crate) fn update(&self, fd: RawFd, old: Event, new: Event) -> io::Result<()> {
        let op = if old.is_empty() && !new.is_empty() {
            libc::EPOLL_CTL_ADD
        } else if !old.is_empty() && new.is_empty() {
            libc::EPOLL_CTL_DEL
        } else if old == new {
            return Ok(());
        } else {
            libc::EPOLL_CTL_MOD
        };

        let mut ev = libc::epoll_event {
            events: Self::mask(new),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocks until readiness, a tickle, or the timeout (`None` = forever).
    /// Appends `(fd, fired)` pairs to `out`; tickles are drained internally.
    pub(crate) fn wait(
        &self,
        timeout: Option<Duration>,
        out: &mut Vec<(RawFd, Event)>,
    ) -> io::Result<()> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => {
                // Round up so a 500us timer does not busy-loop at 0ms.
                let ms = (d.as_micros() + 999) / 1000;
                ms.min(i32::MAX as u128) as i32
            }
        };

        let mut buf: [libc::epoll_event; WAIT_BATCH] = unsafe { mem::zeroed() };
        let n = unsafe {
            libc::epoll_wait(self.epfd, buf.as_mut_ptr(), WAIT_BATCH as i32, timeout_ms)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for raw in buf.iter().take(n as usize) {
            let data = raw.u64;
            let bits = raw.events;
            if data == TICKLE_TOKEN {
                self.drain_tickles();
                continue;
            }

            let mut fired = Event::empty();
            if bits & libc::EPOLLIN as u32 != 0 {
                fired |= Event::READ;
            }
            if bits & libc::EPOLLOUT as u32 != 0 {
                fired |= Event::WRITE;
            }
            if bits & libc::EPOLLRDHUP as u32 != 0 {
                fired |= Event::CLOSE;
            }
            // An error or hangup wakes every registration on the fd.
            if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                fired = Event::READ | Event::WRITE | Event::CLOSE;
            }
            out.push((data as RawFd, fired));
        }
        Ok(())
    }

    /// Forces a blocked [`Poller::wait`] on another thread to return.
    /// Tickles coalesce: the eventfd counter is drained in one read.
    pub(crate) fn tickle(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.eventfd, &one as *const u64 as *const c_void, 8);
        }
    }

    fn drain_tickles(&self) {
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe { libc::read(self.eventfd, buf.as_mut_ptr() as *mut c_void, 8) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.eventfd);
            libc::close(self.epfd);
        }
    }
}
