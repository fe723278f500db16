//! BSD/macOS readiness backend: kqueue + self-pipe tickles.
//!
//! Oneshot filters map directly onto the reactor's consume-on-fire
//! registrations. kqueue has no separate close filter; `CLOSE` interest is
//! folded into the read filter and reported when `EV_EOF` is seen.

use std::io;
use std::mem;
use std::os::raw::c_void;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use super::Event;

const WAIT_BATCH: usize = 256;

pub(crate) struct Poller {
    kq: RawFd,
    pipe_read: RawFd,
    pipe_write: RawFd,
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(kq) };
            return Err(err);
        }
        let (pipe_read, pipe_write) = (fds[0], fds[1]);
        set_nonblocking(pipe_read)?;
        set_nonblocking(pipe_write)?;

        let poller = Poller {
            kq,
            pipe_read,
            pipe_write,
        };
        // Persistent (non-oneshot) read filter on the tickle pipe.
        poller.change(pipe_read, libc::EVFILT_READ, libc::EV_ADD)?;
        Ok(poller)
    }

    fn change(&self, fd: RawFd, filter: i16, flags: u16) -> io::Result<()> {
        let change = libc::kevent {
            ident: fd as libc::uintptr_t,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        };
        let rc = unsafe { libc::kevent(self.kq, &change, 1, ptr::null_mut(), 0, ptr::null()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// `true` for each kqueue filter the event set maps to.
    fn filters(events: Event) -> (bool, bool) {
        (
            events.intersects(Event::READ | Event::CLOSE),
            events.contains(Event::WRITE),
        )
    }

    pub(crate) fn update(&self, fd: RawFd, old: Event, new: Event) -> io::Result<()> {
        let (old_read, old_write) = Self::filters(old);
        let (new_read, new_write) = Self::filters(new);

        if new_read && !old_read {
            self.change(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_ONESHOT)?;
        } else if old_read && !new_read {
            // A fired oneshot filter is already gone.
            if let Err(e) = self.change(fd, libc::EVFILT_READ, libc::EV_DELETE) {
                if e.raw_os_error() != Some(libc::ENOENT) {
                    return Err(e);
                }
            }
        }

        if new_write && !old_write {
            self.change(fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_ONESHOT)?;
        } else if old_write && !new_write {
            if let Err(e) = self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE) {
                if e.raw_os_error() != Some(libc::ENOENT) {
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    pub(crate) fn wait(
        &self,
        timeout: Option<Duration>,
        out: &mut Vec<(RawFd, Event)>,
    ) -> io::Result<()> {
        let ts;
        let ts_ptr = match timeout {
            None => ptr::null(),
            Some(d) => {
                ts = libc::timespec {
                    tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
                    tv_nsec: d.subsec_nanos() as _,
                };
                &ts as *const libc::timespec
            }
        };

        let mut buf: [libc::kevent; WAIT_BATCH] = unsafe { mem::zeroed() };
        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                buf.as_mut_ptr(),
                WAIT_BATCH as i32,
                ts_ptr,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for raw in buf.iter().take(n as usize) {
            let fd = raw.ident as RawFd;
            if fd == self.pipe_read {
                self.drain_tickles();
                continue;
            }

            let mut fired = Event::empty();
            match raw.filter {
                libc::EVFILT_READ => fired |= Event::READ | Event::CLOSE,
                libc::EVFILT_WRITE => fired |= Event::WRITE,
                _ => {}
            }
            if raw.flags & libc::EV_EOF != 0 {
                fired |= Event::CLOSE;
            }
            if raw.flags & libc::EV_ERROR != 0 {
                fired = Event::READ | Event::WRITE | Event::CLOSE;
            }
            out.push((fd, fired));
        }
        Ok(())
    }

    pub(crate) fn tickle(&self) {
        let byte = 1u8;
        unsafe {
            libc::write(self.pipe_write, &byte as *const u8 as *const c_void, 1);
        }
    }

    fn drain_tickles(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(self.pipe_read, buf.as_mut_ptr() as *mut c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.pipe_read);
            libc::close(self.pipe_write);
            libc::close(self.kq);
        }
    }
}
