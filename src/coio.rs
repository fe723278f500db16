//! Cooperative input/output.
//!
//! [`CoIoStream`] wraps a non-blocking socket (or pipe end, or anything
//! fd-shaped) and turns `WouldBlock` into a fiber suspension: the fd is
//! registered with the reactor and the fiber parks until readiness wakes it
//! up. The calling thread keeps running other fibers in the meantime.
//!
//! All blocking operations must run inside a fiber scheduled on the
//! [`IoManager`](crate::reactor::IoManager) the stream was created with.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::raw::c_void;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::time::Duration;

use crate::reactor::{Event, IoHandle};
use crate::stream::{CloseMode, Stream};

/// A full-duplex byte stream polled through the reactor.
pub struct CoIoStream {
    io: IoHandle,
    fd: RawFd,
}

impl CoIoStream {
    /// Wraps an fd-like object, switching it to non-blocking mode. Takes
    /// ownership of the descriptor.
    pub fn new<T>(io: &IoHandle, inner: T) -> io::Result<CoIoStream>
    where
        T: IntoRawFd,
    {
        let fd = inner.into_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        if flags < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(CoIoStream {
            io: io.clone(),
            fd,
        })
    }

    /// Connects to a remote TCP socket.
    pub fn connect<A: ToSocketAddrs>(io: &IoHandle, addr: A) -> io::Result<CoIoStream> {
        Self::new(io, TcpStream::connect(addr)?)
    }

    /// Opens a TCP connection to a remote host with a timeout.
    pub fn connect_timeout(
        io: &IoHandle,
        addr: &SocketAddr,
        timeout: Duration,
    ) -> io::Result<CoIoStream> {
        Self::new(io, TcpStream::connect_timeout(addr, timeout)?)
    }

    /// A connected pair of local streams (an `AF_UNIX` socketpair). Handy
    /// for tests and in-process plumbing.
    pub fn pair(io: &IoHandle) -> io::Result<(CoIoStream, CoIoStream)> {
        let mut fds = [0 as RawFd; 2];
        if unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        } != 0
        {
            return Err(io::Error::last_os_error());
        }
        let a = CoIoStream::new(io, OwnedFd(fds[0]))?;
        let b = CoIoStream::new(io, OwnedFd(fds[1]))?;
        Ok((a, b))
    }

    /// Pulls some bytes from the stream, suspending the calling fiber while
    /// nothing is available. `Ok(0)` means the peer closed its end. Errors
    /// with `TimedOut` when the timeout elapses first.
    pub fn read_with_timeout(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => self.wait(Event::READ, timeout)?,
                io::ErrorKind::Interrupted => {}
                _ => return Err(err),
            }
        }
    }

    /// Writes some bytes to the stream, suspending the calling fiber while
    /// the kernel buffer is full. Errors with `TimedOut` when the timeout
    /// elapses first.
    pub fn write_with_timeout(&self, buf: &[u8], timeout: Option<Duration>) -> io::Result<usize> {
        loop {
            let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const c_void, buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => self.wait(Event::WRITE, timeout)?,
                io::ErrorKind::Interrupted => {}
                _ => return Err(err),
            }
        }
    }

    fn wait(&self, event: Event, timeout: Option<Duration>) -> io::Result<()> {
        match self.io.wait_event_timeout(self.fd, event, timeout) {
            Ok(true) => Ok(()),
            Ok(false) => Err(io::ErrorKind::TimedOut.into()),
            Err(crate::Error::IO(e)) => Err(e),
            Err(other) => Err(io::Error::new(io::ErrorKind::Other, other)),
        }
    }
}

impl AsRawFd for CoIoStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for CoIoStream {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }
}

impl Stream for CoIoStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_with_timeout(buf, None)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.write_with_timeout(buf, None)
    }

    fn close(&self, mode: CloseMode) -> io::Result<()> {
        let how = match mode {
            CloseMode::Read => libc::SHUT_RD,
            CloseMode::Write => libc::SHUT_WR,
            CloseMode::Both => libc::SHUT_RDWR,
        };
        if unsafe { libc::shutdown(self.fd, how) } != 0 {
            let err = io::Error::last_os_error();
            // Shutting down an already-dead socket is not an event worth
            // reporting to the pipeline.
            if err.kind() == io::ErrorKind::NotConnected {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

impl Read for CoIoStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_with_timeout(buf, None)
    }
}

impl Write for CoIoStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_with_timeout(buf, None)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for &CoIoStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_with_timeout(buf, None)
    }
}

impl Write for &CoIoStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_with_timeout(buf, None)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for CoIoStream {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Minimal owner for raw fds produced by `socketpair`, so `CoIoStream::new`
/// can adopt them through `IntoRawFd`.
struct OwnedFd(RawFd);

impl IntoRawFd for OwnedFd {
    fn into_raw_fd(self) -> RawFd {
        self.0
    }
}
