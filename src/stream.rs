//! The byte-stream contract consumed by the HTTP client.
//!
//! The pipelined connection never talks to sockets directly; it talks to a
//! [`Stream`]. The contract is deliberately small: positioned I/O, seeking
//! and vectored operations are not needed by a wire protocol. Methods take
//! `&self` because distinct fibers own the two directions of a pipelined
//! connection at the same time (one transmits, one receives) — an
//! implementation must support that, the way an fd does.
//!
//! [`CoIoStream`](crate::coio::CoIoStream) is the production implementation;
//! tests script their own.

use std::io;

/// Which half of a stream to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    Read,
    Write,
    Both,
}

/// A full-duplex byte stream.
///
/// `read` returning `Ok(0)` means end of stream. `write` may be partial;
/// use [`Stream::write_all`] when the whole buffer must land. Writes are
/// expected to be buffered upstream or to complete synchronously from the
/// calling fiber's point of view; `flush` pushes anything buffered to the
/// peer.
pub trait Stream: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn close(&self, mode: CloseMode) -> io::Result<()>;

    fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "stream refused to accept more bytes",
                    ))
                }
                Ok(n) => buf = &buf[n..],
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl<S: Stream + ?Sized> Stream for std::sync::Arc<S> {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn flush(&self) -> io::Result<()> {
        (**self).flush()
    }

    fn close(&self, mode: CloseMode) -> io::Result<()> {
        (**self).close(mode)
    }
}
