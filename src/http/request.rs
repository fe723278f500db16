//! Per-request lifecycle: the [`ClientRequest`] handle and the request /
//! response body streams.
//!
//! Body streams are where the pipeline hand-offs hook in: closing a request
//! body marks the request transmitted (writing the chunked trailer on the
//! way out) and wakes the next writer; reading a response body to its end
//! parses the trailer and wakes the next reader.

use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::error::{Error, Result};

use super::conn::{ConnInner, RequestId};
use super::proto::{self, BodyKind, Headers, Request, Response};

/// Handle to one pipelined request.
///
/// Created by [`ClientConnection::request`](super::ClientConnection::request),
/// on which the request head is already on the wire. A request with an
/// entity body must write it through [`request_stream`](Self::request_stream)
/// and close it; [`response`](Self::response) then blocks the calling fiber
/// until this request's turn in the response order comes up.
pub struct ClientRequest {
    conn: Arc<ConnInner>,
    id: RequestId,
}

impl ClientRequest {
    pub(crate) fn new(conn: Arc<ConnInner>, id: RequestId) -> Self {
        ClientRequest { conn, id }
    }

    /// The request head as transmitted (after keep-alive normalization).
    pub fn request_head(&self) -> Request {
        let p = self.conn.pipeline.lock().unwrap();
        p.states[&self.id].head.clone()
    }

    /// The writer for the request's entity body. May be taken once, and
    /// only for a request that declared a body (`Content-Length` or
    /// chunked transfer-coding). The request is not considered transmitted
    /// until [`RequestBody::close`].
    pub fn request_stream(&self) -> RequestBody {
        let mut p = self.conn.pipeline.lock().unwrap();
        let st = p.states.get_mut(&self.id).expect("request is no longer tracked");
        assert!(!st.request_done, "request body already transmitted");
        assert!(
            st.request_body != BodyKind::None,
            "request declared no entity body"
        );
        assert!(!st.request_stream_taken, "request body stream already taken");
        st.request_stream_taken = true;
        RequestBody {
            conn: self.conn.clone(),
            id: self.id,
            kind: st.request_body,
            written: 0,
            closed: false,
        }
    }

    /// Installs trailer headers to be sent after a chunked request body.
    pub fn set_request_trailer(&self, trailer: Headers) {
        let mut p = self.conn.pipeline.lock().unwrap();
        let st = p.states.get_mut(&self.id).expect("request is no longer tracked");
        assert!(
            st.request_body == BodyKind::Chunked,
            "trailers require a chunked request body"
        );
        st.request_trailer = Some(trailer);
    }

    /// The response head. Blocks the calling fiber until every earlier
    /// response on the connection has been consumed and this one's head is
    /// parsed.
    pub fn response(&self) -> Result<Response> {
        self.conn.ensure_response(self.id)?;
        let p = self.conn.pipeline.lock().unwrap();
        Ok(p.states[&self.id].response.clone().expect("head was parsed"))
    }

    /// Whether the response carries an entity body. Blocks like
    /// [`response`](Self::response).
    pub fn has_response_body(&self) -> Result<bool> {
        self.conn.ensure_response(self.id)?;
        let p = self.conn.pipeline.lock().unwrap();
        Ok(p.states[&self.id].response_body.unwrap_or(BodyKind::None) != BodyKind::None)
    }

    /// The reader for the response's entity body. May be taken once. The
    /// next pipelined response becomes readable only after this body is
    /// read to its end (or the reader is dropped, which drains it).
    pub fn response_stream(&self) -> Result<ResponseBody> {
        self.conn.ensure_response(self.id)?;
        let mut p = self.conn.pipeline.lock().unwrap();
        let st = p.states.get_mut(&self.id).expect("request is no longer tracked");
        assert!(!st.response_stream_taken, "response body stream already taken");
        let kind = st.response_body.unwrap_or(BodyKind::None);
        assert!(kind != BodyKind::None, "response carries no entity body");
        st.response_stream_taken = true;
        Ok(response_body(self.conn.clone(), self.id, kind))
    }

    /// Trailer headers of a chunked response; available once the body has
    /// been read to its end.
    pub fn response_trailer(&self) -> Result<Headers> {
        let p = self.conn.pipeline.lock().unwrap();
        let st = match p.states.get(&self.id) {
            Some(st) => st,
            None => return Err(Error::other("request is no longer tracked")),
        };
        if st.bad_trailer {
            return Err(Error::BadMessageHeader);
        }
        if st.incomplete_trailer {
            return Err(Error::IncompleteMessageHeader);
        }
        assert!(st.response_done, "response body not yet consumed");
        Ok(st.response_trailer.clone().unwrap_or_default())
    }

    /// Cancels the request. Without `abort` the cancellation is
    /// cooperative: whatever is on the wire is allowed to complete or
    /// drain. With `abort` the wire position becomes ambiguous, so the
    /// whole connection is torn down and every sibling request fails.
    pub fn cancel(&self, abort: bool) {
        self.conn.cancel(self.id, abort);
    }

    /// Reads and discards the rest of the response so the connection can
    /// move on to the next pipelined request.
    pub fn finish(&self) -> Result<()> {
        self.conn.finish(self.id)
    }
}

impl Drop for ClientRequest {
    fn drop(&mut self) {
        self.conn.release(self.id);
    }
}

////////////////////////////////////////////////////////////////////////////////
// RequestBody
////////////////////////////////////////////////////////////////////////////////

/// Writer for a request's entity body.
///
/// For a `Content-Length` body, exactly that many bytes must be written
/// before [`close`](Self::close); fewer is an [`Error::UnexpectedEof`] and
/// aborts the connection. For a chunked body every write becomes one chunk
/// and `close` emits the final chunk plus any installed trailer.
///
/// Dropping the writer without closing it aborts the connection: the peer
/// cannot tell a truncated body from a complete one.
pub struct RequestBody {
    conn: Arc<ConnInner>,
    id: RequestId,
    kind: BodyKind,
    written: u64,
    closed: bool,
}

impl RequestBody {
    /// Writes the whole buffer (one chunk, for chunked bodies).
    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        assert!(!self.closed, "request body already closed");
        if buf.is_empty() {
            return Ok(());
        }
        match self.kind {
            BodyKind::Length(total) => {
                if self.written + buf.len() as u64 > total {
                    return Err(Error::other(
                        "request body exceeds the declared Content-Length",
                    ));
                }
                self.transmit(buf)?;
            }
            BodyKind::Chunked => {
                let header = proto::chunk_header(buf.len());
                self.transmit(header.as_bytes())?;
                self.transmit(buf)?;
                self.transmit(b"\r\n")?;
            }
            BodyKind::None | BodyKind::ToEof => unreachable!("no writer exists for these"),
        }
        self.written += buf.len() as u64;
        Ok(())
    }

    /// Completes the body: validates the declared length, writes the final
    /// chunk and trailer when chunked, and hands the wire to the next
    /// queued request.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let BodyKind::Length(total) = self.kind {
            if self.written < total {
                self.conn.cancel(self.id, true);
                return Err(Error::UnexpectedEof);
            }
        }
        if self.kind == BodyKind::Chunked {
            self.transmit(b"0\r\n")?;
            let trailer = {
                let mut p = self.conn.pipeline.lock().unwrap();
                p.states
                    .get_mut(&self.id)
                    .and_then(|st| st.request_trailer.take())
            };
            let mut tail = Vec::new();
            if let Some(trailer) = trailer {
                for (name, value) in trailer.iter() {
                    tail.extend_from_slice(name.as_bytes());
                    tail.extend_from_slice(b": ");
                    tail.extend_from_slice(value.as_bytes());
                    tail.extend_from_slice(b"\r\n");
                }
            }
            tail.extend_from_slice(b"\r\n");
            self.transmit(&tail)?;
        }

        self.conn.schedule_next_request(self.id)
    }

    fn transmit(&mut self, bytes: &[u8]) -> Result<()> {
        if let Err(e) = self.conn.stream.write_all(bytes) {
            self.conn.cancel(self.id, true);
            return Err(e.into());
        }
        Ok(())
    }
}

impl Write for RequestBody {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        RequestBody::write_all(self, buf).map_err(into_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn.stream.flush()
    }
}

impl Drop for RequestBody {
    fn drop(&mut self) {
        if !self.closed {
            self.conn.cancel(self.id, true);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// ResponseBody
////////////////////////////////////////////////////////////////////////////////

pub(crate) fn response_body(conn: Arc<ConnInner>, id: RequestId, kind: BodyKind) -> ResponseBody {
    let remaining = match kind {
        BodyKind::Length(n) => n,
        _ => 0,
    };
    ResponseBody {
        conn,
        id,
        kind,
        remaining,
        chunk_remaining: 0,
        first_chunk: true,
        done: false,
    }
}

/// Reader for a response's entity body.
///
/// Reaching the end of the body (`Ok(0)`) parses the chunked trailer, if
/// any, and hands the receive side of the connection to the next pipelined
/// request. Dropping a half-read body drains the remainder first.
pub struct ResponseBody {
    conn: Arc<ConnInner>,
    id: RequestId,
    kind: BodyKind,
    /// Bytes left of a `Content-Length` body.
    remaining: u64,
    /// Bytes left of the current chunk.
    chunk_remaining: u64,
    first_chunk: bool,
    done: bool,
}

impl ResponseBody {
    /// Pulls some body bytes; `Ok(0)` is the end of the body.
    pub fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        match self.read_inner(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                // The wire position is lost; nothing behind us can be
                // salvaged.
                self.done = true;
                self.conn.cancel(self.id, true);
                Err(e)
            }
        }
    }

    fn read_inner(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.kind {
            BodyKind::Length(_) => {
                if self.remaining == 0 {
                    return self.complete();
                }
                let want = (buf.len() as u64).min(self.remaining) as usize;
                let n = self.conn.stream.read(&mut buf[..want])?;
                if n == 0 {
                    return Err(Error::UnexpectedEof);
                }
                self.remaining -= n as u64;
                if self.remaining == 0 {
                    // The body is complete; retire it eagerly so `Ok(0)` is
                    // not required to advance the pipeline.
                    self.complete()?;
                }
                Ok(n)
            }
            BodyKind::Chunked => {
                if self.chunk_remaining == 0 {
                    if !self.first_chunk {
                        self.read_chunk_terminator()?;
                    }
                    self.first_chunk = false;
                    self.chunk_remaining = proto::read_chunk_size(&*self.conn.stream)?;
                    if self.chunk_remaining == 0 {
                        return self.complete();
                    }
                }
                let want = (buf.len() as u64).min(self.chunk_remaining) as usize;
                let n = self.conn.stream.read(&mut buf[..want])?;
                if n == 0 {
                    return Err(Error::UnexpectedEof);
                }
                self.chunk_remaining -= n as u64;
                Ok(n)
            }
            BodyKind::ToEof => {
                let n = self.conn.stream.read(buf)?;
                if n == 0 {
                    return self.complete();
                }
                Ok(n)
            }
            BodyKind::None => Ok(0),
        }
    }

    /// Consumes the CRLF that terminates every chunk's data.
    fn read_chunk_terminator(&mut self) -> Result<()> {
        let mut crlf = [0u8; 2];
        let mut got = 0;
        while got < 2 {
            let n = self.conn.stream.read(&mut crlf[got..])?;
            if n == 0 {
                return Err(Error::UnexpectedEof);
            }
            got += n;
        }
        if &crlf != b"\r\n" {
            return Err(Error::BadMessageHeader);
        }
        Ok(())
    }

    /// End of body: parse the trailer when chunked, then hand the receive
    /// side over. Always returns `Ok(0)` for the caller's read loop.
    fn complete(&mut self) -> Result<usize> {
        if self.done {
            return Ok(0);
        }
        self.done = true;

        if self.kind == BodyKind::Chunked {
            match proto::read_header_fields(&*self.conn.stream) {
                Ok(trailer) => {
                    let mut p = self.conn.pipeline.lock().unwrap();
                    if let Some(st) = p.states.get_mut(&self.id) {
                        st.response_trailer = Some(trailer);
                    }
                }
                Err(e) => {
                    {
                        let mut p = self.conn.pipeline.lock().unwrap();
                        if let Some(st) = p.states.get_mut(&self.id) {
                            match e {
                                Error::IncompleteMessageHeader => st.incomplete_trailer = true,
                                _ => st.bad_trailer = true,
                            }
                        }
                    }
                    self.conn.cancel(self.id, true);
                    return Ok(0);
                }
            }
        }

        self.conn.schedule_next_response(self.id);
        Ok(0)
    }
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_some(buf).map_err(into_io)
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // Drain the remainder so the next pipelined response stays
        // readable; errors already tore the connection down inside
        // read_some.
        let mut sink = [0u8; 4096];
        loop {
            match self.read_some(&mut sink) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }
}

fn into_io(e: Error) -> io::Error {
    match e {
        Error::IO(e) => e,
        Error::UnexpectedEof => io::Error::new(io::ErrorKind::UnexpectedEof, e),
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}
