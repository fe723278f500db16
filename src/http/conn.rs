//! The pipelined client connection.
//!
//! Many fibers issue requests concurrently on one connection; the wire is
//! strictly serial. Two FIFOs keep it honest:
//!
//! - Transmission: `pending` holds every in-flight request in issue order.
//!   The *transmission leader* — the first entry whose request is not fully
//!   transmitted — is the only fiber allowed to write. Everyone behind it
//!   parks until handed the wire.
//! - Reception: only the front of `pending` may read. A fiber asking for a
//!   response that is not yet at the front parks in `waiting` until the
//!   fiber ahead of it finishes its body and hands the stream over.
//!
//! One OS mutex guards all of this, held only across pointer shuffling —
//! never across I/O. Transport failures fan out: every parked fiber is
//! posted exactly once and observes a terminal error on wake-up.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak as SyncWeak};

use crate::error::{Error, Result};
use crate::fiber::{self, Fiber};
use crate::sched::{self, Scheduler};
use crate::stream::{CloseMode, Stream};

use super::proto::{self, BodyKind, Headers, Request, Response, Version};
use super::request::ClientRequest;

pub(crate) type RequestId = u64;

/// Everything the connection tracks about one request. Owned by the
/// connection, keyed by id; handles refer to it by `(Arc<ConnInner>, id)`.
pub(crate) struct ReqState {
    pub(crate) sched: Scheduler,
    pub(crate) fiber: Arc<Fiber>,
    pub(crate) head: Request,
    pub(crate) request_body: BodyKind,

    pub(crate) request_in_flight: bool,
    pub(crate) request_done: bool,
    pub(crate) response_in_flight: bool,
    pub(crate) response_headers_done: bool,
    pub(crate) response_done: bool,
    pub(crate) cancelled: bool,
    pub(crate) aborted: bool,

    pub(crate) response: Option<Response>,
    pub(crate) response_body: Option<BodyKind>,
    pub(crate) request_trailer: Option<Headers>,
    pub(crate) response_trailer: Option<Headers>,
    pub(crate) bad_trailer: bool,
    pub(crate) incomplete_trailer: bool,

    pub(crate) request_stream_taken: bool,
    pub(crate) response_stream_taken: bool,
}

impl ReqState {
    fn new(head: Request, request_body: BodyKind) -> Self {
        ReqState {
            sched: Scheduler::current(),
            fiber: fiber::current(),
            head,
            request_body,
            request_in_flight: false,
            request_done: false,
            response_in_flight: false,
            response_headers_done: false,
            response_done: false,
            cancelled: false,
            aborted: false,
            response: None,
            response_body: None,
            request_trailer: None,
            response_trailer: None,
            bad_trailer: false,
            incomplete_trailer: false,
            request_stream_taken: false,
            response_stream_taken: false,
        }
    }

    fn wake(&self) {
        self.sched.schedule_fiber(self.fiber.clone());
    }
}

pub(crate) struct Pipeline {
    pub(crate) states: HashMap<RequestId, ReqState>,
    /// In-flight requests in issue order. Front = the response currently
    /// (or next) being read.
    pub(crate) pending: VecDeque<RequestId>,
    /// Requests whose owner asked for its response before reaching the
    /// front.
    pub(crate) waiting: HashSet<RequestId>,

    pub(crate) allow_new_requests: bool,
    pub(crate) prior_request_failed: bool,
    pub(crate) prior_response_failed: bool,
    pub(crate) prior_response_closed: bool,
}

impl Pipeline {
    fn new() -> Self {
        Pipeline {
            states: HashMap::new(),
            pending: VecDeque::new(),
            waiting: HashSet::new(),
            allow_new_requests: true,
            prior_request_failed: false,
            prior_response_failed: false,
            prior_response_closed: false,
        }
    }

    /// The transmission leader: first pending request not fully
    /// transmitted. `None` means everything queued has been transmitted.
    pub(crate) fn current_request(&self) -> Option<RequestId> {
        self.pending
            .iter()
            .copied()
            .find(|id| !self.states[id].request_done)
    }

    fn discard(&mut self, id: RequestId) {
        self.pending.retain(|&x| x != id);
        self.waiting.remove(&id);
        self.states.remove(&id);
    }

    /// Failure fan-out, transmit side: every queued request that has not
    /// started transmitting is taken off the pipeline and its fiber posted;
    /// it observes the failure flags on wake-up.
    fn schedule_all_waiting_requests(&mut self) {
        debug_assert!(
            self.prior_request_failed || self.prior_response_failed || self.prior_response_closed
        );
        let doomed: Vec<RequestId> = self
            .pending
            .iter()
            .copied()
            .filter(|id| {
                let st = &self.states[id];
                !st.request_done && !st.request_in_flight
            })
            .collect();
        for id in doomed {
            self.pending.retain(|&x| x != id);
            self.states[&id].wake();
        }
    }

    /// Failure fan-out, receive side: every fiber parked for a response is
    /// posted (and taken off the pipeline); cancelled entries are dropped
    /// silently.
    fn schedule_all_waiting_responses(&mut self) {
        debug_assert!(self.prior_response_failed || self.prior_response_closed);
        let transmitted: Vec<RequestId> = self
            .pending
            .iter()
            .copied()
            .filter(|id| self.states[id].request_done)
            .collect();
        for id in transmitted {
            if self.waiting.remove(&id) {
                self.pending.retain(|&x| x != id);
                self.states[&id].wake();
            } else if self.states[&id].cancelled {
                self.pending.retain(|&x| x != id);
            }
        }
    }

    #[cfg(debug_assertions)]
    fn check_invariants(&self) {
        let mut seen_first_untransmitted = false;
        for (idx, id) in self.pending.iter().enumerate() {
            let st = &self.states[id];
            // A finished response leaves the pipeline immediately.
            assert!(!st.response_done);
            if idx > 0 {
                assert!(!st.response_in_flight);
            }
            if seen_first_untransmitted {
                assert!(!st.request_done);
                assert!(!st.request_in_flight);
            } else if !st.request_done {
                seen_first_untransmitted = true;
            }
            if st.request_in_flight {
                assert!(!st.request_done);
            }
        }
        let cursor_pos = self
            .pending
            .iter()
            .position(|id| !self.states[id].request_done)
            .unwrap_or(self.pending.len());
        for id in &self.waiting {
            let st = &self.states[id];
            assert!(!st.response_done);
            assert!(!st.response_in_flight);
            assert!(st.request_done);
            let pos = self
                .pending
                .iter()
                .position(|x| x == id)
                .expect("waiting entry not in pending");
            assert!(pos < cursor_pos);
        }
    }

    #[cfg(not(debug_assertions))]
    fn check_invariants(&self) {}
}

pub(crate) struct ConnInner {
    pub(crate) stream: Box<dyn Stream>,
    pub(crate) pipeline: StdMutex<Pipeline>,
    next_id: AtomicU64,
    /// Self-reference; the connection always lives behind an `Arc` and body
    /// streams need an owning handle to it.
    me: SyncWeak<ConnInner>,
}

impl ConnInner {
    fn arc(&self) -> Arc<ConnInner> {
        self.me.upgrade().expect("connection always lives behind an Arc")
    }
}

/// A pipelined HTTP/1.1 client connection over one byte stream.
///
/// Cheap to clone and fiber-safe: many concurrent fibers may issue requests
/// on the same connection. Requests go out in issue order; responses come
/// back in the same order, each delivered to the fiber that issued the
/// request.
///
/// ```no_run
/// use strand::http::{ClientConnection, Method, Request};
/// # fn doc(stream: strand::coio::CoIoStream) -> strand::Result<()> {
/// let conn = ClientConnection::new(stream);
/// let request = conn.request(Request::with_host(Method::Get, "/", "example.com"))?;
/// let response = request.response()?;
/// assert_eq!(response.status, 200);
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct ClientConnection {
    pub(crate) inner: Arc<ConnInner>,
}

impl ClientConnection {
    pub fn new(stream: impl Stream + 'static) -> Self {
        ClientConnection {
            inner: Arc::new_cyclic(|me| ConnInner {
                stream: Box::new(stream),
                pipeline: StdMutex::new(Pipeline::new()),
                next_id: AtomicU64::new(0),
                me: me.clone(),
            }),
        }
    }

    /// Queues a request. Returns once this fiber has the wire: either
    /// immediately (first in line) or after the requests ahead of it finish
    /// transmitting. The head is on the wire when this returns; a request
    /// with an entity body must then write it through
    /// [`ClientRequest::request_stream`].
    pub fn request(&self, head: Request) -> Result<ClientRequest> {
        let id = self.inner.start_request(head)?;
        Ok(ClientRequest::new(self.inner.clone(), id))
    }

    /// Whether this connection will accept another request: `false` once
    /// the peer signalled close, a prior request or response failed, or a
    /// queued request asked for `Connection: close`.
    pub fn new_requests_allowed(&self) -> bool {
        let p = self.inner.pipeline.lock().unwrap();
        p.allow_new_requests
            && !p.prior_response_closed
            && !p.prior_request_failed
            && !p.prior_response_failed
    }
}

impl ConnInner {
    fn start_request(&self, mut head: Request) -> Result<RequestId> {
        // Request heads we emit must be well-formed; garbage here is a bug
        // in the caller, not a peer problem.
        assert!(
            head.version == Version::HTTP_10 || head.version == Version::HTTP_11,
            "only HTTP/1.0 and HTTP/1.1 are supported"
        );
        assert!(!head.uri.is_empty(), "a request needs a URI");
        assert!(
            head.version != Version::HTTP_11 || head.headers.contains("Host"),
            "HTTP/1.1 requires a Host header"
        );
        let request_body = proto::request_body_kind(&head)?;

        // Keep-alive normalization, and whether this request closes the
        // connection once answered.
        let close = if head.version == Version::HTTP_10 {
            if head.headers.has_token("Connection", "close") {
                true
            } else {
                if !head.headers.has_token("Connection", "Keep-Alive") {
                    head.headers.add("Connection", "Keep-Alive");
                }
                false
            }
        } else {
            head.headers.has_token("Connection", "close")
        };

        let head_bytes = proto::serialize_request_head(&head)?;
        log::debug!("{} {} {}", head.method, head.uri, head.version);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut p = self.pipeline.lock().unwrap();
            p.check_invariants();
            if !p.allow_new_requests || p.prior_response_closed {
                return Err(Error::ConnectionVoluntarilyClosed);
            }
            if p.prior_request_failed || p.prior_response_failed {
                return Err(Error::PriorRequestFailed);
            }

            let first = p.current_request().is_none();
            let mut st = ReqState::new(head, request_body);
            if first {
                st.request_in_flight = true;
            }
            p.states.insert(id, st);
            p.pending.push_back(id);
            if close {
                p.allow_new_requests = false;
            }
            p.check_invariants();

            if !first {
                // Wait for the requests ahead of us to finish transmitting;
                // the guard is released only after this fiber has fully
                // switched out.
                sched::park_with(move || drop(p));
            }
            first
        };

        if !first {
            let mut p = self.pipeline.lock().unwrap();
            p.check_invariants();
            // Problems that happened while we were parked.
            if p.prior_response_closed {
                p.discard(id);
                return Err(Error::ConnectionVoluntarilyClosed);
            }
            if p.prior_request_failed || p.prior_response_failed {
                p.discard(id);
                return Err(Error::PriorRequestFailed);
            }
            debug_assert!(p.states[&id].request_in_flight);
        }

        // We are the transmission leader; the head goes on the wire outside
        // the lock.
        if let Err(e) = self.stream.write_all(&head_bytes) {
            let mut p = self.pipeline.lock().unwrap();
            p.check_invariants();
            p.prior_request_failed = true;
            p.discard(id);
            p.schedule_all_waiting_requests();
            p.check_invariants();
            return Err(e.into());
        }

        if request_body == BodyKind::None {
            self.schedule_next_request(id)?;
        }
        Ok(id)
    }

    /// Called by the transmission leader once its request (head and body)
    /// is fully written: hands the wire to the next queued request, or —
    /// when nothing is queued behind — flushes the stream first, holding
    /// the leadership so a request queued mid-flush cannot start writing
    /// until the flush lands.
    pub(crate) fn schedule_next_request(&self, id: RequestId) -> Result<()> {
        let mut flush = false;
        {
            let mut p = self.pipeline.lock().unwrap();
            p.check_invariants();
            debug_assert_eq!(p.current_request(), Some(id));
            {
                let st = &p.states[&id];
                debug_assert!(st.request_in_flight && !st.request_done);
            }
            if p.pending.back() == Some(&id) {
                // Keep the cursor on us through the flush below.
                flush = true;
            } else {
                self.advance_transmission(&mut p, id);
                p.check_invariants();
            }
        }

        if flush {
            if let Err(e) = self.stream.flush() {
                let mut p = self.pipeline.lock().unwrap();
                p.check_invariants();
                p.prior_request_failed = true;
                p.discard(id);
                p.schedule_all_waiting_requests();
                p.check_invariants();
                return Err(e.into());
            }
            let mut p = self.pipeline.lock().unwrap();
            p.check_invariants();
            // Someone may have queued up while we were flushing.
            self.advance_transmission(&mut p, id);
            p.check_invariants();
        }
        Ok(())
    }

    /// Marks `id` transmitted and posts the new leader's fiber, if any.
    fn advance_transmission(&self, p: &mut Pipeline, id: RequestId) {
        let st = p.states.get_mut(&id).unwrap();
        st.request_in_flight = false;
        st.request_done = true;
        if let Some(next) = p.current_request() {
            let nst = p.states.get_mut(&next).unwrap();
            nst.request_in_flight = true;
            nst.wake();
        }
    }

    /// Blocks the calling fiber until `id` is at the front of the pipeline
    /// and its response head has been parsed.
    pub(crate) fn ensure_response(&self, id: RequestId) -> Result<()> {
        {
            let p = self.pipeline.lock().unwrap();
            match p.states.get(&id) {
                Some(st) if st.response_headers_done => return Ok(()),
                Some(st) if st.aborted => return Err(Error::other("request was aborted")),
                // A cancelled request that is the front of the pipeline is
                // still drained (its reception slot is real); one that was
                // cancelled while queued has nothing coming.
                Some(st) if st.cancelled && !st.response_in_flight => {
                    return Err(Error::other("request was cancelled"))
                }
                Some(_) => {}
                None => return Err(Error::other("request is no longer tracked")),
            }
        }

        let wait = {
            let mut p = self.pipeline.lock().unwrap();
            p.check_invariants();
            if p.prior_response_failed || p.prior_response_closed {
                let closed = p.prior_response_closed;
                p.discard(id);
                p.check_invariants();
                return Err(if closed {
                    Error::ConnectionVoluntarilyClosed
                } else {
                    Error::PriorRequestFailed
                });
            }
            debug_assert!(!p.pending.is_empty());
            if p.pending.front() == Some(&id) {
                p.states.get_mut(&id).unwrap().response_in_flight = true;
                p.check_invariants();
                false
            } else {
                // Park until the requests ahead of us drain their
                // responses. Re-capture where we park so the hand-off posts
                // to the right place.
                let st = p.states.get_mut(&id).unwrap();
                st.sched = Scheduler::current();
                st.fiber = fiber::current();
                let inserted = p.waiting.insert(id);
                debug_assert!(inserted);
                p.check_invariants();
                sched::park_with(move || drop(p));
                true
            }
        };

        if wait {
            let mut p = self.pipeline.lock().unwrap();
            p.check_invariants();
            // Flags first: a failure fan-out wakes us *after* removing us
            // from the pipeline, so headship must not be asserted before
            // ruling failures out.
            if p.prior_response_closed {
                p.discard(id);
                return Err(Error::ConnectionVoluntarilyClosed);
            }
            if p.prior_response_failed {
                p.discard(id);
                return Err(Error::PriorRequestFailed);
            }
            debug_assert_eq!(p.pending.front(), Some(&id));
            debug_assert!(p.states[&id].response_in_flight);
        }

        // We own the receive side of the stream now.
        match self.read_response_head(id) {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut p = self.pipeline.lock().unwrap();
                p.check_invariants();
                p.prior_response_failed = true;
                debug_assert_eq!(p.pending.front(), Some(&id));
                p.pending.pop_front();
                if let Some(st) = p.states.get_mut(&id) {
                    st.response_in_flight = false;
                }
                p.schedule_all_waiting_requests();
                p.schedule_all_waiting_responses();
                p.check_invariants();
                Err(e)
            }
        }
    }

    fn read_response_head(&self, id: RequestId) -> Result<()> {
        let head = proto::read_response_head(&*self.stream)?;
        log::debug!("{} {} {}", head.version, head.status, head.reason);

        let mut close = match head.version {
            Version::HTTP_10 => !head.headers.has_token("Connection", "Keep-Alive"),
            Version::HTTP_11 => head.headers.has_token("Connection", "close"),
            _ => return Err(Error::BadMessageHeader),
        };

        let method = {
            let p = self.pipeline.lock().unwrap();
            p.states[&id].head.method
        };
        let body = proto::response_body_kind(method, head.status, &head.headers)?;
        if body == BodyKind::ToEof {
            // A body whose length cannot be determined is delimited by
            // connection close.
            close = true;
        }

        if close {
            let mut p = self.pipeline.lock().unwrap();
            p.check_invariants();
            p.prior_response_closed = true;
            p.schedule_all_waiting_requests();
            p.schedule_all_waiting_responses();
            p.check_invariants();
        }

        {
            let mut p = self.pipeline.lock().unwrap();
            let st = p.states.get_mut(&id).unwrap();
            st.response = Some(head);
            st.response_body = Some(body);
            st.response_headers_done = true;
        }

        if body == BodyKind::None {
            if close {
                let _ = self.stream.close(CloseMode::Both);
            } else {
                self.schedule_next_response(id);
            }
        }
        Ok(())
    }

    /// Called when the response body of the front request has been fully
    /// consumed: retires it and hands the receive side to the next in
    /// line. Closes the stream when a prior close/failure was deferred
    /// until this response drained.
    pub(crate) fn schedule_next_response(&self, id: RequestId) {
        let mut close = false;
        let mut finish_next = None;
        let mut wake = None;
        {
            let mut p = self.pipeline.lock().unwrap();
            p.check_invariants();
            debug_assert_eq!(p.pending.front(), Some(&id));
            {
                let st = p.states.get_mut(&id).unwrap();
                debug_assert!(st.response_in_flight && !st.response_done);
                st.response_in_flight = false;
                st.response_done = true;
            }
            p.pending.pop_front();

            if p.prior_response_closed || p.prior_response_failed {
                close = true;
            }
            if let Some(&next) = p.pending.front() {
                let cancelled = p.states[&next].cancelled;
                if cancelled {
                    debug_assert!(!p.waiting.contains(&next));
                    p.states.get_mut(&next).unwrap().response_in_flight = true;
                    // Nobody is coming back for it; drain it ourselves
                    // below so the pipeline keeps moving.
                    finish_next = Some(next);
                } else if p.waiting.remove(&next) {
                    let nst = p.states.get_mut(&next).unwrap();
                    nst.response_in_flight = true;
                    wake = Some((nst.sched.clone(), nst.fiber.clone()));
                }
            }
            p.check_invariants();
        }

        if let Some((sched, fiber)) = wake {
            sched.schedule_fiber(fiber);
        }
        if let Some(next) = finish_next {
            // With a close pending there is nothing left to drain for; the
            // shutdown below ends the cancelled entry too.
            if !close {
                if let Err(e) = self.finish(next) {
                    log::debug!("draining a cancelled response failed: {}", e);
                }
            }
        }
        if close {
            let _ = self.stream.close(CloseMode::Both);
        }
    }

    /// Cooperative or hard cancellation (mirrors the two modes of
    /// [`ClientRequest::cancel`]).
    pub(crate) fn cancel(&self, id: RequestId, abort: bool) {
        let mut finish_after = false;
        {
            let mut p = self.pipeline.lock().unwrap();
            p.check_invariants();
            match p.states.get_mut(&id) {
                Some(st) => {
                    if st.aborted || (st.cancelled && !abort) {
                        return;
                    }
                    st.cancelled = true;
                }
                None => return,
            }
            let (request_in_flight, response_in_flight, request_done, response_headers_done) = {
                let st = &p.states[&id];
                (
                    st.request_in_flight,
                    st.response_in_flight,
                    st.request_done,
                    st.response_headers_done,
                )
            };

            if !abort && !request_in_flight && !response_in_flight {
                if !request_done {
                    // Nothing of it has touched the wire; just abandon it.
                    p.pending.retain(|&x| x != id);
                }
                p.check_invariants();
                return;
            }

            if !abort && request_done {
                debug_assert!(response_in_flight);
                // With the headers already parsed the body can be drained
                // politely; without them the wire position is unknown and
                // only an abort remains.
                if response_headers_done {
                    finish_after = true;
                }
            }

            if !finish_after {
                p.states.get_mut(&id).unwrap().aborted = true;
                if request_done {
                    p.prior_response_failed = true;
                } else {
                    p.prior_request_failed = true;
                }
                p.schedule_all_waiting_requests();
                let _ = self.stream.close(CloseMode::Read);
                if request_done {
                    p.schedule_all_waiting_responses();
                    let _ = self.stream.close(CloseMode::Both);
                }
                p.check_invariants();
            }
        }
        if finish_after {
            if let Err(e) = self.finish(id) {
                log::debug!("draining a cancelled response failed: {}", e);
            }
        }
    }

    /// Politely completes a request: drains its response body to nowhere so
    /// the next pipelined response becomes readable.
    pub(crate) fn finish(&self, id: RequestId) -> Result<()> {
        let request_done = {
            let p = self.pipeline.lock().unwrap();
            match p.states.get(&id) {
                Some(st) => st.request_done,
                None => return Ok(()),
            }
        };
        if !request_done {
            self.cancel(id, true);
            return Ok(());
        }

        self.ensure_response(id)?;
        let (body, reader_outstanding) = {
            let p = self.pipeline.lock().unwrap();
            let st = &p.states[&id];
            (st.response_body.unwrap_or(BodyKind::None), st.response_stream_taken)
        };
        if body == BodyKind::None || reader_outstanding {
            // No body to drain, or a reader exists elsewhere and its drop
            // will drain the rest.
            return Ok(());
        }

        let mut reader = super::request::response_body(self.arc(), id, body);
        let mut sink = [0u8; 4096];
        loop {
            match reader.read_some(&mut sink) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Drops the book-keeping of a retired request. Handles call this on
    /// drop; an unfinished request stays tracked by the pipeline.
    pub(crate) fn release(&self, id: RequestId) {
        let mut p = self.pipeline.lock().unwrap();
        let retired = p.states.get(&id).map_or(false, |st| st.response_done);
        if retired {
            debug_assert!(!p.pending.contains(&id));
            p.states.remove(&id);
        }
    }
}
