//! Pipelined HTTP/1.1 client.
//!
//! The connection object is fiber-safe: it is normal and encouraged to
//! share one [`ClientConnection`] across many concurrent fibers. Requests
//! are pipelined through the same stream — transmission of later requests
//! overlaps with reception of earlier responses — while both the wire order
//! and the response delivery order stay the issue order. Each fiber gets
//! back exactly its own response.
//!
//! Failure on a shared wire is a shared event: when a request or response
//! breaks the transport, every request queued behind it is woken with
//! [`PriorRequestFailed`](crate::Error::PriorRequestFailed) (or
//! [`ConnectionVoluntarilyClosed`](crate::Error::ConnectionVoluntarilyClosed)
//! when the close was asked for), and the stream is shut down once the
//! response being read, if any, has drained.
//!
//! The connection speaks to its transport through the
//! [`Stream`](crate::stream::Stream) contract; in production that is a
//! [`CoIoStream`](crate::coio::CoIoStream) riding the reactor.

mod conn;
pub mod proto;
mod request;

pub use conn::ClientConnection;
pub use proto::{multipart_boundary, Headers, Method, Request, Response, Version};
pub use request::{ClientRequest, RequestBody, ResponseBody};
