//! Stackful cooperative multitasking, a readiness reactor and a pipelined
//! HTTP/1.1 client.
//!
//! The crate is built from three tightly coupled layers:
//!
//! - [Fibers](fiber): stackful coroutines multiplexed onto a small pool of
//!   OS threads by a [scheduler](sched), with [synchronization
//!   primitives](fiber::sync) that suspend fibers instead of blocking
//!   threads.
//! - The [reactor](reactor): epoll/kqueue readiness and [timers](timer)
//!   translated into fiber wake-ups; [cooperative socket I/O](coio) that
//!   parks the calling fiber instead of its thread.
//! - The [HTTP client](http): a pipelined HTTP/1.1 connection that lets
//!   many fibers share one transport while preserving request order and
//!   recovering from partial failures.
//!
//! ```no_run
//! use strand::coio::CoIoStream;
//! use strand::http::{ClientConnection, Method, Request};
//! use strand::reactor::IoManager;
//!
//! fn main() -> strand::Result<()> {
//!     let io = IoManager::new()?;
//!     let handle = io.handle();
//!     io.schedule(move || {
//!         let stream = CoIoStream::connect(&handle, "example.com:80").unwrap();
//!         let conn = ClientConnection::new(stream);
//!         let request = conn
//!             .request(Request::with_host(Method::Get, "/", "example.com"))
//!             .unwrap();
//!         let response = request.response().unwrap();
//!         println!("{}", response.status);
//!     });
//!     io.dispatch();
//!     Ok(())
//! }
//! ```
//!
//! Unix only: Linux (epoll), macOS and the BSDs (kqueue).

pub mod clock;
pub mod coio;
pub mod error;
pub mod fiber;
pub mod http;
pub mod reactor;
pub mod sched;
pub mod stream;
pub mod timer;

pub use error::{Error, Result};
