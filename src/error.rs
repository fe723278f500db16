//! Error handling utils.
//!
//! The crate uses a single error enum for everything the public API can
//! fail with. Transport-level failures on a pipelined connection fan out to
//! every queued sibling request as [`Error::PriorRequestFailed`] (or
//! [`Error::ConnectionVoluntarilyClosed`] when the peer or the caller asked
//! for the shutdown); per-request failures stay with their request.
//!
//! Programmer errors — waiting on a fiber primitive outside a scheduler,
//! re-locking a fiber mutex from its owner, resuming a dead fiber — are not
//! represented here. Those panic.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] io::Error),

    /// The caller or the peer asked for the connection to close; queued and
    /// new requests fail fast with this error.
    #[error("connection was voluntarily closed")]
    ConnectionVoluntarilyClosed,

    /// Another request pipelined on the same connection failed; the wire is
    /// unusable for everything queued behind it.
    #[error("a prior pipelined request on this connection failed")]
    PriorRequestFailed,

    /// The message head (or trailer) could not be parsed.
    #[error("bad message header")]
    BadMessageHeader,

    /// The stream ended in the middle of a message head (or trailer).
    #[error("incomplete message header")]
    IncompleteMessageHeader,

    /// The head parsed, but the transfer-coding list is unusable.
    #[error("invalid transfer encoding: {0}")]
    InvalidTransferEncoding(String),

    /// A multipart content-type without a `boundary` parameter.
    #[error("multipart content-type is missing the boundary parameter")]
    MissingMultipartBoundary,

    /// The body stream ended before the declared entity length.
    #[error("stream ended before the declared entity length")]
    UnexpectedEof,

    /// This should only be used if the error doesn't fall into one of the
    /// above categories.
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

const _: () = {
    /// Assert Error implements Send + Sync
    const fn if_this_compiles_the_type_implements_send_and_sync<T: Send + Sync>() {}
    if_this_compiles_the_type_implements_send_and_sync::<Error>();
};

impl Error {
    #[inline(always)]
    pub fn other<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }

    /// Returns the name of the variant as it is spelled in the source code.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::IO(_) => "IO",
            Self::ConnectionVoluntarilyClosed => "ConnectionVoluntarilyClosed",
            Self::PriorRequestFailed => "PriorRequestFailed",
            Self::BadMessageHeader => "BadMessageHeader",
            Self::IncompleteMessageHeader => "IncompleteMessageHeader",
            Self::InvalidTransferEncoding(_) => "InvalidTransferEncoding",
            Self::MissingMultipartBoundary => "MissingMultipartBoundary",
            Self::UnexpectedEof => "UnexpectedEof",
            Self::Other(_) => "Other",
        }
    }

    /// `true` for the transport-level kinds that are fanned out to every
    /// request queued on a failed connection.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectionVoluntarilyClosed | Self::PriorRequestFailed
        )
    }
}
