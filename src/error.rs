//! Crate-wide error type. Every public fallible operation returns
//! `Result<T, Error>`; the variant names mirror spec §7 exactly so that
//! callers can match on cause.

use std::fmt;

/// The cause of a failed operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `bind`/`bindByUrl`/`bindByPort` target is not known to the cluster.
    #[error("node {0:?} is not registered with the cluster")]
    InvalidNode(String),

    /// A second `bind` was attempted without an intervening `shutdown`.
    #[error("server is already bound")]
    AlreadyBound,

    /// An API was called after the server began or finished shutting down.
    #[error("server has shut down")]
    NetworkShutdown,

    /// The TCP listener could not be bound or set to listen.
    #[error("failed to bind network listener: {0}")]
    NetworkBind(#[source] std::io::Error),

    /// `LoadBalancerTable::build` found partitions with no endpoints and
    /// `serve_requests_if_partition_missing` was false.
    #[error("cluster is missing endpoints for one or more partitions")]
    InvalidCluster,

    /// No handler is registered for the incoming message name.
    #[error("no handler registered for message {0:?}")]
    NoHandler(String),

    /// The user-registered handler returned an error.
    #[error("handler error: {0}")]
    HandlerError(String),

    /// The queue or service deadline was exceeded.
    #[error("request timed out")]
    Timeout,

    /// The executor's admission queue and worker pool are both saturated.
    #[error("request rejected: executor saturated")]
    Rejected,

    /// A call to the cluster coordinator failed. Recoverable when raised
    /// from a listener callback (logged and swallowed there).
    #[error("cluster coordinator unavailable: {0}")]
    ClusterUnavailable(String),
}

impl Error {
    /// A short, stable tag for the variant, independent of the message
    /// text — used when building an `ERROR`-status response envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidNode(_) => "InvalidNode",
            Error::AlreadyBound => "AlreadyBound",
            Error::NetworkShutdown => "NetworkShutdown",
            Error::NetworkBind(_) => "NetworkBind",
            Error::InvalidCluster => "InvalidCluster",
            Error::NoHandler(_) => "NoHandler",
            Error::HandlerError(_) => "HandlerError",
            Error::Timeout => "Timeout",
            Error::Rejected => "Rejected",
            Error::ClusterUnavailable(_) => "ClusterUnavailable",
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Display helper for attaching a `kind: message` style error string to a
/// response envelope's `errorMessage` field.
pub fn format_error_message(err: &Error) -> String {
    struct Wrap<'a>(&'a Error);
    impl fmt::Display for Wrap<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}: {}", self.0.kind(), self.0)
        }
    }
    Wrap(err).to_string()
}
