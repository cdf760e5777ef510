//! Unified error type.

/// The error type returned by liner's fallible operations.
///
/// Application-level outcomes (401, 404, 429, 500, etc.) are expressed as
/// [`Response`](crate::Response) values, not as `Error`s. This type surfaces
/// infrastructure failures: binding a port, accepting a connection, opening
/// the log file, or asking a writer for a capability it does not have.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The wrapped response writer does not offer this optional capability.
    #[error("{0} not supported by the underlying writer")]
    Unsupported(&'static str),

    #[error("log subscriber: {0}")]
    Subscriber(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}
