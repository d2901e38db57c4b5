use crate::sandbox::SandboxError;
use crate::store::StoreError;

/// Error type for all overlay driver operations.
///
/// Every variant is `Clone`: the one-shot init guards store the outcome of the
/// single initialization attempt and hand the same value to every racing
/// caller, so wrapped netlink/io errors are carried as strings.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OverlayError {
    /// Malformed caller input (empty network id, bad option value)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Lookup of an unknown network
    #[error("could not find network with id {0}")]
    NotFound(String),
    /// Host-mode subnet overlap with local routes or nameservers
    #[error("{0}")]
    Conflict(String),
    /// The VNI allocator has no free identifiers left
    #[error("vxlan id space exhausted")]
    ResourceExhausted,
    /// Datastore failure, including CAS conflicts surfaced to the caller
    #[error("datastore error: {0}")]
    Store(#[from] StoreError),
    /// Netlink device operation failed
    #[error("netlink error: {0}")]
    Netlink(String),
    /// Sandbox facade operation failed
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
    /// Unexpected decode result or invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<rtnetlink::Error> for OverlayError {
    fn from(e: rtnetlink::Error) -> Self {
        OverlayError::Netlink(e.to_string())
    }
}

impl From<std::io::Error> for OverlayError {
    fn from(e: std::io::Error) -> Self {
        OverlayError::Netlink(e.to_string())
    }
}

pub type OverlayResult<T> = Result<T, OverlayError>;
