use thiserror::Error;

/// Possible reasons why an operator invocation may fail.
#[derive(Debug, Error, PartialEq)]
pub enum OpError {
    /// An input tensor has an invalid shape, an attribute has an invalid
    /// value, or the two are inconsistent with each other.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested configuration is recognized but not supported yet.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// Allocating scratch space failed.
    #[error("out of memory")]
    OutOfMemory,

    /// A worker task panicked or an internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}
