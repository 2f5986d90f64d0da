//! Error Types
//!
//! Every fallible operation in the crate returns [`Error`]. The variants map
//! onto four wire-level error codes through [`Error::code`], which is what the
//! command layer turns into a protocol error response.

use crate::graph::NodeId;
use crate::subscriptions::{MarkerId, SubscriptionId};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the subscription engine and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The node does not exist in the graph.
    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    /// The subscription does not exist.
    #[error("subscription {0} not found")]
    SubscriptionNotFound(SubscriptionId),

    /// The marker does not exist.
    #[error("marker {0} not found")]
    MarkerNotFound(MarkerId),

    /// A marker with the same id is already registered.
    #[error("marker {0} already exists")]
    MarkerExists(MarkerId),

    /// A subscription with the same id is already registered.
    #[error("subscription {0} already exists")]
    SubscriptionExists(SubscriptionId),

    /// Malformed marker parameters or request arguments.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested traversal or marker combination is not supported.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The predicate collaborator failed to compile or evaluate an expression.
    #[error("expression error: {0}")]
    Expression(String),
}

/// Wire-level error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// `ENOENT`
    NotFound,
    /// `EEXIST`
    Exists,
    /// `EINVAL`
    Invalid,
    /// `ENOTSUP`
    NotSupported,
}

impl ErrorCode {
    /// The errno-style name reported to clients.
    pub fn errno_name(self) -> &'static str {
        match self {
            Self::NotFound => "ENOENT",
            Self::Exists => "EEXIST",
            Self::Invalid => "EINVAL",
            Self::NotSupported => "ENOTSUP",
        }
    }
}

impl Error {
    /// Shorthand for [`Error::InvalidArgument`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }

    /// Shorthand for [`Error::NotSupported`].
    pub fn not_supported(reason: impl Into<String>) -> Self {
        Self::NotSupported(reason.into())
    }

    /// Classify the error for the wire protocol.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NodeNotFound(_) | Self::SubscriptionNotFound(_) | Self::MarkerNotFound(_) => {
                ErrorCode::NotFound
            }
            Self::MarkerExists(_) | Self::SubscriptionExists(_) => ErrorCode::Exists,
            Self::InvalidArgument(_) | Self::Expression(_) => ErrorCode::Invalid,
            Self::NotSupported(_) => ErrorCode::NotSupported,
        }
    }

    /// True for any `ENOENT` class error.
    ///
    /// Traversals that fail this way during marker placement or clearing are
    /// swallowed: a marker may watch a node that does not exist yet.
    pub fn is_not_found(&self) -> bool {
        self.code() == ErrorCode::NotFound
    }
}
