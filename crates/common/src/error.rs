use thiserror::Error;

/// Canonical SpanFlow error taxonomy used across crates.
///
/// Classification guidance:
/// - [`SfqError::Unsupported`]: valid queries the distributed planner
///   intentionally refuses; the message surfaces verbatim to the client
/// - [`SfqError::UnknownAggregate`]: an aggregate function name with no
///   engine enum counterpart
/// - [`SfqError::Resolver`]: range resolver / leaseholder lookup failures,
///   propagated unchanged so the caller can decide retry policy
/// - [`SfqError::Internal`]: invalid-plan conditions that indicate a bug or a
///   misconfigured cluster (address collisions, descriptor inconsistencies)
/// - [`SfqError::Canceled`]: the planning context was canceled at an I/O
///   suspension point
///
/// Cluster-transient conditions (unhealthy peer, incompatible version) are
/// recovered by planning around the node and never appear here.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SfqError {
    /// Query shape the distributed planner does not handle.
    ///
    /// Examples:
    /// - subqueries and blacklisted functions inside expressions
    /// - mutations and session-variable writes
    /// - tuple-typed render outputs
    #[error("query not supported: {0}")]
    Unsupported(String),

    /// Aggregate function name with no engine counterpart.
    #[error("unknown aggregate {0}")]
    UnknownAggregate(String),

    /// Query value/shape errors discovered during planning.
    ///
    /// Examples:
    /// - negative LIMIT/OFFSET values
    /// - non-constant LIMIT/OFFSET expressions
    #[error("planning error: {0}")]
    Planning(String),

    /// Range resolver failure, passed through unchanged.
    #[error("resolver error: {0}")]
    Resolver(String),

    /// Plan or cluster-metadata inconsistency that indicates a bug.
    ///
    /// Examples:
    /// - two node ids advertising the same address
    /// - a primary-key column missing from its table descriptor
    /// - finalizing an already-finalized plan
    #[error("internal error: {0}")]
    Internal(String),

    /// Planning was canceled via the planning context's token.
    #[error("planning canceled")]
    Canceled,
}

/// Standard SpanFlow result alias.
pub type Result<T> = std::result::Result<T, SfqError>;
