use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sfq_common::{Result, SfqError};

use crate::node::NodeDesc;
use crate::span::Span;

/// Direction of a range iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanDirection {
    /// Ascending key order.
    Forward,
    /// Descending key order.
    Reverse,
}

/// Descriptor of one range of the keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDescriptor {
    /// The keys this range owns.
    pub span: Span,
}

/// Leaseholder information for a range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    /// Descriptor of the node currently holding the range lease.
    pub node_desc: NodeDesc,
}

/// Iterator over the ranges covering a span set.
///
/// Contract:
/// - after `seek`, the iterator is positioned on the range containing the
///   span's start key;
/// - `next` advances to the adjacent range in the scan direction;
/// - ranges covering a seek span are yielded contiguously in ascending key
///   order (for [`ScanDirection::Forward`]);
/// - when `valid` returns false, `error` carries the failure (positioning
///   past the keyspace is an error for the planner's access pattern).
///
/// `seek` and `next` may block on range-directory lookups; `replica_info`
/// reports the leaseholder of the current range.
#[async_trait]
pub trait RangeIterator: Send {
    /// Positions the iterator at the first range of `span`.
    async fn seek(&mut self, span: &Span, direction: ScanDirection);

    /// Advances to the next range.
    async fn next(&mut self);

    /// Whether the iterator is positioned on a range.
    fn valid(&self) -> bool;

    /// The failure that invalidated the iterator, if any.
    fn error(&self) -> Option<SfqError>;

    /// Descriptor of the current range. Only valid when `valid()`.
    fn descriptor(&self) -> &RangeDescriptor;

    /// Leaseholder of the current range. Only valid when `valid()`.
    fn replica_info(&self) -> Result<ReplicaInfo>;
}

/// Mints range iterators for planning contexts.
pub trait SpanResolver: Send + Sync {
    /// Creates a fresh iterator bound to the caller's consistency domain.
    fn new_iterator(&self) -> Box<dyn RangeIterator>;
}
