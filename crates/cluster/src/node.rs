use serde::{Deserialize, Serialize};
use sfq_common::NodeId;

/// Descriptor of one cluster node as advertised through gossip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDesc {
    /// Stable node identifier.
    pub id: NodeId,
    /// Transport address the node serves flows on.
    pub addr: String,
}

impl NodeDesc {
    /// Builds a descriptor.
    pub fn new(id: NodeId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
        }
    }
}
