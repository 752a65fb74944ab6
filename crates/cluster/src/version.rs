use serde::{Deserialize, Serialize};
use sfq_common::DistSqlVersion;

/// Window of distributed-execution versions a node accepts.
///
/// Advertised through gossip alongside the node's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    /// Oldest plan version the node still accepts.
    pub min_accepted: DistSqlVersion,
    /// Version the node itself plans at.
    pub current: DistSqlVersion,
}

impl VersionRange {
    /// Whether a plan at `plan_version` can run on a node advertising this
    /// window.
    pub fn accepts(&self, plan_version: DistSqlVersion) -> bool {
        self.min_accepted <= plan_version && plan_version <= self.current
    }
}
