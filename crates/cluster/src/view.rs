use async_trait::async_trait;
use sfq_common::{NodeId, Result};

use crate::version::VersionRange;

/// Result of probing connectivity to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// A healthy, heartbeated connection exists.
    Healthy,
    /// No connection has been attempted yet.
    NotConnected,
    /// A connection exists but has not completed a heartbeat yet.
    NotHeartbeated,
    /// The peer is known to be unreachable or failing.
    Unhealthy(String),
}

impl HealthStatus {
    /// Whether the planner may place work on a node with this status.
    ///
    /// The two soft states are usable: a connection that merely has not been
    /// established or heartbeated yet is not evidence of a down peer.
    pub fn is_usable(&self) -> bool {
        !matches!(self, HealthStatus::Unhealthy(_))
    }
}

/// Gossip-backed view of cluster membership.
#[async_trait]
pub trait ClusterView: Send + Sync {
    /// Advertised address of `node`, or an error if gossip no longer knows
    /// the node (decommissioned, or displaced by another node at the same
    /// address).
    async fn node_address(&self, node: NodeId) -> Result<String>;

    /// The distributed-execution version window `node` advertises.
    async fn distsql_version(&self, node: NodeId) -> Result<VersionRange>;
}

/// Connectivity probe towards a peer address.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probes the connection to `addr`.
    async fn conn_health(&self, addr: &str) -> HealthStatus;
}
