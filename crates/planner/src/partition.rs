//! Splits key spans across the nodes that own their ranges.
//!
//! Contract:
//! - the output partitions are non-overlapping and union to exactly the
//!   input spans, in ascending key order within each partition;
//! - ranges owned by nodes that are unhealthy or advertise an incompatible
//!   distsql version are reassigned to the gateway;
//! - health and version decisions are cached in the planning context for
//!   the lifetime of the plan.

use std::collections::HashMap;

use sfq_cluster::{ScanDirection, Span};
use sfq_common::{NodeId, Result, SfqError};
use tracing::debug;

use crate::physical_planner::{cancellable, DistSqlPlanner, PlanningCtx};

/// The intersection between an operation's spans and the ranges owned by one
/// node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanPartition {
    /// Owning node (or the gateway, standing in for an unusable owner).
    pub node: NodeId,
    /// Spans assigned to the node, ascending, coalesced.
    pub spans: Vec<Span>,
}

impl DistSqlPlanner {
    /// Splits `spans` by owning node, substituting the gateway for owners
    /// that are unhealthy or version-incompatible.
    pub async fn partition_spans(
        &self,
        planctx: &mut PlanningCtx,
        spans: &[Span],
    ) -> Result<Vec<SpanPartition>> {
        assert!(!spans.is_empty(), "no spans to partition");
        let cancel = planctx.cancel.clone();
        let mut partitions: Vec<SpanPartition> = Vec::with_capacity(1);
        // node id -> index into partitions
        let mut node_map: HashMap<NodeId, usize> = HashMap::new();

        for span in spans {
            debug!(?span, "partitioning span");
            let mut last_node: Option<NodeId> = None;
            // End key of the last piece carved out of `span`.
            let mut last_key = span.key.clone();

            cancellable(&cancel, planctx.span_iter.seek(span, ScanDirection::Forward)).await?;
            loop {
                if !planctx.span_iter.valid() {
                    return Err(planctx.span_iter.error().unwrap_or_else(|| {
                        SfqError::Resolver("range iterator exhausted mid-span".into())
                    }));
                }
                let replica = planctx.span_iter.replica_info()?;
                let range_span = planctx.span_iter.descriptor().span.clone();

                if !range_span.contains_key(&last_key) {
                    // The resolver must yield contiguous coverage; a gap
                    // means its cache or directory is corrupt.
                    panic!(
                        "next range {:?} doesn't cover last end key {:?}; partitions: {:?}",
                        range_span, last_key, partitions
                    );
                }

                // Clip the range to the span being resolved.
                let mut end_key = range_span.end_key.clone();
                if span.end_key < end_key {
                    end_key = span.end_key.clone();
                }

                let mut node_id = replica.node_desc.id;
                let mut partition_idx = node_map.get(&node_id).copied();
                if partition_idx.is_none() {
                    // First time this node comes up for these spans: check
                    // health and version compatibility.
                    let addr = match planctx.node_addresses.get(&node_id) {
                        Some(addr) => addr.clone(),
                        None => {
                            let addr = self
                                .check_node_health(&cancel, node_id, &replica.node_desc.addr)
                                .await?;
                            // An empty address marks a known-unhealthy node.
                            planctx.node_addresses.insert(node_id, addr.clone());
                            addr
                        }
                    };
                    let mut compatible = true;
                    if !addr.is_empty() {
                        compatible = match planctx.node_ver_compat.get(&node_id) {
                            Some(c) => *c,
                            None => {
                                let c = self.node_version_compatible(&cancel, node_id).await?;
                                planctx.node_ver_compat.insert(node_id, c);
                                c
                            }
                        };
                    }
                    if addr.is_empty() || !compatible {
                        debug!(
                            node = %node_id,
                            unhealthy = addr.is_empty(),
                            incompatible = !compatible,
                            "not planning on node"
                        );
                        node_id = self.gateway_desc().id;
                        partition_idx = node_map.get(&node_id).copied();
                    }
                    if partition_idx.is_none() {
                        let idx = partitions.len();
                        partitions.push(SpanPartition {
                            node: node_id,
                            spans: Vec::new(),
                        });
                        node_map.insert(node_id, idx);
                        partition_idx = Some(idx);
                    }
                }

                let partition = &mut partitions[partition_idx.expect("assigned above")];
                if last_node == Some(node_id) {
                    // Consecutive ranges on the same node: extend the last span.
                    partition
                        .spans
                        .last_mut()
                        .expect("coalescing requires a previous span")
                        .end_key = end_key.clone();
                } else {
                    partition.spans.push(Span {
                        key: last_key.clone(),
                        end_key: end_key.clone(),
                    });
                }

                if end_key >= span.end_key {
                    break;
                }
                last_key = end_key;
                last_node = Some(node_id);
                cancellable(&cancel, planctx.span_iter.next()).await?;
            }
        }
        Ok(partitions)
    }

    /// Probes a node first seen during partitioning. Returns its usable
    /// address, or an empty string when the node must be avoided.
    async fn check_node_health(
        &self,
        cancel: &tokio_util::sync::CancellationToken,
        node_id: NodeId,
        advertised_addr: &str,
    ) -> Result<String> {
        // The node must still be present in gossip: it may have been
        // decommissioned or displaced by another node at the same address.
        if let Err(err) = cancellable(cancel, self.cluster_view().node_address(node_id)).await? {
            debug!(node = %node_id, %err, "not using node: gossip doesn't know about it");
            return Ok(String::new());
        }
        let status = cancellable(cancel, self.health_probe().conn_health(advertised_addr)).await?;
        if status.is_usable() {
            Ok(advertised_addr.to_string())
        } else {
            debug!(node = %node_id, ?status, "marking node as unhealthy for this plan");
            Ok(String::new())
        }
    }

    /// Whether the node's advertised version window contains the plan
    /// version. A gossip miss counts as incompatible.
    async fn node_version_compatible(
        &self,
        cancel: &tokio_util::sync::CancellationToken,
        node_id: NodeId,
    ) -> Result<bool> {
        match cancellable(cancel, self.cluster_view().distsql_version(node_id)).await? {
            Ok(window) => Ok(window.accepts(self.plan_version())),
            Err(_) => Ok(false),
        }
    }
}
