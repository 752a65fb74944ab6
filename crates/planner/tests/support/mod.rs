//! Shared in-memory cluster fakes and catalog fixtures for planner tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arrow_schema::DataType;
use async_trait::async_trait;
use sfq_cluster::{
    ClusterView, HealthProbe, HealthStatus, NodeDesc, RangeDescriptor, RangeIterator,
    ReplicaInfo, ScanDirection, Span, SpanResolver, VersionRange,
};
use sfq_common::{DistSqlVersion, NodeId, PlannerSettings, Result, SfqError};
use sfq_planner::{
    Column, ColumnDesc, ColumnId, DistSqlPlanner, IndexDesc, IndexId, OrderingColumn,
    PhysicalProps, PlanningCtx, ScanNode, TableDesc,
};
use tokio_util::sync::CancellationToken;

pub fn span(start: &str, end: &str) -> Span {
    Span::new(start.as_bytes().to_vec(), end.as_bytes().to_vec())
}

pub fn range(start: &str, end: &str, node: u32) -> (Span, NodeId) {
    (span(start, end), NodeId(node))
}

pub fn node_addr(node: NodeId) -> String {
    format!("10.0.0.{}:26257", node.0)
}

/// Iterator over a fixed, contiguous, ascending range table.
pub struct StaticIterator {
    ranges: Vec<(Span, NodeId)>,
    pos: Option<usize>,
    current: Option<RangeDescriptor>,
    err: Option<SfqError>,
}

impl StaticIterator {
    fn update_current(&mut self) {
        self.current = self
            .pos
            .map(|p| RangeDescriptor {
                span: self.ranges[p].0.clone(),
            });
    }
}

#[async_trait]
impl RangeIterator for StaticIterator {
    async fn seek(&mut self, span: &Span, _direction: ScanDirection) {
        self.pos = self
            .ranges
            .iter()
            .position(|(range, _)| range.contains_key(&span.key));
        if self.pos.is_none() {
            self.err = Some(SfqError::Resolver(format!(
                "no range contains key of {span:?}"
            )));
        }
        self.update_current();
    }

    async fn next(&mut self) {
        match self.pos {
            Some(p) if p + 1 < self.ranges.len() => self.pos = Some(p + 1),
            _ => {
                self.pos = None;
                self.err = Some(SfqError::Resolver("iterated past the last range".into()));
            }
        }
        self.update_current();
    }

    fn valid(&self) -> bool {
        self.pos.is_some()
    }

    fn error(&self) -> Option<SfqError> {
        self.err.clone()
    }

    fn descriptor(&self) -> &RangeDescriptor {
        self.current.as_ref().expect("iterator not positioned")
    }

    fn replica_info(&self) -> Result<ReplicaInfo> {
        let (_, node) = &self.ranges[self.pos.expect("iterator not positioned")];
        Ok(ReplicaInfo {
            node_desc: NodeDesc::new(*node, node_addr(*node)),
        })
    }
}

pub struct StaticResolver {
    pub ranges: Vec<(Span, NodeId)>,
}

impl SpanResolver for StaticResolver {
    fn new_iterator(&self) -> Box<dyn RangeIterator> {
        Box::new(StaticIterator {
            ranges: self.ranges.clone(),
            pos: None,
            current: None,
            err: None,
        })
    }
}

/// Gossip view over a fixed node set, counting version lookups.
pub struct StaticClusterView {
    pub known: Vec<NodeId>,
    pub versions: HashMap<NodeId, VersionRange>,
    pub default_version: VersionRange,
    pub version_calls: Mutex<HashMap<NodeId, usize>>,
}

impl StaticClusterView {
    pub fn version_calls_for(&self, node: NodeId) -> usize {
        *self.version_calls.lock().unwrap().get(&node).unwrap_or(&0)
    }
}

#[async_trait]
impl ClusterView for StaticClusterView {
    async fn node_address(&self, node: NodeId) -> Result<String> {
        if self.known.contains(&node) {
            Ok(node_addr(node))
        } else {
            Err(SfqError::Resolver(format!("gossip does not know {node}")))
        }
    }

    async fn distsql_version(&self, node: NodeId) -> Result<VersionRange> {
        *self
            .version_calls
            .lock()
            .unwrap()
            .entry(node)
            .or_insert(0) += 1;
        Ok(self
            .versions
            .get(&node)
            .copied()
            .unwrap_or(self.default_version))
    }
}

pub struct StaticHealth {
    pub statuses: HashMap<String, HealthStatus>,
}

#[async_trait]
impl HealthProbe for StaticHealth {
    async fn conn_health(&self, addr: &str) -> HealthStatus {
        self.statuses
            .get(addr)
            .cloned()
            .unwrap_or(HealthStatus::Healthy)
    }
}

/// Builder for a planner over an in-memory cluster. The gateway is always
/// node 1.
pub struct TestCluster {
    pub ranges: Vec<(Span, NodeId)>,
    pub unhealthy: Vec<u32>,
    pub unknown: Vec<u32>,
    pub versions: Vec<(u32, u32, u32)>,
    pub plan_version: u32,
    pub settings: PlannerSettings,
}

impl Default for TestCluster {
    fn default() -> Self {
        Self {
            ranges: Vec::new(),
            unhealthy: Vec::new(),
            unknown: Vec::new(),
            versions: Vec::new(),
            plan_version: 1,
            settings: PlannerSettings::default(),
        }
    }
}

impl TestCluster {
    pub fn with_ranges(ranges: Vec<(Span, NodeId)>) -> Self {
        Self {
            ranges,
            ..Self::default()
        }
    }

    pub fn build(self) -> (DistSqlPlanner, Arc<StaticClusterView>) {
        let mut known: Vec<NodeId> = vec![NodeId(1)];
        for (_, node) in &self.ranges {
            if !known.contains(node) {
                known.push(*node);
            }
        }
        known.retain(|n| !self.unknown.contains(&n.0));

        let view = Arc::new(StaticClusterView {
            known,
            versions: self
                .versions
                .into_iter()
                .map(|(node, min, cur)| {
                    (
                        NodeId(node),
                        VersionRange {
                            min_accepted: DistSqlVersion(min),
                            current: DistSqlVersion(cur),
                        },
                    )
                })
                .collect(),
            default_version: VersionRange {
                min_accepted: DistSqlVersion(0),
                current: DistSqlVersion(u32::MAX),
            },
            version_calls: Mutex::new(HashMap::new()),
        });
        let health = StaticHealth {
            statuses: self
                .unhealthy
                .into_iter()
                .map(|n| {
                    (
                        node_addr(NodeId(n)),
                        HealthStatus::Unhealthy("connection refused".into()),
                    )
                })
                .collect(),
        };
        let planner = DistSqlPlanner::new(
            DistSqlVersion(self.plan_version),
            NodeDesc::new(NodeId(1), node_addr(NodeId(1))),
            Arc::new(self.settings),
            Arc::new(StaticResolver {
                ranges: self.ranges,
            }),
            view.clone(),
            Arc::new(health),
        );
        (planner, view)
    }
}

pub fn ctx(planner: &DistSqlPlanner) -> PlanningCtx {
    planner.new_planning_ctx(CancellationToken::new())
}

/// A two-column `kv(k INT PRIMARY KEY, v INT)` table whose primary index
/// covers the `a`..`z` keyspace.
pub fn kv_table() -> TableDesc {
    TableDesc {
        name: "kv".into(),
        columns: vec![
            ColumnDesc {
                id: ColumnId(1),
                name: "k".into(),
                typ: DataType::Int64,
            },
            ColumnDesc {
                id: ColumnId(2),
                name: "v".into(),
                typ: DataType::Int64,
            },
        ],
        primary_index: IndexDesc {
            id: IndexId(1),
            name: "primary".into(),
            column_ids: vec![ColumnId(1)],
            span: span("a", "z"),
        },
        indexes: vec![IndexDesc {
            id: IndexId(2),
            name: "v_idx".into(),
            column_ids: vec![ColumnId(2)],
            span: span("A", "Z"),
        }],
    }
}

/// Primary-index scan of [`kv_table`] over `spans`, every column needed,
/// ordered by `k`.
pub fn kv_scan(spans: Vec<Span>) -> ScanNode {
    let table = kv_table();
    ScanNode {
        result_columns: vec![
            Column::new("k", DataType::Int64),
            Column::new("v", DataType::Int64),
        ],
        needed_columns: vec![true, true],
        props: PhysicalProps {
            ordering: vec![OrderingColumn::asc(0)],
        },
        index: table.primary_index.id,
        desc: table,
        reverse: false,
        spans,
        filter: None,
        hard_limit: None,
        soft_limit: None,
    }
}
