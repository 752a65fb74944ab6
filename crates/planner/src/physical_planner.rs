//! Lowers logical trees onto processors and streams placed across the
//! cluster.
//!
//! A rough overview of the process:
//!
//! - the support predicate ([`crate::support`]) decides whether the tree can
//!   and should run distributed;
//! - the dispatcher descends the tree recursively, building a physical
//!   sub-plan per child and composing it with a stage realizing the current
//!   operator. Scans fan out one table reader per span partition; joins and
//!   aggregations re-distribute by hash where profitable;
//! - the finalizer runs once at the root: it collects the result on the
//!   gateway, wires stream endpoints, and attaches the response stream.
//!
//! Failure during planning is total: partial plans are discarded.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use arrow_schema::DataType;
use futures::future::BoxFuture;
use serde::Serialize;
use sfq_cluster::{ClusterView, HealthProbe, NodeDesc, RangeIterator, Span, SpanResolver};
use sfq_common::{DistSqlVersion, NodeId, PlannerSettings, Result, SfqError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::aggregation::{aggregate_output_type, dist_aggregation_info, AggFunc};
use crate::catalog::{Column, TableDesc};
use crate::expr::{Expr, LiteralValue};
use crate::logical_plan::{
    GroupNode, IndexJoinNode, JoinNode, JoinType, LogicalPlan, PhysicalProps, RenderNode,
    ScanNode, SortNode, ValuesNode,
};
use crate::physical_plan::{
    identity_col_map, unmapped_col_map, Aggregation, AggregatorSpec, BackfillKind,
    BackfillerSpec, DistinctSpec, HashJoinerSpec, InputSyncSpec, JoinReaderSpec, MergeJoinerSpec,
    MergeOrdering, OrderingColumn, OutputRouterSpec, PhysicalPlan, PostProcessSpec, Processor,
    ProcessorCore, ProcessorSpec, RouterKind, SorterSpec, StreamEndpointKind, StreamEndpointSpec,
    TableReaderSpec, ValuesSpec,
};

/// Runs `fut`, aborting with [`SfqError::Canceled`] if the planning context
/// is canceled first.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SfqError::Canceled),
        value = fut => Ok(value),
    }
}

/// Data used and updated throughout the planning of a single query.
pub struct PlanningCtx {
    /// Cancellation token checked at every I/O suspension point.
    pub cancel: CancellationToken,
    /// Range iterator bound to this query's consistency domain.
    pub span_iter: Box<dyn RangeIterator>,
    /// Addresses for all node ids referenced by plans built with this
    /// context. Nodes that failed a health check have empty addresses. The
    /// gateway's address is always present.
    pub node_addresses: std::collections::HashMap<NodeId, String>,
    /// Per-plan cache of version-compatibility decisions.
    pub node_ver_compat: std::collections::HashMap<NodeId, bool>,
}

impl PlanningCtx {
    /// Errors if two distinct node ids advertise the same address; this is a
    /// known cluster-configuration bug and planning must not proceed on it.
    pub fn sanity_check_addresses(&self) -> Result<()> {
        let mut inverted: std::collections::HashMap<&str, NodeId> = Default::default();
        for (&node, addr) in &self.node_addresses {
            // Empty addresses mark known-unhealthy nodes, not a location.
            if addr.is_empty() {
                continue;
            }
            if let Some(&other) = inverted.get(addr.as_str()) {
                return Err(SfqError::Internal(format!(
                    "different nodes {node} and {other} with the same address '{addr}'"
                )));
            }
            inverted.insert(addr, node);
        }
        Ok(())
    }
}

/// The distributed physical planner.
///
/// One instance serves the whole node; per-query state lives in
/// [`PlanningCtx`].
pub struct DistSqlPlanner {
    /// Version of the distributed-execution protocol targeted by the plans
    /// we build; used to skip incompatible nodes when mapping spans.
    plan_version: DistSqlVersion,
    /// Descriptor of the gateway node that initiated the query.
    gateway: NodeDesc,
    settings: Arc<PlannerSettings>,
    resolver: Arc<dyn SpanResolver>,
    cluster: Arc<dyn ClusterView>,
    health: Arc<dyn HealthProbe>,
}

impl DistSqlPlanner {
    /// Builds a planner.
    pub fn new(
        plan_version: DistSqlVersion,
        gateway: NodeDesc,
        settings: Arc<PlannerSettings>,
        resolver: Arc<dyn SpanResolver>,
        cluster: Arc<dyn ClusterView>,
        health: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            plan_version,
            gateway,
            settings,
            resolver,
            cluster,
            health,
        }
    }

    /// The gateway node's descriptor.
    pub fn gateway_desc(&self) -> &NodeDesc {
        &self.gateway
    }

    pub(crate) fn plan_version(&self) -> DistSqlVersion {
        self.plan_version
    }

    pub(crate) fn cluster_view(&self) -> &dyn ClusterView {
        self.cluster.as_ref()
    }

    pub(crate) fn health_probe(&self) -> &dyn HealthProbe {
        self.health.as_ref()
    }

    /// Creates the per-query planning context, seeding the gateway's address.
    pub fn new_planning_ctx(&self, cancel: CancellationToken) -> PlanningCtx {
        let mut node_addresses = std::collections::HashMap::new();
        node_addresses.insert(self.gateway.id, self.gateway.addr.clone());
        PlanningCtx {
            cancel,
            span_iter: self.resolver.new_iterator(),
            node_addresses,
            node_ver_compat: Default::default(),
        }
    }

    /// Plans and finalizes a query in one call.
    pub async fn plan_query(
        &self,
        planctx: &mut PlanningCtx,
        node: &LogicalPlan,
    ) -> Result<PhysicalPlan> {
        let mut plan = self.create_plan_for_node(planctx, node).await?;
        self.finalize_plan(planctx, &mut plan)?;
        Ok(plan)
    }

    /// Recursively builds the physical sub-plan for one logical node.
    pub fn create_plan_for_node<'a>(
        &'a self,
        planctx: &'a mut PlanningCtx,
        node: &'a LogicalPlan,
    ) -> BoxFuture<'a, Result<PhysicalPlan>> {
        Box::pin(async move {
            match node {
                LogicalPlan::Scan(n) => self.create_table_readers(planctx, n, None).await,

                LogicalPlan::IndexJoin(n) => self.create_plan_for_index_join(planctx, n).await,

                LogicalPlan::Join(n) => self.create_plan_for_join(planctx, n).await,

                LogicalPlan::Render(n) => {
                    let mut plan = self.create_plan_for_node(planctx, &n.input).await?;
                    self.select_renders(&mut plan, n);
                    Ok(plan)
                }

                LogicalPlan::Group(n) => {
                    let mut plan = self.create_plan_for_node(planctx, &n.input).await?;
                    self.add_aggregators(&mut plan, n)?;
                    Ok(plan)
                }

                LogicalPlan::Sort(n) => {
                    let mut plan = self.create_plan_for_node(planctx, &n.input).await?;
                    self.add_sorters(&mut plan, n);
                    Ok(plan)
                }

                LogicalPlan::Filter(n) => {
                    let mut plan = self.create_plan_for_node(planctx, &n.input).await?;
                    let map = plan.plan_to_stream_col_map.clone();
                    plan.add_filter(&n.filter, &map);
                    Ok(plan)
                }

                LogicalPlan::Limit(n) => {
                    let mut plan = self.create_plan_for_node(planctx, &n.input).await?;
                    let count = eval_limit_expr(n.count.as_ref(), "LIMIT")?;
                    let offset = eval_limit_expr(n.offset.as_ref(), "OFFSET")?.unwrap_or(0);
                    plan.add_limit(count, offset, self.gateway.id);
                    Ok(plan)
                }

                LogicalPlan::Distinct(n) => {
                    let mut plan = self.create_plan_for_node(planctx, &n.input).await?;
                    self.add_distinct(&mut plan, n);
                    Ok(plan)
                }

                LogicalPlan::Values(n) => self.create_plan_for_values(n),

                LogicalPlan::Mutation(_) => {
                    Err(SfqError::Unsupported("mutations not supported".into()))
                }

                LogicalPlan::Set(_) => Err(SfqError::Unsupported(
                    "SET / SET CLUSTER SETTING should never distribute".into(),
                )),
            }
        })
    }

    /// Builds table reader processors, one per node owning part of the
    /// scan's spans. `override_result_columns` replaces the scan's own
    /// output projection (used by the index-join path to read primary keys).
    pub async fn create_table_readers(
        &self,
        planctx: &mut PlanningCtx,
        n: &ScanNode,
        override_result_columns: Option<Vec<usize>>,
    ) -> Result<PhysicalPlan> {
        let index_idx = n.desc.index_idx(n.index)?;
        let mut post = PostProcessSpec {
            filter: n.filter.clone(),
            ..PostProcessSpec::default()
        };
        let mut limit_hint = None;
        if let Some(hard) = n.hard_limit {
            post.limit = Some(hard);
        } else if let Some(soft) = n.soft_limit {
            limit_hint = Some(soft);
        }

        let partitions = self.partition_spans(planctx, &n.spans).await?;

        let mut plan = PhysicalPlan::new();
        let stage_id = plan.new_stage_id();
        for partition in &partitions {
            let reader = TableReaderSpec {
                table: n.desc.clone(),
                index_idx,
                reverse: n.reverse,
                spans: partition.spans.clone(),
                limit_hint,
            };
            let idx = plan.add_processor(Processor {
                node: partition.node,
                spec: ProcessorSpec {
                    input: vec![],
                    core: ProcessorCore::TableReader(reader),
                    post: PostProcessSpec::default(),
                    output: vec![OutputRouterSpec::pass_through()],
                    stage_id,
                },
            });
            plan.result_routers.push(idx);
        }

        let plan_to_stream = identity_col_map(n.result_columns.len());
        if plan.result_routers.len() > 1 && !n.props.ordering.is_empty() {
            // Parallel streams must be merged respecting the scan's ordering.
            // The projection below takes this into account and retains the
            // ordering columns even if they are not projected.
            plan.set_merge_ordering(convert_ordering(&n.props, &plan_to_stream));
        }
        plan.set_last_stage_post(
            post,
            types_for_plan_result(&n.result_columns, Some(&plan_to_stream)),
        );

        let out_cols =
            override_result_columns.unwrap_or_else(|| output_columns_from_scan(n));
        plan.add_projection(out_cols);

        let post = plan.get_last_stage_post();
        let mut map = unmapped_col_map(n.result_columns.len());
        if let Some(projection) = &post.projection {
            for (stream_col, &table_col) in projection.iter().enumerate() {
                map[table_col] = Some(stream_col);
            }
        }
        plan.plan_to_stream_col_map = map;
        Ok(plan)
    }

    /// Index join: table readers over the index (projected to primary-key
    /// columns) feeding join readers that look up the base table.
    async fn create_plan_for_index_join(
        &self,
        planctx: &mut PlanningCtx,
        n: &IndexJoinNode,
    ) -> Result<PhysicalPlan> {
        let mut pri_cols = Vec::with_capacity(n.index.desc.primary_index.column_ids.len());
        for &col_id in &n.index.desc.primary_index.column_ids {
            let pos = n.index.desc.column_position(col_id).ok_or_else(|| {
                SfqError::Internal(format!(
                    "primary key column {col_id:?} not found in table {}",
                    n.index.desc.name
                ))
            })?;
            pri_cols.push(pos);
        }

        let mut plan = self
            .create_table_readers(planctx, &n.index, Some(pri_cols))
            .await?;

        let join_reader = JoinReaderSpec {
            table: n.index.desc.clone(),
            index_idx: 0,
        };
        let out_cols = output_columns_from_scan(&n.table);
        let post = PostProcessSpec {
            filter: n.table.filter.clone(),
            projection: Some(out_cols.clone()),
            ..PostProcessSpec::default()
        };

        // The map now targets columns in the join readers' output stream.
        let mut map = unmapped_col_map(plan.plan_to_stream_col_map.len());
        for (stream_col, &table_col) in out_cols.iter().enumerate() {
            map[table_col] = Some(stream_col);
        }
        plan.plan_to_stream_col_map = map;

        let types =
            types_for_plan_result(&n.table.result_columns, Some(&plan.plan_to_stream_col_map));
        if self.settings.distribute_index_joins() && plan.result_routers.len() > 1 {
            // One join reader per stream, preserving upstream parallelism
            // and ordering.
            let ordering = convert_ordering(&n.props, &plan.plan_to_stream_col_map);
            plan.add_no_grouping_stage(
                ProcessorCore::JoinReader(join_reader),
                post,
                types,
                ordering,
            );
        } else {
            // A single join reader: on the upstream's node if there is one
            // stream, on the gateway otherwise.
            let node = if plan.result_routers.len() == 1 {
                plan.processors[plan.result_routers[0]].node
            } else {
                self.gateway.id
            };
            plan.add_single_group_stage(node, ProcessorCore::JoinReader(join_reader), post, types);
        }
        Ok(plan)
    }

    /// Join planning: the children's plans are merged, then joiner
    /// processors consume both sides, distributed by hash over the equality
    /// columns when there are any.
    async fn create_plan_for_join(
        &self,
        planctx: &mut PlanningCtx,
        n: &JoinNode,
    ) -> Result<PhysicalPlan> {
        let left_plan = self.create_plan_for_node(planctx, &n.left).await?;
        let right_plan = self.create_plan_for_node(planctx, &n.right).await?;

        let left_types = left_plan.result_types.clone();
        let right_types = right_plan.result_types.clone();
        let left_map = left_plan.plan_to_stream_col_map.clone();
        let right_map = right_plan.plan_to_stream_col_map.clone();

        let (mut plan, left_routers, right_routers) =
            PhysicalPlan::merge_plans(left_plan, right_plan);

        let mut join_to_stream_col_map = unmapped_col_map(n.columns.len());

        // Nodes that will run joiner processors.
        let mut nodes: Vec<NodeId> = Vec::new();
        let num_eq = n.pred.left_eq_cols.len();
        let mut left_eq_cols: Vec<usize> = Vec::new();
        let mut right_eq_cols: Vec<usize> = Vec::new();
        let mut left_merge_ord: Vec<OrderingColumn> = Vec::new();
        let mut right_merge_ord: Vec<OrderingColumn> = Vec::new();

        if num_eq != 0 {
            // Run a joiner on every node that produces data for either side.
            let mut seen: HashSet<NodeId> = HashSet::new();
            for &router in left_routers.iter().chain(right_routers.iter()) {
                let node = plan.processors[router].node;
                if seen.insert(node) {
                    nodes.push(node);
                }
            }

            left_eq_cols = n
                .pred
                .left_eq_cols
                .iter()
                .map(|&c| left_map[c].expect("left equality column not materialized"))
                .collect();
            right_eq_cols = n
                .pred
                .right_eq_cols
                .iter()
                .map(|&c| right_map[c].expect("right equality column not materialized"))
                .collect();

            // A merge joiner applies only when the inputs are ordered on all
            // equality columns; otherwise a sort would be needed to complete
            // the order.
            if self.settings.merge_joins_enabled()
                && n.join_type == JoinType::Inner
                && n.merge_join_ordering.len() == num_eq
            {
                for oc in &n.merge_join_ordering {
                    left_merge_ord.push(OrderingColumn {
                        col_idx: left_eq_cols[oc.col_idx],
                        direction: oc.direction,
                    });
                    right_merge_ord.push(OrderingColumn {
                        col_idx: right_eq_cols[oc.col_idx],
                        direction: oc.direction,
                    });
                }
            }
        } else {
            // Without equality columns rows cannot be distributed; run a
            // single joiner, on a single-stream side's node if possible
            // (prefer the left, which the hash joiner consumes first).
            let mut node = self.gateway.id;
            if left_routers.len() == 1 {
                node = plan.processors[left_routers[0]].node;
            } else if right_routers.len() == 1 {
                node = plan.processors[right_routers[0]].node;
            }
            nodes.push(node);
        }

        // Output columns come in three positional groups: merged equality
        // columns (outer joins only), left columns, right columns.
        let merged_col_num = if n.join_type == JoinType::Inner {
            0
        } else {
            n.pred.num_merged_cols
        };
        let mut output_columns: Vec<usize> = Vec::new();
        let mut join_col = 0;
        for i in 0..n.pred.num_merged_cols {
            if !n.columns[join_col].omitted {
                let source = if merged_col_num != 0 {
                    // The joiner emits the merged columns first.
                    i
                } else {
                    // Inner join: the left equality column carries the value.
                    left_eq_cols[i]
                };
                output_columns.push(source);
                join_to_stream_col_map[join_col] = Some(output_columns.len() - 1);
            }
            join_col += 1;
        }
        for i in 0..n.pred.num_left_cols {
            if !n.columns[join_col].omitted {
                let stream_col = left_map[i].expect("left column not materialized");
                output_columns.push(merged_col_num + stream_col);
                join_to_stream_col_map[join_col] = Some(output_columns.len() - 1);
            }
            join_col += 1;
        }
        for i in 0..n.pred.num_right_cols {
            if !n.columns[join_col].omitted {
                let stream_col = right_map[i].expect("right column not materialized");
                output_columns.push(merged_col_num + stream_col + left_types.len());
                join_to_stream_col_map[join_col] = Some(output_columns.len() - 1);
            }
            join_col += 1;
        }
        let merged_columns = merged_col_num != 0;
        if merged_columns && merged_col_num != left_eq_cols.len() {
            panic!("merged column count differs from equality column count");
        }
        let post = PostProcessSpec {
            projection: Some(output_columns),
            ..PostProcessSpec::default()
        };

        // Remap ON-condition ordinals from the join's column layout to the
        // joiner's internal layout: 0..L-1 left, L..L+R-1 right.
        let mut on_expr = None;
        if let Some(on_cond) = &n.pred.on_cond {
            // The session layer never builds merged columns together with an
            // ON condition.
            if n.pred.num_merged_cols != 0 {
                panic!("merged columns with ON condition");
            }
            let mut join_col_map: Vec<Option<usize>> =
                Vec::with_capacity(n.pred.num_left_cols + n.pred.num_right_cols);
            for i in 0..n.pred.num_left_cols {
                join_col_map.push(left_map[i]);
            }
            for i in 0..n.pred.num_right_cols {
                join_col_map.push(right_map[i].map(|s| s + left_types.len()));
            }
            on_expr = Some(on_cond.remap_columns(&join_col_map));
        }

        let core = if left_merge_ord.is_empty() {
            ProcessorCore::HashJoiner(HashJoinerSpec {
                left_eq_columns: left_eq_cols.clone(),
                right_eq_columns: right_eq_cols.clone(),
                join_type: n.join_type,
                on_expr,
                merged_columns,
            })
        } else {
            // Merge joins only apply to inner joins, which never carry
            // merged columns.
            if merged_columns {
                panic!("merged columns not supported by merge join");
            }
            ProcessorCore::MergeJoiner(MergeJoinerSpec {
                left_ordering: left_merge_ord.clone(),
                right_ordering: right_merge_ord.clone(),
                join_type: n.join_type,
                on_expr,
            })
        };

        let p_idx_start = plan.processors.len();
        let stage_id = plan.new_stage_id();
        for &node in &nodes {
            plan.add_processor(Processor {
                node,
                spec: ProcessorSpec {
                    input: vec![
                        InputSyncSpec::unordered(left_types.clone()),
                        InputSyncSpec::unordered(right_types.clone()),
                    ],
                    core: core.clone(),
                    post: post.clone(),
                    output: vec![OutputRouterSpec::pass_through()],
                    stage_id,
                },
            });
        }
        if nodes.len() > 1 {
            // Distribute rows so that matches collide on the same joiner.
            for &router in &left_routers {
                plan.processors[router].spec.output[0].kind = RouterKind::ByHash {
                    hash_columns: left_eq_cols.clone(),
                };
            }
            for &router in &right_routers {
                plan.processors[router].spec.output[0].kind = RouterKind::ByHash {
                    hash_columns: right_eq_cols.clone(),
                };
            }
        }

        plan.result_routers.clear();
        for bucket in 0..nodes.len() {
            let p_idx = p_idx_start + bucket;
            plan.merge_result_streams(&left_routers, bucket, &left_merge_ord, p_idx, 0);
            plan.merge_result_streams(&right_routers, bucket, &right_merge_ord, p_idx, 1);
            plan.result_routers.push(p_idx);
        }

        plan.result_types = types_for_plan_result(&n.columns, Some(&join_to_stream_col_map));
        plan.plan_to_stream_col_map = join_to_stream_col_map;
        // Joiners may guarantee an output ordering; propagate it through the
        // next stage's input synchronizer.
        let map = plan.plan_to_stream_col_map.clone();
        plan.set_merge_ordering(convert_ordering(&n.props, &map));
        Ok(plan)
    }

    /// Aggregation: either a single aggregator stage, or a local stage on
    /// every stream followed by a final stage, with aggregate de-duplication
    /// and optional final rendering.
    fn add_aggregators(&self, plan: &mut PhysicalPlan, n: &GroupNode) -> Result<()> {
        let mut aggregations = Vec::with_capacity(n.aggregates.len());
        for agg_ref in &n.aggregates {
            let func = AggFunc::from_name(&agg_ref.func_name)?;
            let col_idx = match agg_ref.arg_col {
                Some(c) => vec![plan.plan_to_stream_col_map[c]
                    .expect("aggregate argument column not materialized")],
                None => vec![],
            };
            let filter_col_idx = agg_ref
                .filter_col
                .map(|c| plan.plan_to_stream_col_map[c].expect("filter column not materialized"));
            aggregations.push(Aggregation {
                func,
                distinct: agg_ref.distinct,
                col_idx,
                filter_col_idx,
            });
        }

        let input_types = plan.result_types.clone();
        let group_cols: Vec<usize> = (0..n.num_group_cols)
            .map(|i| plan.plan_to_stream_col_map[i].expect("group column not materialized"))
            .collect();

        // The node the whole previous stage runs on, if there is one.
        let mut prev_stage_node = Some(plan.processors[plan.result_routers[0]].node);
        for &router in &plan.result_routers[1..] {
            if Some(plan.processors[router].node) != prev_stage_node {
                prev_stage_node = None;
                break;
            }
        }

        // A local stage applies when the input is spread over multiple
        // nodes, every function is decomposable, and no aggregate is
        // DISTINCT.
        let mut multi_stage = false;
        let mut all_distinct = true;
        let mut any_distinct = false;
        if prev_stage_node.is_none() {
            multi_stage = true;
            for agg in &aggregations {
                if agg.distinct {
                    multi_stage = false;
                    any_distinct = true;
                } else {
                    all_distinct = false;
                }
                if dist_aggregation_info(agg.func).is_none() {
                    multi_stage = false;
                    break;
                }
            }
        }
        if !any_distinct {
            all_distinct = false;
        }

        let final_aggs_spec;
        let mut final_aggs_post = PostProcessSpec::default();
        let final_out_types;
        let mut plan_to_stream_map_set = false;

        if !multi_stage && all_distinct {
            // Local aggregation is off the table, but local distinct
            // processing still reduces streaming duplicates before the
            // single final aggregator.
            let props = n.input.physical_props();
            let ordering = convert_ordering(&props, &plan.plan_to_stream_col_map);
            let ordered: std::collections::BTreeSet<usize> =
                ordering.columns().iter().map(|c| c.col_idx).collect();
            let distinct: std::collections::BTreeSet<usize> = aggregations
                .iter()
                .flat_map(|a| a.col_idx.iter().copied())
                .collect();
            let distinct_spec = DistinctSpec {
                ordered_columns: ordered.into_iter().collect(),
                distinct_columns: distinct.into_iter().collect(),
            };
            plan.add_no_grouping_stage(
                ProcessorCore::Distinct(distinct_spec),
                PostProcessSpec::default(),
                plan.result_types.clone(),
                plan.merge_ordering.clone(),
            );
        }

        if !multi_stage {
            final_out_types = logical_aggregate_types(&aggregations, &input_types)?;
            final_aggs_spec = AggregatorSpec {
                aggregations,
                group_cols: group_cols.clone(),
            };
        } else {
            // Accumulate de-duplicated local aggregations while recording,
            // per logical aggregate, the map from its relative local index
            // to the absolute index in `local_aggs`.
            let mut local_aggs: Vec<Aggregation> = Vec::new();
            let mut intermediate_types: Vec<DataType> = Vec::new();
            let mut final_aggs: Vec<Aggregation> = Vec::new();
            // i-th final aggregation (over all logical aggregates) -> its
            // absolute index in `final_aggs`.
            let mut final_idx_map: Vec<usize> = Vec::new();

            let need_render = aggregations.iter().any(|agg| {
                dist_aggregation_info(agg.func)
                    .expect("multi-stage requires decomposable functions")
                    .final_rendering
                    .is_some()
            });

            for agg in &aggregations {
                let info = dist_aggregation_info(agg.func).expect("checked above");

                let mut rel_to_abs_local = Vec::with_capacity(info.local_stage.len());
                for &local_func in info.local_stage {
                    let local_agg = Aggregation {
                        func: local_func,
                        distinct: false,
                        col_idx: agg.col_idx.clone(),
                        filter_col_idx: agg.filter_col_idx,
                    };
                    match local_aggs.iter().position(|a| *a == local_agg) {
                        Some(existing) => rel_to_abs_local.push(existing),
                        None => {
                            rel_to_abs_local.push(local_aggs.len());
                            let arg_types: Vec<DataType> = local_agg
                                .col_idx
                                .iter()
                                .map(|&c| input_types[c].clone())
                                .collect();
                            intermediate_types
                                .push(aggregate_output_type(local_func, &arg_types)?);
                            local_aggs.push(local_agg);
                        }
                    }
                }

                for final_info in info.final_stage {
                    let arg_idxs: Vec<usize> = final_info
                        .local_idxs
                        .iter()
                        .map(|&rel| rel_to_abs_local[rel])
                        .collect();
                    let final_agg = Aggregation {
                        func: final_info.func,
                        distinct: false,
                        col_idx: arg_idxs.clone(),
                        filter_col_idx: None,
                    };
                    match final_aggs.iter().position(|a| *a == final_agg) {
                        Some(existing) => final_idx_map.push(existing),
                        None => {
                            final_idx_map.push(final_aggs.len());
                            final_aggs.push(final_agg);
                        }
                    }
                }
            }

            // IDENT aggregations keep the group columns flowing to the final
            // stage.
            let mut final_group_cols = Vec::with_capacity(group_cols.len());
            for &group_col in &group_cols {
                let ident = Aggregation {
                    func: AggFunc::Ident,
                    distinct: false,
                    col_idx: vec![group_col],
                    filter_col_idx: None,
                };
                let idx = match local_aggs.iter().position(|a| *a == ident) {
                    Some(existing) => existing,
                    None => {
                        intermediate_types.push(input_types[group_col].clone());
                        local_aggs.push(ident);
                        local_aggs.len() - 1
                    }
                };
                final_group_cols.push(idx);
            }

            let local_spec = AggregatorSpec {
                aggregations: local_aggs,
                group_cols: group_cols.clone(),
            };
            // Local aggregators don't guarantee any output ordering.
            plan.add_no_grouping_stage(
                ProcessorCore::Aggregator(local_spec),
                PostProcessSpec::default(),
                intermediate_types.clone(),
                MergeOrdering::Terminated,
            );

            if need_render {
                // One rendering per logical aggregate, indexing into the
                // de-duplicated final aggregations.
                let mut render_exprs = Vec::with_capacity(aggregations.len());
                let mut final_idx = 0;
                for agg in &aggregations {
                    let info = dist_aggregation_info(agg.func).expect("checked above");
                    match info.final_rendering {
                        None => render_exprs.push(Expr::Column(final_idx_map[final_idx])),
                        Some(render) => {
                            let mapped: Vec<usize> = (0..info.final_stage.len())
                                .map(|j| final_idx_map[final_idx + j])
                                .collect();
                            render_exprs.push(render(&mapped));
                        }
                    }
                    final_idx += info.final_stage.len();
                }
                final_aggs_post.render_exprs = render_exprs;
                final_out_types = logical_aggregate_types(&aggregations, &input_types)?;
            } else if final_aggs.len() < aggregations.len() {
                // Pure de-duplication: the stream carries one column per
                // distinct final aggregate; fan logical aggregates into it.
                plan.plan_to_stream_col_map =
                    final_idx_map.iter().map(|&idx| Some(idx)).collect();
                plan_to_stream_map_set = true;
                final_out_types =
                    final_stage_types(&final_aggs, &intermediate_types)?;
            } else {
                final_out_types = final_stage_types(&final_aggs, &intermediate_types)?;
            }

            final_aggs_spec = AggregatorSpec {
                aggregations: final_aggs,
                group_cols: final_group_cols,
            };
        }

        let num_logical_aggs = n.aggregates.len();
        if final_aggs_spec.group_cols.is_empty() || plan.result_routers.len() == 1 {
            // No GROUP BY, or a single stream: one final aggregator, on the
            // previous stage's node when there is one, else on the gateway.
            let node = prev_stage_node.unwrap_or(self.gateway.id);
            plan.add_single_group_stage(
                node,
                ProcessorCore::Aggregator(final_aggs_spec),
                final_aggs_post,
                final_out_types,
            );
        } else {
            // Distribute on the group columns, one final aggregator per
            // upstream router, co-located with it.
            let group_cols = final_aggs_spec.group_cols.clone();
            let prev_routers = plan.result_routers.clone();
            for &router in &prev_routers {
                plan.processors[router].spec.output[0].kind = RouterKind::ByHash {
                    hash_columns: group_cols.clone(),
                };
            }

            let stage_id = plan.new_stage_id();
            let p_idx_start = plan.processors.len();
            for &router in &prev_routers {
                let node = plan.processors[router].node;
                plan.add_processor(Processor {
                    node,
                    spec: ProcessorSpec {
                        input: vec![InputSyncSpec::unordered(plan.result_types.clone())],
                        core: ProcessorCore::Aggregator(final_aggs_spec.clone()),
                        post: final_aggs_post.clone(),
                        output: vec![OutputRouterSpec::pass_through()],
                        stage_id,
                    },
                });
            }
            for bucket in 0..prev_routers.len() {
                plan.merge_result_streams(&prev_routers, bucket, &[], p_idx_start + bucket, 0);
            }
            plan.result_routers = (p_idx_start..p_idx_start + prev_routers.len()).collect();
            plan.result_types = final_out_types;
            plan.set_merge_ordering(MergeOrdering::Terminated);
        }

        if !plan_to_stream_map_set {
            plan.plan_to_stream_col_map = identity_col_map(num_logical_aggs);
        }
        Ok(())
    }

    /// Sorting: a sorter stage when the input does not already satisfy the
    /// requested ordering, then a projection dropping sort-only columns.
    fn add_sorters(&self, plan: &mut PhysicalPlan, n: &SortNode) {
        let match_len = n.input.physical_props().compute_match(&n.ordering);

        if match_len < n.ordering.len() {
            let ordering: Vec<OrderingColumn> = n
                .ordering
                .iter()
                .map(|oc| OrderingColumn {
                    col_idx: plan.plan_to_stream_col_map[oc.col_idx].unwrap_or_else(|| {
                        panic!("column {} in sort ordering not available", oc.col_idx)
                    }),
                    direction: oc.direction,
                })
                .collect();
            plan.add_no_grouping_stage(
                ProcessorCore::Sorter(SorterSpec {
                    output_ordering: ordering.clone(),
                    ordering_match_len: match_len,
                }),
                PostProcessSpec::default(),
                plan.result_types.clone(),
                MergeOrdering::Columns(ordering),
            );
        }

        if n.columns.len() != plan.plan_to_stream_col_map.len() {
            // Trailing columns only fed the sort; project them away so the
            // plan's results map 1-to-1 to the node's columns.
            let columns: Vec<usize> = (0..n.columns.len())
                .map(|i| {
                    plan.plan_to_stream_col_map[i].expect("sort output column not materialized")
                })
                .collect();
            plan.plan_to_stream_col_map = identity_col_map(n.columns.len());
            plan.add_projection(columns);
        }
    }

    /// Distinct: one local pass when there is a single stream; otherwise a
    /// local pass per stream followed by a gateway-placed pass.
    fn add_distinct(&self, plan: &mut PhysicalPlan, n: &crate::logical_plan::DistinctNode) {
        let mut ordered_columns = Vec::new();
        for (col, in_order) in n.columns_in_order.iter().enumerate() {
            if *in_order {
                ordered_columns.push(
                    plan.plan_to_stream_col_map[col].expect("ordered column not materialized"),
                );
            }
        }
        let mut distinct_columns = Vec::new();
        for col in 0..n.input.columns().len() {
            if let Some(stream_col) = plan.plan_to_stream_col_map[col] {
                distinct_columns.push(stream_col);
            }
        }
        let spec = DistinctSpec {
            ordered_columns,
            distinct_columns,
        };

        let single_stream = plan.result_routers.len() == 1;
        plan.add_no_grouping_stage(
            ProcessorCore::Distinct(spec.clone()),
            PostProcessSpec::default(),
            plan.result_types.clone(),
            plan.merge_ordering.clone(),
        );
        if !single_stream {
            plan.add_single_group_stage(
                self.gateway.id,
                ProcessorCore::Distinct(spec),
                PostProcessSpec::default(),
                plan.result_types.clone(),
            );
        }
    }

    /// Rendering: updates the plan to produce the render node's output.
    fn select_renders(&self, plan: &mut PhysicalPlan, n: &RenderNode) {
        let types = types_for_plan_result(&n.columns, None);
        let map = plan.plan_to_stream_col_map.clone();
        plan.add_rendering(&n.render, &map, types);
        // The rendered output maps 1-to-1 to the node's columns.
        plan.plan_to_stream_col_map = identity_col_map(n.render.len());
    }

    /// A single values processor on the gateway carrying the literal rows.
    fn create_plan_for_values(&self, n: &ValuesNode) -> Result<PhysicalPlan> {
        let types: Vec<DataType> = n.columns.iter().map(|c| c.typ.clone()).collect();
        let mut rows: Vec<Vec<LiteralValue>> = Vec::with_capacity(n.rows.len());
        for row in &n.rows {
            let mut out = Vec::with_capacity(row.len());
            for expr in row {
                match expr {
                    Expr::Literal(value) => out.push(value.clone()),
                    _ => {
                        return Err(SfqError::Unsupported(
                            "non-constant VALUES row expression".into(),
                        ))
                    }
                }
            }
            rows.push(out);
        }

        let mut plan = PhysicalPlan::new();
        let stage_id = plan.new_stage_id();
        let idx = plan.add_processor(Processor {
            node: self.gateway.id,
            spec: ProcessorSpec {
                input: vec![],
                core: ProcessorCore::Values(ValuesSpec {
                    columns: types.clone(),
                    rows,
                }),
                post: PostProcessSpec::default(),
                output: vec![OutputRouterSpec::pass_through()],
                stage_id,
            },
        });
        plan.result_routers = vec![idx];
        plan.result_types = types;
        plan.plan_to_stream_col_map = identity_col_map(n.columns.len());
        Ok(plan)
    }

    /// Builds and finalizes an index/column backfill plan: one backfiller
    /// per span partition.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_backfiller(
        &self,
        planctx: &mut PlanningCtx,
        kind: BackfillKind,
        table: TableDesc,
        other_tables: Vec<TableDesc>,
        duration_ms: u64,
        chunk_size: u64,
        read_as_of_nanos: u64,
        spans: &[Span],
    ) -> Result<PhysicalPlan> {
        let partitions = self.partition_spans(planctx, spans).await?;

        let mut plan = PhysicalPlan::new();
        let stage_id = plan.new_stage_id();
        for partition in &partitions {
            let spec = BackfillerSpec {
                kind,
                table: table.clone(),
                other_tables: other_tables.clone(),
                duration_ms,
                chunk_size,
                read_as_of_nanos,
                spans: partition.spans.clone(),
            };
            let idx = plan.add_processor(Processor {
                node: partition.node,
                spec: ProcessorSpec {
                    input: vec![],
                    core: ProcessorCore::Backfiller(spec),
                    post: PostProcessSpec::default(),
                    output: vec![OutputRouterSpec::pass_through()],
                    stage_id,
                },
            });
            plan.result_routers.push(idx);
        }
        self.finalize_plan(planctx, &mut plan)?;
        Ok(plan)
    }

    /// Adds a final collection stage on the gateway if necessary, wires
    /// stream endpoints, and attaches the response stream. After this the
    /// plan is immutable; finalizing twice is rejected.
    pub fn finalize_plan(&self, planctx: &PlanningCtx, plan: &mut PhysicalPlan) -> Result<()> {
        if plan.is_finalized() {
            return Err(SfqError::Internal("plan already finalized".into()));
        }
        planctx.sanity_check_addresses()?;

        let gateway = self.gateway.id;
        if plan.result_routers.len() != 1
            || plan.processors[plan.result_routers[0]].node != gateway
        {
            plan.add_single_group_stage(
                gateway,
                ProcessorCore::Noop,
                PostProcessSpec::default(),
                plan.result_types.clone(),
            );
            if plan.result_routers.len() != 1 {
                panic!(
                    "{} results after single group stage",
                    plan.result_routers.len()
                );
            }
        }

        plan.populate_endpoints(&planctx.node_addresses)?;

        let final_router = plan.result_routers[0];
        let stream_id = plan.streams.len();
        plan.processors[final_router].spec.output[0]
            .streams
            .push(StreamEndpointSpec {
                kind: StreamEndpointKind::SyncResponse,
                stream_id,
            });
        plan.mark_finalized();

        if self.settings.log_plan_diagram() {
            debug!(diagram = %plan_diagram_json(plan)?, "finalized plan");
        }
        Ok(())
    }
}

/// Translates a node's logical ordering into stream-column terms.
pub(crate) fn convert_ordering(
    props: &PhysicalProps,
    plan_to_stream_col_map: &[Option<usize>],
) -> MergeOrdering {
    if props.ordering.is_empty() {
        return MergeOrdering::None;
    }
    let columns = props
        .ordering
        .iter()
        .map(|oc| OrderingColumn {
            col_idx: plan_to_stream_col_map[oc.col_idx].unwrap_or_else(|| {
                panic!("column {} in ordering not part of processor output", oc.col_idx)
            }),
            direction: oc.direction,
        })
        .collect();
    MergeOrdering::Columns(columns)
}

/// Indices of the scan columns the plan above consumes.
fn output_columns_from_scan(n: &ScanNode) -> Vec<usize> {
    n.needed_columns
        .iter()
        .enumerate()
        .filter_map(|(col, needed)| needed.then_some(col))
        .collect()
}

/// Types of the stream columns of a plan whose caller-visible columns are
/// `columns`. Without a map the stream is a 1-to-1 image of the columns.
fn types_for_plan_result(
    columns: &[Column],
    plan_to_stream_col_map: Option<&[Option<usize>]>,
) -> Vec<DataType> {
    match plan_to_stream_col_map {
        None => columns.iter().map(|c| c.typ.clone()).collect(),
        Some(map) => {
            let num_cols = map
                .iter()
                .flatten()
                .map(|&stream_col| stream_col + 1)
                .max()
                .unwrap_or(0);
            let mut types = vec![DataType::Null; num_cols];
            for (plan_col, stream_col) in map.iter().enumerate() {
                if let Some(stream_col) = stream_col {
                    types[*stream_col] = columns[plan_col].typ.clone();
                }
            }
            types
        }
    }
}

/// Output types of a list of aggregations applied to `input_types`.
fn logical_aggregate_types(
    aggregations: &[Aggregation],
    input_types: &[DataType],
) -> Result<Vec<DataType>> {
    aggregations
        .iter()
        .map(|agg| {
            let arg_types: Vec<DataType> =
                agg.col_idx.iter().map(|&c| input_types[c].clone()).collect();
            aggregate_output_type(agg.func, &arg_types)
        })
        .collect()
}

/// Output types of the final-stage aggregations over the local stage's
/// intermediate columns.
fn final_stage_types(
    final_aggs: &[Aggregation],
    intermediate_types: &[DataType],
) -> Result<Vec<DataType>> {
    final_aggs
        .iter()
        .map(|agg| {
            let arg_types: Vec<DataType> = agg
                .col_idx
                .iter()
                .map(|&c| intermediate_types[c].clone())
                .collect();
            aggregate_output_type(agg.func, &arg_types)
        })
        .collect()
}

/// Evaluates a LIMIT/OFFSET expression to a row count.
fn eval_limit_expr(expr: Option<&Expr>, what: &str) -> Result<Option<u64>> {
    match expr {
        None => Ok(None),
        Some(Expr::Literal(LiteralValue::Null)) => Ok(None),
        Some(Expr::Literal(LiteralValue::Int64(v))) => {
            if *v < 0 {
                return Err(SfqError::Planning(format!("{what} must not be negative")));
            }
            Ok(Some(*v as u64))
        }
        Some(_) => Err(SfqError::Planning(format!(
            "{what} must be a constant integer"
        ))),
    }
}

#[derive(Serialize)]
struct DiagramProcessor {
    node: String,
    core: &'static str,
    stage: u32,
}

#[derive(Serialize)]
struct DiagramStream {
    source: usize,
    dest: usize,
}

#[derive(Serialize)]
struct Diagram {
    processors: Vec<DiagramProcessor>,
    streams: Vec<DiagramStream>,
}

/// Compact JSON rendering of a plan, for debug logging.
fn plan_diagram_json(plan: &PhysicalPlan) -> Result<String> {
    let diagram = Diagram {
        processors: plan
            .processors
            .iter()
            .map(|p| DiagramProcessor {
                node: p.node.to_string(),
                core: p.spec.core.name(),
                stage: p.spec.stage_id.0,
            })
            .collect(),
        streams: plan
            .streams
            .iter()
            .map(|s| DiagramStream {
                source: s.source_processor,
                dest: s.dest_processor,
            })
            .collect(),
    };
    serde_json::to_string(&diagram)
        .map_err(|err| SfqError::Internal(format!("plan diagram rendering failed: {err}")))
}
