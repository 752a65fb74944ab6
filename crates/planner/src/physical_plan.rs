//! The physical plan model: processors, streams, routers, orderings.
//!
//! A physical plan under construction is a graph of placed processors plus a
//! set of unconnected "result routers" whose outputs are the plan's current
//! logical result. Translators grow the graph by appending stages wired to
//! the result routers; the finalizer turns streams into concrete transport
//! endpoints.
//!
//! Contract:
//! - all result routers produce rows typed exactly [`PhysicalPlan::result_types`];
//! - [`PhysicalPlan::merge_ordering`] is the ordering any downstream merger
//!   must respect when combining the parallel result routers;
//! - `plan_to_stream_col_map` translates caller-visible column ordinals to
//!   stream columns (`None` = not materialized).

use std::collections::HashMap;

use arrow_schema::DataType;
use serde::{Deserialize, Serialize};
use sfq_cluster::{Key, Span};
use sfq_common::{NodeId, Result, SfqError, StageId};

use crate::aggregation::AggFunc;
use crate::catalog::TableDesc;
use crate::expr::{Expr, LiteralValue};
use crate::logical_plan::JoinType;

/// Index of a processor inside one physical plan.
pub type ProcessorIdx = usize;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// One column of an ordering.
///
/// In logical properties `col_idx` is a plan-column ordinal; inside
/// processor specs it is a stream-column ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderingColumn {
    /// Column ordinal.
    pub col_idx: usize,
    /// Sort direction.
    pub direction: Direction,
}

impl OrderingColumn {
    /// Ascending ordering column.
    pub fn asc(col_idx: usize) -> Self {
        Self {
            col_idx,
            direction: Direction::Asc,
        }
    }

    /// Descending ordering column.
    pub fn desc(col_idx: usize) -> Self {
        Self {
            col_idx,
            direction: Direction::Desc,
        }
    }
}

/// The ordering contract between a plan's parallel result streams and any
/// downstream merger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum MergeOrdering {
    /// No ordering has been established.
    #[default]
    None,
    /// A stage destroyed ordering; downstream mergers need not preserve any.
    Terminated,
    /// Streams must be merged respecting this ordering.
    Columns(Vec<OrderingColumn>),
}

impl MergeOrdering {
    /// The ordering columns a merger must use (empty unless explicit).
    pub fn columns(&self) -> &[OrderingColumn] {
        match self {
            MergeOrdering::Columns(cols) => cols,
            _ => &[],
        }
    }
}

/// Table reader core: scans key spans of one table/index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableReaderSpec {
    /// Scanned table.
    pub table: TableDesc,
    /// Index selector: 0 is the primary index, i+1 the i-th secondary.
    pub index_idx: usize,
    /// Whether rows are produced in descending key order.
    pub reverse: bool,
    /// Key spans this reader owns.
    pub spans: Vec<Span>,
    /// Advisory row limit. The reader may over-read but should not
    /// under-read; correctness never depends on it.
    pub limit_hint: Option<u64>,
}

/// Join reader core: looks up base-table rows by primary key for each input
/// row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinReaderSpec {
    /// Base table.
    pub table: TableDesc,
    /// Index used for the lookup (0 = primary).
    pub index_idx: usize,
}

/// Hash joiner core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashJoinerSpec {
    /// Left equality columns (stream ordinals of input 0).
    pub left_eq_columns: Vec<usize>,
    /// Right equality columns (stream ordinals of input 1).
    pub right_eq_columns: Vec<usize>,
    /// Join semantics.
    pub join_type: JoinType,
    /// Extra ON condition over the joiner's internal column layout.
    pub on_expr: Option<Expr>,
    /// Whether the joiner emits merged equality columns ahead of the
    /// left/right columns.
    pub merged_columns: bool,
}

/// Merge joiner core. Requires both inputs ordered on the equality columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeJoinerSpec {
    /// Left input ordering over the equality columns.
    pub left_ordering: Vec<OrderingColumn>,
    /// Right input ordering over the equality columns.
    pub right_ordering: Vec<OrderingColumn>,
    /// Join semantics.
    pub join_type: JoinType,
    /// Extra ON condition over the joiner's internal column layout.
    pub on_expr: Option<Expr>,
}

/// Sorter core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SorterSpec {
    /// Ordering the sorter establishes.
    pub output_ordering: Vec<OrderingColumn>,
    /// Length of the ordering prefix the input already satisfies (enables
    /// incremental sorting).
    pub ordering_match_len: usize,
}

/// One aggregation computed by an [`AggregatorSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    /// Aggregate function.
    pub func: AggFunc,
    /// Whether inputs are de-duplicated first.
    pub distinct: bool,
    /// Argument columns (stream ordinals).
    pub col_idx: Vec<usize>,
    /// FILTER clause column (stream ordinal of a boolean column).
    pub filter_col_idx: Option<usize>,
}

/// Aggregator core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorSpec {
    /// Aggregations, one per output column.
    pub aggregations: Vec<Aggregation>,
    /// Grouping columns (stream ordinals).
    pub group_cols: Vec<usize>,
}

/// Distinct core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistinctSpec {
    /// Columns the input is already grouped on (allows streaming eviction).
    pub ordered_columns: Vec<usize>,
    /// The full distinct key.
    pub distinct_columns: Vec<usize>,
}

/// Literal row source core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValuesSpec {
    /// Column types.
    pub columns: Vec<DataType>,
    /// Literal rows.
    pub rows: Vec<Vec<LiteralValue>>,
}

/// CSV options for [`ReadCsvSpec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvOptions {
    /// Field separator.
    pub comma: char,
    /// Comment character, if any.
    pub comment: Option<char>,
    /// Input text treated as NULL, if any.
    pub null_if: Option<String>,
}

/// CSV reading/conversion core used by bulk-load plans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadCsvSpec {
    /// Input file URI.
    pub uri: String,
    /// KV sampling size in bytes; 0 disables sampling.
    pub sample_size: u32,
    /// Target table.
    pub table: TableDesc,
    /// CSV options.
    pub options: CsvOptions,
}

/// SST writing core used by bulk-load plans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SstWriterSpec {
    /// Destination directory/URI.
    pub destination: String,
    /// Output file name.
    pub name: String,
    /// Walltime stamped into written values.
    pub walltime_nanos: i64,
}

/// Schema-change backfill flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackfillKind {
    /// Index backfill.
    Index,
    /// Column backfill.
    Column,
}

/// Schema-change backfiller core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillerSpec {
    /// Backfill flavor.
    pub kind: BackfillKind,
    /// Table being backfilled.
    pub table: TableDesc,
    /// Other table descriptors the backfill consults.
    pub other_tables: Vec<TableDesc>,
    /// Checkpoint interval in milliseconds.
    pub duration_ms: u64,
    /// Rows per backfill chunk.
    pub chunk_size: u64,
    /// Historical read timestamp.
    pub read_as_of_nanos: u64,
    /// Key spans this backfiller owns.
    pub spans: Vec<Span>,
}

/// The computation a processor runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProcessorCore {
    TableReader(TableReaderSpec),
    JoinReader(JoinReaderSpec),
    HashJoiner(HashJoinerSpec),
    MergeJoiner(MergeJoinerSpec),
    Sorter(SorterSpec),
    Aggregator(AggregatorSpec),
    Distinct(DistinctSpec),
    Values(ValuesSpec),
    /// Pass-through, used for final collection stages and post-process-only
    /// stages.
    Noop,
    ReadCsv(ReadCsvSpec),
    SstWriter(SstWriterSpec),
    Backfiller(BackfillerSpec),
}

impl ProcessorCore {
    /// Display name used in plan diagrams.
    pub fn name(&self) -> &'static str {
        match self {
            ProcessorCore::TableReader(_) => "TableReader",
            ProcessorCore::JoinReader(_) => "JoinReader",
            ProcessorCore::HashJoiner(_) => "HashJoiner",
            ProcessorCore::MergeJoiner(_) => "MergeJoiner",
            ProcessorCore::Sorter(_) => "Sorter",
            ProcessorCore::Aggregator(_) => "Aggregator",
            ProcessorCore::Distinct(_) => "Distinct",
            ProcessorCore::Values(_) => "Values",
            ProcessorCore::Noop => "Noop",
            ProcessorCore::ReadCsv(_) => "ReadCSV",
            ProcessorCore::SstWriter(_) => "SSTWriter",
            ProcessorCore::Backfiller(_) => "Backfiller",
        }
    }
}

/// Row post-processing applied to a processor's core output, in order:
/// filter, then rendering/projection, then offset, then limit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostProcessSpec {
    /// Row filter over the core's output columns.
    pub filter: Option<Expr>,
    /// Output column selection (mutually exclusive with `render_exprs`).
    pub projection: Option<Vec<usize>>,
    /// Output expressions (mutually exclusive with `projection`).
    pub render_exprs: Vec<Expr>,
    /// Rows discarded before emitting.
    pub offset: u64,
    /// Maximum rows emitted.
    pub limit: Option<u64>,
}

/// Key interval of a by-range router slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeRouterSpan {
    /// Inclusive encoded start key.
    pub start: Key,
    /// Exclusive encoded end key.
    pub end: Key,
}

/// Disposition of a processor's output rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RouterKind {
    /// Single output stream.
    PassThrough,
    /// Rows are hashed on the named columns across the router's slots.
    ByHash {
        /// Hashed columns (stream ordinals).
        hash_columns: Vec<usize>,
    },
    /// Rows are routed by comparing an encoded column against span
    /// boundaries.
    ByRange {
        /// Routed column (stream ordinal).
        column: usize,
        /// One span per router slot.
        spans: Vec<RangeRouterSpan>,
    },
}

/// How a stream endpoint reaches its peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEndpointKind {
    /// Same-node channel.
    Local,
    /// Cross-node transport.
    Remote {
        /// Advertised address of the destination node.
        target_addr: String,
    },
    /// The plan's response stream back to the gateway's result consumer.
    SyncResponse,
}

/// One endpoint of a physical stream, filled in at finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEndpointSpec {
    /// Transport kind.
    pub kind: StreamEndpointKind,
    /// Plan-unique stream id.
    pub stream_id: usize,
}

/// A processor output router plus its finalized endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRouterSpec {
    /// Routing discipline.
    pub kind: RouterKind,
    /// One endpoint per router slot, populated at finalization.
    pub streams: Vec<StreamEndpointSpec>,
}

impl OutputRouterSpec {
    /// A pass-through router with no endpoints yet.
    pub fn pass_through() -> Self {
        Self {
            kind: RouterKind::PassThrough,
            streams: Vec::new(),
        }
    }
}

/// How multiple input streams are combined into one processor input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputSyncType {
    /// Streams are consumed in arbitrary interleaving.
    Unordered,
    /// Streams are merge-sorted respecting an ordering.
    OrderedMerge,
}

/// One input of a processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSyncSpec {
    /// Combination discipline.
    pub sync_type: InputSyncType,
    /// Merge ordering (only for [`InputSyncType::OrderedMerge`]).
    pub ordering: Vec<OrderingColumn>,
    /// Row type of the incoming streams.
    pub column_types: Vec<DataType>,
    /// Incoming endpoints, populated at finalization.
    pub streams: Vec<StreamEndpointSpec>,
}

impl InputSyncSpec {
    /// An unordered input of the given row type.
    pub fn unordered(column_types: Vec<DataType>) -> Self {
        Self {
            sync_type: InputSyncType::Unordered,
            ordering: Vec::new(),
            column_types,
            streams: Vec::new(),
        }
    }
}

/// Full specification of one processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorSpec {
    /// Inputs (readers have none; joiners have two).
    pub input: Vec<InputSyncSpec>,
    /// The computation.
    pub core: ProcessorCore,
    /// Post-processing of the core's output.
    pub post: PostProcessSpec,
    /// Output routers (always exactly one today).
    pub output: Vec<OutputRouterSpec>,
    /// Stage this processor belongs to.
    pub stage_id: StageId,
}

/// A placed processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Processor {
    /// Node the processor runs on.
    pub node: NodeId,
    /// Processor specification.
    pub spec: ProcessorSpec,
}

/// A directed edge between a processor's router slot and another processor's
/// input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    /// Source processor.
    pub source_processor: ProcessorIdx,
    /// Slot of the source's output router carrying this stream.
    pub source_router_slot: usize,
    /// Destination processor.
    pub dest_processor: ProcessorIdx,
    /// Destination input ordinal.
    pub dest_input: usize,
}

/// A physical plan, possibly still under construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhysicalPlan {
    /// All processors. Local indices into this vector identify processors.
    pub processors: Vec<Processor>,
    /// All streams.
    pub streams: Vec<Stream>,
    /// Processors whose outputs are the plan's current logical result.
    pub result_routers: Vec<ProcessorIdx>,
    /// Row type shared by every result router.
    pub result_types: Vec<DataType>,
    /// Ordering contract for merging the result routers.
    pub merge_ordering: MergeOrdering,
    /// Caller-visible column ordinal -> stream column (`None` = not
    /// materialized).
    pub plan_to_stream_col_map: Vec<Option<usize>>,
    stage_counter: u32,
    finalized: bool,
}

/// A plan-to-stream map with every column unmapped.
pub fn unmapped_col_map(num_cols: usize) -> Vec<Option<usize>> {
    vec![None; num_cols]
}

/// The identity plan-to-stream map over `num_cols` columns.
pub fn identity_col_map(num_cols: usize) -> Vec<Option<usize>> {
    (0..num_cols).map(Some).collect()
}

/// Composes a post-processing projection into a plan-to-stream map so that
/// expressions can be rewritten against the pre-projection columns.
fn reverse_projection(
    output_columns: &[usize],
    index_var_map: &[Option<usize>],
) -> Vec<Option<usize>> {
    index_var_map
        .iter()
        .map(|m| m.map(|stream_col| output_columns[stream_col]))
        .collect()
}

impl PhysicalPlan {
    /// An empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next stage id.
    pub fn new_stage_id(&mut self) -> StageId {
        self.stage_counter += 1;
        StageId(self.stage_counter)
    }

    /// Appends a processor and returns its index.
    pub fn add_processor(&mut self, processor: Processor) -> ProcessorIdx {
        self.processors.push(processor);
        self.processors.len() - 1
    }

    /// Whether the plan has been finalized.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub(crate) fn mark_finalized(&mut self) {
        self.finalized = true;
    }

    /// Sets the merge ordering; with at most one result router there is
    /// nothing to merge and no contract is recorded.
    pub fn set_merge_ordering(&mut self, ordering: MergeOrdering) {
        if self.result_routers.len() > 1 {
            self.merge_ordering = ordering;
        } else {
            self.merge_ordering = MergeOrdering::None;
        }
    }

    /// Connects `routers` (at `source_router_slot`) to one input of
    /// `dest_processor`, merge-sorting when an ordering is given and there is
    /// more than one stream.
    pub fn merge_result_streams(
        &mut self,
        routers: &[ProcessorIdx],
        source_router_slot: usize,
        ordering: &[OrderingColumn],
        dest_processor: ProcessorIdx,
        dest_input: usize,
    ) {
        let input = &mut self.processors[dest_processor].spec.input[dest_input];
        if ordering.is_empty() || routers.len() == 1 {
            input.sync_type = InputSyncType::Unordered;
        } else {
            input.sync_type = InputSyncType::OrderedMerge;
            input.ordering = ordering.to_vec();
        }
        for &router in routers {
            self.streams.push(Stream {
                source_processor: router,
                source_router_slot,
                dest_processor,
                dest_input,
            });
        }
    }

    /// Adds a stage of identical processors, one per result router,
    /// co-located with it (preserves parallelism; no cross-stream grouping).
    pub fn add_no_grouping_stage(
        &mut self,
        core: ProcessorCore,
        post: PostProcessSpec,
        output_types: Vec<DataType>,
        new_ordering: MergeOrdering,
    ) {
        let stage_id = self.new_stage_id();
        for i in 0..self.result_routers.len() {
            let prev = self.result_routers[i];
            let processor = Processor {
                node: self.processors[prev].node,
                spec: ProcessorSpec {
                    input: vec![InputSyncSpec::unordered(self.result_types.clone())],
                    core: core.clone(),
                    post: post.clone(),
                    output: vec![OutputRouterSpec::pass_through()],
                    stage_id,
                },
            };
            let idx = self.add_processor(processor);
            self.streams.push(Stream {
                source_processor: prev,
                source_router_slot: 0,
                dest_processor: idx,
                dest_input: 0,
            });
            self.result_routers[i] = idx;
        }
        self.result_types = output_types;
        self.set_merge_ordering(new_ordering);
    }

    /// Adds a single processor on `node` consuming every result router
    /// (respecting the current merge ordering), making it the sole result
    /// router.
    pub fn add_single_group_stage(
        &mut self,
        node: NodeId,
        core: ProcessorCore,
        post: PostProcessSpec,
        output_types: Vec<DataType>,
    ) {
        let stage_id = self.new_stage_id();
        let processor = Processor {
            node,
            spec: ProcessorSpec {
                input: vec![InputSyncSpec::unordered(self.result_types.clone())],
                core,
                post,
                output: vec![OutputRouterSpec::pass_through()],
                stage_id,
            },
        };
        let idx = self.add_processor(processor);
        let routers = std::mem::take(&mut self.result_routers);
        let ordering = self.merge_ordering.columns().to_vec();
        self.merge_result_streams(&routers, 0, &ordering, idx, 0);
        self.result_routers = vec![idx];
        self.result_types = output_types;
        self.merge_ordering = MergeOrdering::None;
    }

    /// Post-processing of the plan's last stage.
    pub fn get_last_stage_post(&self) -> PostProcessSpec {
        let first = self.result_routers[0];
        debug_assert!(self
            .result_routers
            .iter()
            .all(|&r| self.processors[r].spec.stage_id == self.processors[first].spec.stage_id));
        self.processors[first].spec.post.clone()
    }

    /// Replaces the post-processing of every result router and the plan's
    /// result types.
    pub fn set_last_stage_post(&mut self, post: PostProcessSpec, result_types: Vec<DataType>) {
        for i in 0..self.result_routers.len() {
            let idx = self.result_routers[i];
            self.processors[idx].spec.post = post.clone();
        }
        self.result_types = result_types;
    }

    /// Restricts the plan's output to `columns` (pre-projection stream
    /// ordinals), composing with any existing post-processing.
    ///
    /// Columns required by the merge ordering are retained even if not
    /// requested, and the merge ordering is remapped to the new positions.
    pub fn add_projection(&mut self, columns: Vec<usize>) {
        let mut columns = columns;
        if let MergeOrdering::Columns(ord) = self.merge_ordering.clone() {
            for oc in &ord {
                if !columns.contains(&oc.col_idx) {
                    columns.push(oc.col_idx);
                }
            }
            let remapped = ord
                .iter()
                .map(|oc| OrderingColumn {
                    col_idx: columns
                        .iter()
                        .position(|&c| c == oc.col_idx)
                        .expect("ordering column retained above"),
                    direction: oc.direction,
                })
                .collect();
            self.merge_ordering = MergeOrdering::Columns(remapped);
        }

        let new_types: Vec<DataType> = columns
            .iter()
            .map(|&c| self.result_types[c].clone())
            .collect();
        let mut post = self.get_last_stage_post();
        if !post.render_exprs.is_empty() {
            let old = std::mem::take(&mut post.render_exprs);
            post.render_exprs = columns.iter().map(|&c| old[c].clone()).collect();
        } else {
            if let Some(prev) = &post.projection {
                columns = columns.iter().map(|&c| prev[c]).collect();
            }
            post.projection = Some(columns);
        }
        self.set_last_stage_post(post, new_types);
    }

    /// Replaces the plan's output with rendered expressions (given over the
    /// caller's column space via `index_var_map`).
    ///
    /// Plain column references degrade to a projection. If the last stage
    /// already renders or limits, a no-op stage is chained first so the new
    /// renders consume its output.
    pub fn add_rendering(
        &mut self,
        exprs: &[Expr],
        index_var_map: &[Option<usize>],
        out_types: Vec<DataType>,
    ) {
        if exprs.iter().all(|e| e.as_column().is_some()) {
            let columns = exprs
                .iter()
                .map(|e| {
                    let plan_col = e.as_column().expect("checked above");
                    index_var_map[plan_col]
                        .unwrap_or_else(|| panic!("render refers to unmaterialized column {plan_col}"))
                })
                .collect();
            self.add_projection(columns);
            return;
        }

        let mut post = self.get_last_stage_post();
        if !post.render_exprs.is_empty() || post.limit.is_some() || post.offset != 0 {
            // The new renders consume the previous stage's rendered/limited
            // output; chain a no-op stage to attach them to.
            self.add_no_grouping_stage(
                ProcessorCore::Noop,
                PostProcessSpec::default(),
                self.result_types.clone(),
                self.merge_ordering.clone(),
            );
            post = PostProcessSpec::default();
        }
        let composite = match &post.projection {
            Some(proj) => reverse_projection(proj, index_var_map),
            None => index_var_map.to_vec(),
        };
        post.render_exprs = exprs.iter().map(|e| e.remap_columns(&composite)).collect();
        post.projection = None;

        if let MergeOrdering::Columns(ord) = &self.merge_ordering {
            let remapped = ord
                .iter()
                .map(|oc| {
                    let found = exprs
                        .iter()
                        .position(|e| {
                            e.as_column().and_then(|c| index_var_map[c]) == Some(oc.col_idx)
                        })
                        .unwrap_or_else(|| {
                            panic!("merge ordering column {} not in rendering", oc.col_idx)
                        });
                    OrderingColumn {
                        col_idx: found,
                        direction: oc.direction,
                    }
                })
                .collect();
            self.merge_ordering = MergeOrdering::Columns(remapped);
        }
        self.set_last_stage_post(post, out_types);
    }

    /// ANDs a filter (given over the caller's column space) into the last
    /// stage's post-processing. No new stage is added unless the last stage
    /// already renders or limits.
    pub fn add_filter(&mut self, expr: &Expr, index_var_map: &[Option<usize>]) {
        let mut post = self.get_last_stage_post();
        if !post.render_exprs.is_empty() || post.limit.is_some() || post.offset != 0 {
            self.add_no_grouping_stage(
                ProcessorCore::Noop,
                PostProcessSpec::default(),
                self.result_types.clone(),
                self.merge_ordering.clone(),
            );
            post = PostProcessSpec::default();
        }
        let composite = match &post.projection {
            Some(proj) => reverse_projection(proj, index_var_map),
            None => index_var_map.to_vec(),
        };
        let filter = expr.remap_columns(&composite);
        post.filter = Some(match post.filter.take() {
            Some(existing) => Expr::and(existing, filter),
            None => filter,
        });
        let types = self.result_types.clone();
        self.set_last_stage_post(post, types);
    }

    /// Applies a row limit/offset: merged into the last stage when it has a
    /// single stream, otherwise clamped by a single no-op stage on `gateway`.
    pub fn add_limit(&mut self, count: Option<u64>, offset: u64, gateway: NodeId) {
        if count.is_none() && offset == 0 {
            return;
        }
        if self.result_routers.len() == 1 {
            let post = self.get_last_stage_post();
            if post.limit.is_some() || post.offset != 0 {
                // A second limit cannot be merged into the same spec.
                self.add_no_grouping_stage(
                    ProcessorCore::Noop,
                    PostProcessSpec::default(),
                    self.result_types.clone(),
                    self.merge_ordering.clone(),
                );
            }
            let mut post = self.get_last_stage_post();
            post.limit = count;
            post.offset = offset;
            let types = self.result_types.clone();
            self.set_last_stage_post(post, types);
        } else {
            let post = PostProcessSpec {
                limit: count,
                offset,
                ..PostProcessSpec::default()
            };
            let types = self.result_types.clone();
            self.add_single_group_stage(gateway, ProcessorCore::Noop, post, types);
        }
    }

    /// Merges two independently-built plans into one graph (disjoint union,
    /// indices and stage ids offset), returning the merged plan and the two
    /// sides' result routers. Result bookkeeping is left for the caller.
    pub fn merge_plans(
        left: PhysicalPlan,
        right: PhysicalPlan,
    ) -> (PhysicalPlan, Vec<ProcessorIdx>, Vec<ProcessorIdx>) {
        let mut merged = left;
        let proc_offset = merged.processors.len();
        let stage_offset = merged.stage_counter;
        let left_routers = std::mem::take(&mut merged.result_routers);

        for mut processor in right.processors {
            processor.spec.stage_id = StageId(processor.spec.stage_id.0 + stage_offset);
            merged.processors.push(processor);
        }
        for stream in right.streams {
            merged.streams.push(Stream {
                source_processor: stream.source_processor + proc_offset,
                source_router_slot: stream.source_router_slot,
                dest_processor: stream.dest_processor + proc_offset,
                dest_input: stream.dest_input,
            });
        }
        let right_routers = right
            .result_routers
            .iter()
            .map(|&r| r + proc_offset)
            .collect();
        merged.stage_counter += right.stage_counter;
        merged.result_types = Vec::new();
        merged.merge_ordering = MergeOrdering::None;
        merged.plan_to_stream_col_map = Vec::new();
        (merged, left_routers, right_routers)
    }

    /// Fills in both endpoints of every stream: local when source and
    /// destination share a node, remote with the destination's advertised
    /// address otherwise.
    pub fn populate_endpoints(&mut self, addresses: &HashMap<NodeId, String>) -> Result<()> {
        let streams = self.streams.clone();
        for (stream_id, stream) in streams.iter().enumerate() {
            let source_node = self.processors[stream.source_processor].node;
            let dest_node = self.processors[stream.dest_processor].node;
            let kind = if source_node == dest_node {
                StreamEndpointKind::Local
            } else {
                let addr = addresses.get(&dest_node).ok_or_else(|| {
                    SfqError::Internal(format!("no address for node {dest_node} in planning context"))
                })?;
                if addr.is_empty() {
                    return Err(SfqError::Internal(format!(
                        "planned processor on unhealthy node {dest_node}"
                    )));
                }
                StreamEndpointKind::Remote {
                    target_addr: addr.clone(),
                }
            };
            let endpoint = StreamEndpointSpec { kind, stream_id };

            self.processors[stream.dest_processor].spec.input[stream.dest_input]
                .streams
                .push(endpoint.clone());

            let router = &mut self.processors[stream.source_processor].spec.output[0];
            while router.streams.len() <= stream.source_router_slot {
                router.streams.push(StreamEndpointSpec {
                    kind: StreamEndpointKind::Local,
                    stream_id: 0,
                });
            }
            router.streams[stream.source_router_slot] = endpoint;
        }
        Ok(())
    }
}
