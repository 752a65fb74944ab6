//! The logical relational tree consumed by the distributed planner.
//!
//! The tree is produced by the session layer and read here without
//! modification. The variant set is closed: each kind has exactly one
//! translator (or an explicit rejection) in the physical planner.

use serde::{Deserialize, Serialize};
use sfq_cluster::Span;

use crate::catalog::{Column, IndexId, TableDesc};
use crate::expr::Expr;
use crate::physical_plan::OrderingColumn;

/// Join semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
}

/// Ordering and related physical properties of a logical node's output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhysicalProps {
    /// Ordering of the node's rows, over the node's column ordinals.
    pub ordering: Vec<OrderingColumn>,
}

impl PhysicalProps {
    /// Length of the longest prefix of `desired` already satisfied by these
    /// properties.
    pub fn compute_match(&self, desired: &[OrderingColumn]) -> usize {
        desired
            .iter()
            .zip(self.ordering.iter())
            .take_while(|(want, have)| want == have)
            .count()
    }
}

/// The logical relational tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogicalPlan {
    Scan(ScanNode),
    Filter(FilterNode),
    Render(RenderNode),
    Sort(SortNode),
    Join(JoinNode),
    IndexJoin(IndexJoinNode),
    Group(GroupNode),
    Limit(LimitNode),
    Distinct(DistinctNode),
    Values(ValuesNode),
    Mutation(MutationNode),
    Set(SetNode),
}

/// Table or index scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanNode {
    /// Scanned table.
    pub desc: TableDesc,
    /// Index the scan reads.
    pub index: IndexId,
    /// Whether the scan runs in descending key order.
    pub reverse: bool,
    /// Key spans to read.
    pub spans: Vec<Span>,
    /// Filter over the scan's result columns.
    pub filter: Option<Expr>,
    /// Exact row limit; readers must not return more rows.
    pub hard_limit: Option<u64>,
    /// Advisory row limit; readers may over-read but should not under-read.
    pub soft_limit: Option<u64>,
    /// One result column per table column, in stored order.
    pub result_columns: Vec<Column>,
    /// Which result columns the plan above actually consumes (including
    /// columns the filter needs).
    pub needed_columns: Vec<bool>,
    /// Output properties (index ordering).
    pub props: PhysicalProps,
}

/// Row filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterNode {
    /// Input plan.
    pub input: Box<LogicalPlan>,
    /// Predicate over the input's columns.
    pub filter: Expr,
}

/// Expression rendering (projection with computation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderNode {
    /// Input plan.
    pub input: Box<LogicalPlan>,
    /// One expression per output column, over the input's columns.
    pub render: Vec<Expr>,
    /// Output columns.
    pub columns: Vec<Column>,
    /// Output properties.
    pub props: PhysicalProps,
}

/// Sort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortNode {
    /// Input plan.
    pub input: Box<LogicalPlan>,
    /// Requested output ordering, over the node's column ordinals.
    pub ordering: Vec<OrderingColumn>,
    /// Whether the input is known to need sorting.
    pub need_sort: bool,
    /// Output columns (a prefix of the input's columns; trailing input
    /// columns may exist only to feed the sort).
    pub columns: Vec<Column>,
}

/// Equality and ON-condition predicate of a join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPredicate {
    /// Left equality columns, as left-plan ordinals.
    pub left_eq_cols: Vec<usize>,
    /// Right equality columns, as right-plan ordinals, positionally matched
    /// with `left_eq_cols`.
    pub right_eq_cols: Vec<usize>,
    /// Number of USING/NATURAL merged columns at the front of the join's
    /// output.
    pub num_merged_cols: usize,
    /// Column count contributed by the left side.
    pub num_left_cols: usize,
    /// Column count contributed by the right side.
    pub num_right_cols: usize,
    /// Extra ON condition over the join's column layout.
    pub on_cond: Option<Expr>,
}

/// Join of two plans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinNode {
    /// Left input.
    pub left: Box<LogicalPlan>,
    /// Right input.
    pub right: Box<LogicalPlan>,
    /// Join semantics.
    pub join_type: JoinType,
    /// Equality/ON predicate.
    pub pred: JoinPredicate,
    /// Output columns: merged columns, then left, then right.
    pub columns: Vec<Column>,
    /// Output properties.
    pub props: PhysicalProps,
    /// Ordering both inputs share over the equality columns, as positions
    /// into the equality-column lists. Non-empty only when the session layer
    /// established matching input orderings.
    pub merge_join_ordering: Vec<OrderingColumn>,
}

/// Secondary-index scan joined back to its base table by primary key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexJoinNode {
    /// The index side (provides spans and index ordering).
    pub index: Box<ScanNode>,
    /// The table side (provides the filter and the output columns).
    pub table: Box<ScanNode>,
    /// Output properties (inherited from the index scan).
    pub props: PhysicalProps,
}

/// One aggregate computed by a [`GroupNode`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateRef {
    /// Canonical function text (`IDENT` passes a grouped column through).
    pub func_name: String,
    /// Whether the aggregate de-duplicates its inputs.
    pub distinct: bool,
    /// Argument, as an input-plan column ordinal.
    pub arg_col: Option<usize>,
    /// FILTER clause column, as an input-plan column ordinal.
    pub filter_col: Option<usize>,
}

impl AggregateRef {
    /// Pass-through entry for a grouped column.
    pub fn ident(col: usize) -> Self {
        Self {
            func_name: "IDENT".into(),
            distinct: false,
            arg_col: Some(col),
            filter_col: None,
        }
    }

    /// Plain aggregate over one column.
    pub fn new(func_name: impl Into<String>, arg_col: usize) -> Self {
        Self {
            func_name: func_name.into(),
            distinct: false,
            arg_col: Some(arg_col),
            filter_col: None,
        }
    }
}

/// Aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupNode {
    /// Input plan; its first `num_group_cols` columns are the group key.
    pub input: Box<LogicalPlan>,
    /// One aggregate per output column.
    pub aggregates: Vec<AggregateRef>,
    /// Number of grouping columns.
    pub num_group_cols: usize,
    /// Output columns.
    pub columns: Vec<Column>,
}

/// Row-count limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitNode {
    /// Input plan.
    pub input: Box<LogicalPlan>,
    /// LIMIT expression (must evaluate to a non-negative integer constant).
    pub count: Option<Expr>,
    /// OFFSET expression (must evaluate to a non-negative integer constant).
    pub offset: Option<Expr>,
}

/// Duplicate elimination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistinctNode {
    /// Input plan.
    pub input: Box<LogicalPlan>,
    /// Per input column: whether incoming rows are already grouped on it.
    pub columns_in_order: Vec<bool>,
}

/// Literal row source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValuesNode {
    /// Output columns.
    pub columns: Vec<Column>,
    /// Literal tuples; every expression must be a constant.
    pub rows: Vec<Vec<Expr>>,
}

/// Mutation statement kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

/// Mutation statement. Never distributed; a different planner owns these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationNode {
    /// Statement kind.
    pub kind: MutationKind,
}

/// Session- or cluster-variable write. Never distributed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetNode {
    /// Whether the statement writes a cluster setting.
    pub cluster_setting: bool,
}

const NO_COLUMNS: &[Column] = &[];

impl LogicalPlan {
    /// The node's visible output columns.
    pub fn columns(&self) -> &[Column] {
        match self {
            LogicalPlan::Scan(n) => &n.result_columns,
            LogicalPlan::Filter(n) => n.input.columns(),
            LogicalPlan::Render(n) => &n.columns,
            LogicalPlan::Sort(n) => &n.columns,
            LogicalPlan::Join(n) => &n.columns,
            LogicalPlan::IndexJoin(n) => &n.table.result_columns,
            LogicalPlan::Group(n) => &n.columns,
            LogicalPlan::Limit(n) => n.input.columns(),
            LogicalPlan::Distinct(n) => n.input.columns(),
            LogicalPlan::Values(n) => &n.columns,
            LogicalPlan::Mutation(_) | LogicalPlan::Set(_) => NO_COLUMNS,
        }
    }

    /// Ordering-related physical properties of the node's output.
    pub fn physical_props(&self) -> PhysicalProps {
        match self {
            LogicalPlan::Scan(n) => n.props.clone(),
            LogicalPlan::Filter(n) => n.input.physical_props(),
            LogicalPlan::Render(n) => n.props.clone(),
            LogicalPlan::Sort(n) => PhysicalProps {
                ordering: n.ordering.clone(),
            },
            LogicalPlan::Join(n) => n.props.clone(),
            LogicalPlan::IndexJoin(n) => n.props.clone(),
            LogicalPlan::Limit(n) => n.input.physical_props(),
            LogicalPlan::Distinct(n) => n.input.physical_props(),
            LogicalPlan::Group(_)
            | LogicalPlan::Values(_)
            | LogicalPlan::Mutation(_)
            | LogicalPlan::Set(_) => PhysicalProps::default(),
        }
    }
}
