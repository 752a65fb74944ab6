//! Decides whether a logical tree can and should run distributed.
//!
//! For each node kind the check either rejects the query with a
//! human-readable reason or produces a recommendation composed from the
//! children: avoidance dominates, then preference, then neutrality.

use arrow_schema::DataType;
use sfq_common::{Result, SfqError};

use crate::expr::Expr;
use crate::logical_plan::{LogicalPlan, ScanNode};

/// Functions that must not run distributed, by canonical upper-case name.
/// They depend on gateway-local session state or must evaluate exactly once
/// per query.
const DISTSQL_BLACKLIST: &[&str] = &[
    "RANDOM",
    "GEN_RANDOM_UUID",
    "UNIQUE_ROWID",
    "NOW",
    "CURRENT_TIMESTAMP",
    "CLOCK_TIMESTAMP",
    "STATEMENT_TIMESTAMP",
    "CLUSTER_LOGICAL_TIMESTAMP",
];

fn is_blacklisted(name: &str) -> bool {
    DISTSQL_BLACKLIST
        .iter()
        .any(|f| name.eq_ignore_ascii_case(f))
}

/// How much a plan subtree would benefit from distributed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistRecommendation {
    /// The plan could suffer if distributed.
    ShouldNotDistribute,
    /// The plan will probably neither benefit nor suffer.
    CanDistribute,
    /// The plan will likely benefit.
    ShouldDistribute,
}

impl DistRecommendation {
    /// Combines recommendations for two parts of a plan: if either part
    /// should not distribute, the whole plan should not either.
    pub fn compose(self, other: DistRecommendation) -> DistRecommendation {
        use DistRecommendation::*;
        if self == ShouldNotDistribute || other == ShouldNotDistribute {
            return ShouldNotDistribute;
        }
        if self == ShouldDistribute || other == ShouldDistribute {
            return ShouldDistribute;
        }
        CanDistribute
    }
}

/// Verifies that an expression contains nothing the distributed engine
/// cannot evaluate (subqueries, blacklisted functions).
pub fn check_expr(expr: &Expr) -> Result<()> {
    expr.visit(&mut |e| match e {
        Expr::Subquery => Err(SfqError::Unsupported(
            "subqueries not supported yet".into(),
        )),
        Expr::Function { name, .. } if is_blacklisted(name) => Err(SfqError::Unsupported(
            format!("function {name} cannot be executed with distsql"),
        )),
        _ => Ok(()),
    })
}

fn check_opt_expr(expr: Option<&Expr>) -> Result<()> {
    match expr {
        Some(e) => check_expr(e),
        None => Ok(()),
    }
}

/// The element type if `typ` is a list, recursively; `typ` itself otherwise.
fn leaf_type(typ: &DataType) -> &DataType {
    match typ {
        DataType::List(field) | DataType::LargeList(field) | DataType::FixedSizeList(field, _) => {
            leaf_type(field.data_type())
        }
        other => other,
    }
}

fn check_scan(n: &ScanNode) -> Result<DistRecommendation> {
    let mut rec = DistRecommendation::CanDistribute;
    if n.hard_limit.is_some() || n.soft_limit.is_some() {
        // There is no infrastructure to plan for only a few ranges at a
        // time, so a limited scan read across the cluster wastes work.
        rec = DistRecommendation::ShouldNotDistribute;
    }
    if let Some(filter) = &n.filter {
        check_expr(filter)?;
        rec = rec.compose(DistRecommendation::ShouldDistribute);
    }
    let full_scan = n
        .desc
        .index(n.index)
        .is_some_and(|idx| n.spans.len() == 1 && n.spans[0] == idx.span);
    if full_scan {
        rec = rec.compose(DistRecommendation::ShouldDistribute);
    }
    Ok(rec)
}

/// Returns a recommendation for the subtree, or an error if the distributed
/// engine cannot run it.
pub fn check_support_for_node(node: &LogicalPlan) -> Result<DistRecommendation> {
    match node {
        LogicalPlan::Filter(n) => {
            check_expr(&n.filter)?;
            check_support_for_node(&n.input)
        }

        LogicalPlan::Render(n) => {
            for (expr, col) in n.render.iter().zip(n.columns.iter()) {
                if matches!(leaf_type(&col.typ), DataType::Struct(_)) {
                    return Err(SfqError::Unsupported(format!(
                        "unsupported render type {}",
                        col.typ
                    )));
                }
                check_expr(expr)?;
            }
            check_support_for_node(&n.input)
        }

        LogicalPlan::Sort(n) => {
            let mut rec = check_support_for_node(&n.input)?;
            if n.need_sort {
                rec = rec.compose(DistRecommendation::ShouldDistribute);
            }
            Ok(rec)
        }

        LogicalPlan::Join(n) => {
            check_opt_expr(n.pred.on_cond.as_ref())?;
            let rec_left = check_support_for_node(&n.left)?;
            let rec_right = check_support_for_node(&n.right)?;
            let mut rec = rec_left.compose(rec_right);
            // A hash join distributes well.
            if !n.pred.left_eq_cols.is_empty() {
                rec = rec.compose(DistRecommendation::ShouldDistribute);
            }
            Ok(rec)
        }

        LogicalPlan::Scan(n) => check_scan(n),

        LogicalPlan::IndexJoin(n) => {
            // The table side has no meaningful spans, but its filter still
            // needs checking.
            check_scan(&n.table)?;
            check_scan(&n.index)
        }

        LogicalPlan::Group(n) => {
            for agg in &n.aggregates {
                if agg.func_name.eq_ignore_ascii_case("ARRAY_AGG") {
                    return Err(SfqError::Unsupported(
                        "ARRAY_AGG aggregation not supported yet".into(),
                    ));
                }
            }
            let rec = check_support_for_node(&n.input)?;
            Ok(rec.compose(DistRecommendation::ShouldDistribute))
        }

        LogicalPlan::Limit(n) => {
            check_opt_expr(n.count.as_ref())?;
            check_opt_expr(n.offset.as_ref())?;
            check_support_for_node(&n.input)
        }

        LogicalPlan::Distinct(n) => check_support_for_node(&n.input),

        LogicalPlan::Values(n) => {
            for row in &n.rows {
                for expr in row {
                    check_expr(expr)?;
                }
            }
            Ok(DistRecommendation::ShouldDistribute)
        }

        LogicalPlan::Mutation(_) => Err(SfqError::Unsupported("mutations not supported".into())),

        LogicalPlan::Set(_) => Err(SfqError::Unsupported(
            "SET / SET CLUSTER SETTING should never distribute".into(),
        )),
    }
}

/// Whether the tree can run distributed and is recommended to.
pub fn should_distribute(node: &LogicalPlan) -> Result<bool> {
    Ok(check_support_for_node(node)? == DistRecommendation::ShouldDistribute)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_lattice() {
        use DistRecommendation::*;
        assert_eq!(ShouldNotDistribute.compose(ShouldDistribute), ShouldNotDistribute);
        assert_eq!(ShouldDistribute.compose(CanDistribute), ShouldDistribute);
        assert_eq!(CanDistribute.compose(CanDistribute), CanDistribute);
    }

    #[test]
    fn blacklist_is_case_insensitive() {
        assert!(is_blacklisted("random"));
        assert!(is_blacklisted("NOW"));
        assert!(!is_blacklisted("LOWER"));
    }

    #[test]
    fn subquery_in_expression_is_rejected() {
        let expr = Expr::and(Expr::Column(0), Expr::Subquery);
        assert!(matches!(check_expr(&expr), Err(SfqError::Unsupported(_))));
    }
}
