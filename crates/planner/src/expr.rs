use serde::{Deserialize, Serialize};
use sfq_common::Result;

/// Literal value carried by expressions and values rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiteralValue {
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit float.
    Float64(f64),
    /// UTF-8 string.
    Utf8(String),
    /// Boolean.
    Boolean(bool),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// SQL NULL.
    Null,
}

/// Binary scalar operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Divide,
}

/// Scalar expression.
///
/// Column references are ordinal: in logical expressions they index the
/// owning node's columns; once placed in a processor's post-processing spec
/// they index the processor's input stream (see [`Expr::remap_columns`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Ordinal column reference.
    Column(usize),
    /// Literal value.
    Literal(LiteralValue),
    /// Binary operation.
    BinaryOp {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Logical conjunction.
    And(Box<Expr>, Box<Expr>),
    /// Logical disjunction.
    Or(Box<Expr>, Box<Expr>),
    /// Logical negation.
    Not(Box<Expr>),
    /// Scalar function call, named by canonical upper-case text.
    Function {
        /// Canonical function name.
        name: String,
        /// Argument expressions.
        args: Vec<Expr>,
    },
    /// An embedded subquery. Opaque to the distributed planner, which
    /// rejects any expression containing one.
    Subquery,
}

impl Expr {
    /// Conjunction helper used when composing post-processing filters.
    pub fn and(left: Expr, right: Expr) -> Expr {
        Expr::And(Box::new(left), Box::new(right))
    }

    /// Binary-operation helper.
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Pre-order walk; the visitor may abort with an error.
    pub fn visit(&self, f: &mut impl FnMut(&Expr) -> Result<()>) -> Result<()> {
        f(self)?;
        match self {
            Expr::Column(_) | Expr::Literal(_) | Expr::Subquery => Ok(()),
            Expr::BinaryOp { left, right, .. } => {
                left.visit(f)?;
                right.visit(f)
            }
            Expr::And(l, r) | Expr::Or(l, r) => {
                l.visit(f)?;
                r.visit(f)
            }
            Expr::Not(e) => e.visit(f),
            Expr::Function { args, .. } => {
                for arg in args {
                    arg.visit(f)?;
                }
                Ok(())
            }
        }
    }

    /// Rewrites ordinal column references through `map`, translating the
    /// caller's column space into a processor's input-stream space.
    ///
    /// Referencing a column the map does not materialize is a planner bug.
    pub fn remap_columns(&self, map: &[Option<usize>]) -> Expr {
        match self {
            Expr::Column(idx) => {
                let mapped = map
                    .get(*idx)
                    .copied()
                    .flatten()
                    .unwrap_or_else(|| panic!("column {idx} not materialized in stream"));
                Expr::Column(mapped)
            }
            Expr::Literal(v) => Expr::Literal(v.clone()),
            Expr::BinaryOp { op, left, right } => Expr::BinaryOp {
                op: *op,
                left: Box::new(left.remap_columns(map)),
                right: Box::new(right.remap_columns(map)),
            },
            Expr::And(l, r) => {
                Expr::And(Box::new(l.remap_columns(map)), Box::new(r.remap_columns(map)))
            }
            Expr::Or(l, r) => {
                Expr::Or(Box::new(l.remap_columns(map)), Box::new(r.remap_columns(map)))
            }
            Expr::Not(e) => Expr::Not(Box::new(e.remap_columns(map))),
            Expr::Function { name, args } => Expr::Function {
                name: name.clone(),
                args: args.iter().map(|a| a.remap_columns(map)).collect(),
            },
            Expr::Subquery => Expr::Subquery,
        }
    }

    /// Whether the expression is a bare column reference.
    pub fn as_column(&self) -> Option<usize> {
        match self {
            Expr::Column(idx) => Some(*idx),
            _ => None,
        }
    }
}
