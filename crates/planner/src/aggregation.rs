//! Aggregate function vocabulary and multi-stage decomposition table.
//!
//! Contract:
//! - [`AggFunc::from_name`] maps canonical upper-case function text to the
//!   engine's enum; unknown names are an error, not a fallback;
//! - [`dist_aggregation_info`] describes how a function splits into local
//!   and final stages; functions absent from the table only run single-stage;
//! - final-stage inputs are *relative* indices into the function's own local
//!   stage; the planner maps them to absolute columns after de-duplication.

use arrow_schema::DataType;
use serde::{Deserialize, Serialize};
use sfq_common::{Result, SfqError};

use crate::expr::{BinaryOp, Expr};

/// Aggregate functions understood by the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggFunc {
    /// Pass-through of a grouped column.
    Ident,
    Avg,
    BoolAnd,
    BoolOr,
    ConcatAgg,
    Count,
    Max,
    Min,
    Stddev,
    Sum,
    /// Integer sum used to merge partial counts.
    SumInt,
    Variance,
    XorAgg,
}

impl AggFunc {
    /// Maps an aggregate's canonical text to the engine enum.
    pub fn from_name(name: &str) -> Result<AggFunc> {
        let canonical = name.to_ascii_uppercase();
        Ok(match canonical.as_str() {
            "IDENT" => AggFunc::Ident,
            "AVG" => AggFunc::Avg,
            "BOOL_AND" => AggFunc::BoolAnd,
            "BOOL_OR" => AggFunc::BoolOr,
            "CONCAT_AGG" => AggFunc::ConcatAgg,
            "COUNT" => AggFunc::Count,
            "MAX" => AggFunc::Max,
            "MIN" => AggFunc::Min,
            "STDDEV" => AggFunc::Stddev,
            "SUM" => AggFunc::Sum,
            "SUM_INT" => AggFunc::SumInt,
            "VARIANCE" => AggFunc::Variance,
            "XOR_AGG" => AggFunc::XorAgg,
            _ => return Err(SfqError::UnknownAggregate(canonical)),
        })
    }

    /// Canonical name of the function.
    pub fn name(&self) -> &'static str {
        match self {
            AggFunc::Ident => "IDENT",
            AggFunc::Avg => "AVG",
            AggFunc::BoolAnd => "BOOL_AND",
            AggFunc::BoolOr => "BOOL_OR",
            AggFunc::ConcatAgg => "CONCAT_AGG",
            AggFunc::Count => "COUNT",
            AggFunc::Max => "MAX",
            AggFunc::Min => "MIN",
            AggFunc::Stddev => "STDDEV",
            AggFunc::Sum => "SUM",
            AggFunc::SumInt => "SUM_INT",
            AggFunc::Variance => "VARIANCE",
            AggFunc::XorAgg => "XOR_AGG",
        }
    }
}

/// One final-stage aggregation of a decomposed function.
#[derive(Debug, Clone, Copy)]
pub struct FinalStageInfo {
    /// Function run at the collection point.
    pub func: AggFunc,
    /// Inputs, as indices relative to the function's own local stage.
    pub local_idxs: &'static [usize],
}

/// Decomposition of one aggregate function into local and final stages.
///
/// When `final_rendering` is set, the final stage alone does not produce the
/// logical value; the rendering combines the final outputs (given their
/// absolute column positions) into one column.
#[derive(Clone, Copy)]
pub struct DistAggregationInfo {
    /// Functions run close to the data.
    pub local_stage: &'static [AggFunc],
    /// Functions run at the collection point, fed by the local stage.
    pub final_stage: &'static [FinalStageInfo],
    /// Optional expression combining the final outputs.
    pub final_rendering: Option<fn(&[usize]) -> Expr>,
}

fn avg_rendering(final_idxs: &[usize]) -> Expr {
    Expr::binary(
        BinaryOp::Divide,
        Expr::Column(final_idxs[0]),
        Expr::Column(final_idxs[1]),
    )
}

const IDENT_INFO: DistAggregationInfo = DistAggregationInfo {
    local_stage: &[AggFunc::Ident],
    final_stage: &[FinalStageInfo {
        func: AggFunc::Ident,
        local_idxs: &[0],
    }],
    final_rendering: None,
};

const COUNT_INFO: DistAggregationInfo = DistAggregationInfo {
    local_stage: &[AggFunc::Count],
    final_stage: &[FinalStageInfo {
        func: AggFunc::SumInt,
        local_idxs: &[0],
    }],
    final_rendering: None,
};

const SUM_INFO: DistAggregationInfo = DistAggregationInfo {
    local_stage: &[AggFunc::Sum],
    final_stage: &[FinalStageInfo {
        func: AggFunc::Sum,
        local_idxs: &[0],
    }],
    final_rendering: None,
};

const SUM_INT_INFO: DistAggregationInfo = DistAggregationInfo {
    local_stage: &[AggFunc::SumInt],
    final_stage: &[FinalStageInfo {
        func: AggFunc::SumInt,
        local_idxs: &[0],
    }],
    final_rendering: None,
};

const MIN_INFO: DistAggregationInfo = DistAggregationInfo {
    local_stage: &[AggFunc::Min],
    final_stage: &[FinalStageInfo {
        func: AggFunc::Min,
        local_idxs: &[0],
    }],
    final_rendering: None,
};

const MAX_INFO: DistAggregationInfo = DistAggregationInfo {
    local_stage: &[AggFunc::Max],
    final_stage: &[FinalStageInfo {
        func: AggFunc::Max,
        local_idxs: &[0],
    }],
    final_rendering: None,
};

const BOOL_AND_INFO: DistAggregationInfo = DistAggregationInfo {
    local_stage: &[AggFunc::BoolAnd],
    final_stage: &[FinalStageInfo {
        func: AggFunc::BoolAnd,
        local_idxs: &[0],
    }],
    final_rendering: None,
};

const BOOL_OR_INFO: DistAggregationInfo = DistAggregationInfo {
    local_stage: &[AggFunc::BoolOr],
    final_stage: &[FinalStageInfo {
        func: AggFunc::BoolOr,
        local_idxs: &[0],
    }],
    final_rendering: None,
};

const XOR_AGG_INFO: DistAggregationInfo = DistAggregationInfo {
    local_stage: &[AggFunc::XorAgg],
    final_stage: &[FinalStageInfo {
        func: AggFunc::XorAgg,
        local_idxs: &[0],
    }],
    final_rendering: None,
};

const AVG_INFO: DistAggregationInfo = DistAggregationInfo {
    local_stage: &[AggFunc::Sum, AggFunc::Count],
    final_stage: &[
        FinalStageInfo {
            func: AggFunc::Sum,
            local_idxs: &[0],
        },
        FinalStageInfo {
            func: AggFunc::SumInt,
            local_idxs: &[1],
        },
    ],
    final_rendering: Some(avg_rendering),
};

/// Returns the decomposition of `func`, or `None` for functions that only
/// run single-stage (STDDEV, VARIANCE, CONCAT_AGG).
pub fn dist_aggregation_info(func: AggFunc) -> Option<&'static DistAggregationInfo> {
    match func {
        AggFunc::Ident => Some(&IDENT_INFO),
        AggFunc::Count => Some(&COUNT_INFO),
        AggFunc::Sum => Some(&SUM_INFO),
        AggFunc::SumInt => Some(&SUM_INT_INFO),
        AggFunc::Min => Some(&MIN_INFO),
        AggFunc::Max => Some(&MAX_INFO),
        AggFunc::BoolAnd => Some(&BOOL_AND_INFO),
        AggFunc::BoolOr => Some(&BOOL_OR_INFO),
        AggFunc::XorAgg => Some(&XOR_AGG_INFO),
        AggFunc::Avg => Some(&AVG_INFO),
        AggFunc::Stddev | AggFunc::Variance | AggFunc::ConcatAgg => None,
    }
}

/// Output column type of one function application.
pub fn aggregate_output_type(func: AggFunc, arg_types: &[DataType]) -> Result<DataType> {
    let arg = |pos: usize| -> Result<DataType> {
        arg_types.get(pos).cloned().ok_or_else(|| {
            SfqError::Internal(format!("aggregate {} is missing argument {pos}", func.name()))
        })
    };
    match func {
        AggFunc::Ident | AggFunc::Min | AggFunc::Max | AggFunc::Sum | AggFunc::XorAgg => arg(0),
        AggFunc::Count | AggFunc::SumInt => Ok(DataType::Int64),
        AggFunc::Avg | AggFunc::Stddev | AggFunc::Variance => Ok(DataType::Float64),
        AggFunc::BoolAnd | AggFunc::BoolOr => Ok(DataType::Boolean),
        AggFunc::ConcatAgg => Ok(DataType::Utf8),
    }
}
