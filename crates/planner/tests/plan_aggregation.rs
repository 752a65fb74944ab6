mod support;

use arrow_schema::DataType;
use sfq_common::{NodeId, SfqError, StageId};
use sfq_planner::{
    AggFunc, AggregateRef, AggregatorSpec, BinaryOp, Column, Expr, GroupNode, LogicalPlan,
    MergeOrdering, PhysicalPlan, ProcessorCore, RouterKind,
};
use support::{ctx, kv_scan, range, span, TestCluster};

fn group_node(
    input: LogicalPlan,
    aggregates: Vec<AggregateRef>,
    num_group_cols: usize,
    columns: Vec<Column>,
) -> LogicalPlan {
    LogicalPlan::Group(GroupNode {
        input: Box::new(input),
        aggregates,
        num_group_cols,
        columns,
    })
}

fn aggregator_stages(plan: &PhysicalPlan) -> Vec<(StageId, Vec<(NodeId, AggregatorSpec)>)> {
    let mut stages: Vec<(StageId, Vec<(NodeId, AggregatorSpec)>)> = Vec::new();
    for p in &plan.processors {
        if let ProcessorCore::Aggregator(spec) = &p.spec.core {
            match stages.iter_mut().find(|(id, _)| *id == p.spec.stage_id) {
                Some((_, procs)) => procs.push((p.node, spec.clone())),
                None => stages.push((p.spec.stage_id, vec![(p.node, spec.clone())])),
            }
        }
    }
    stages
}

fn multi_node_cluster() -> TestCluster {
    TestCluster::with_ranges(vec![range("a", "m", 2), range("m", "z", 3)])
}

// Scenario: AVG(v) over a multi-node scan decomposes into local SUM and
// COUNT, final SUM and SUM_INT, and a division rendering.
#[tokio::test]
async fn avg_decomposes_into_sum_count_and_a_rendering() {
    let (planner, _) = multi_node_cluster().build();
    let mut planctx = ctx(&planner);
    let node = group_node(
        LogicalPlan::Scan(kv_scan(vec![span("a", "z")])),
        vec![AggregateRef::new("AVG", 1)],
        0,
        vec![Column::new("avg", DataType::Float64)],
    );

    let plan = planner.create_plan_for_node(&mut planctx, &node).await.unwrap();

    let stages = aggregator_stages(&plan);
    assert_eq!(stages.len(), 2);

    // Local stage: one aggregator per reader, SUM(v) and COUNT(v).
    let (_, local) = &stages[0];
    assert_eq!(local.len(), 2);
    for (_, spec) in local {
        let funcs: Vec<AggFunc> = spec.aggregations.iter().map(|a| a.func).collect();
        assert_eq!(funcs, vec![AggFunc::Sum, AggFunc::Count]);
        assert!(spec.aggregations.iter().all(|a| a.col_idx == vec![1]));
    }

    // Final stage: single aggregator on the gateway, SUM and SUM_INT over
    // the local outputs, with the division rendering.
    let (_, finals) = &stages[1];
    assert_eq!(finals.len(), 1);
    let (final_node, final_spec) = &finals[0];
    assert_eq!(*final_node, NodeId(1));
    let funcs: Vec<AggFunc> = final_spec.aggregations.iter().map(|a| a.func).collect();
    assert_eq!(funcs, vec![AggFunc::Sum, AggFunc::SumInt]);
    assert_eq!(final_spec.aggregations[0].col_idx, vec![0]);
    assert_eq!(final_spec.aggregations[1].col_idx, vec![1]);

    let final_proc = plan
        .processors
        .iter()
        .find(|p| p.spec.stage_id == stages[1].0)
        .unwrap();
    assert_eq!(
        final_proc.spec.post.render_exprs,
        vec![Expr::binary(BinaryOp::Divide, Expr::Column(0), Expr::Column(1))]
    );

    assert_eq!(plan.result_types, vec![DataType::Float64]);
    assert_eq!(plan.plan_to_stream_col_map, vec![Some(0)]);
}

// SUM(v) and AVG(v) together: the local SUM(v) is de-duplicated, as is the
// final SUM over it.
#[tokio::test]
async fn shared_local_aggregates_are_deduplicated() {
    let (planner, _) = multi_node_cluster().build();
    let mut planctx = ctx(&planner);
    let node = group_node(
        LogicalPlan::Scan(kv_scan(vec![span("a", "z")])),
        vec![AggregateRef::new("SUM", 1), AggregateRef::new("AVG", 1)],
        0,
        vec![
            Column::new("sum", DataType::Int64),
            Column::new("avg", DataType::Float64),
        ],
    );

    let plan = planner.create_plan_for_node(&mut planctx, &node).await.unwrap();

    let stages = aggregator_stages(&plan);
    let (_, local) = &stages[0];
    let local_funcs: Vec<AggFunc> = local[0].1.aggregations.iter().map(|a| a.func).collect();
    assert_eq!(local_funcs, vec![AggFunc::Sum, AggFunc::Count]);

    let (_, finals) = &stages[1];
    let final_funcs: Vec<AggFunc> = finals[0].1.aggregations.iter().map(|a| a.func).collect();
    assert_eq!(final_funcs, vec![AggFunc::Sum, AggFunc::SumInt]);

    // SUM renders the shared final column; AVG divides it by the count.
    let final_proc = plan
        .processors
        .iter()
        .find(|p| p.spec.stage_id == stages[1].0)
        .unwrap();
    assert_eq!(
        final_proc.spec.post.render_exprs,
        vec![
            Expr::Column(0),
            Expr::binary(BinaryOp::Divide, Expr::Column(0), Expr::Column(1)),
        ]
    );
    assert_eq!(plan.result_types, vec![DataType::Int64, DataType::Float64]);
}

// Scenario: COUNT(DISTINCT k), SUM(DISTINCT v) over three streams plans a
// local distinct on each stream and a single final aggregator.
#[tokio::test]
async fn distinct_only_aggregation_gets_local_distinct_stages() {
    let (planner, _) = TestCluster::with_ranges(vec![
        range("a", "g", 2),
        range("g", "m", 3),
        range("m", "z", 4),
    ])
    .build();
    let mut planctx = ctx(&planner);
    let count_distinct = AggregateRef {
        func_name: "COUNT".into(),
        distinct: true,
        arg_col: Some(0),
        filter_col: None,
    };
    let sum_distinct = AggregateRef {
        func_name: "SUM".into(),
        distinct: true,
        arg_col: Some(1),
        filter_col: None,
    };
    let node = group_node(
        LogicalPlan::Scan(kv_scan(vec![span("a", "z")])),
        vec![count_distinct, sum_distinct],
        0,
        vec![
            Column::new("count", DataType::Int64),
            Column::new("sum", DataType::Int64),
        ],
    );

    let plan = planner.create_plan_for_node(&mut planctx, &node).await.unwrap();

    let distincts: Vec<_> = plan
        .processors
        .iter()
        .filter_map(|p| match &p.spec.core {
            ProcessorCore::Distinct(spec) => Some((p.node, spec.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(distincts.len(), 3);
    for (_, spec) in &distincts {
        assert_eq!(spec.distinct_columns, vec![0, 1]);
        assert_eq!(spec.ordered_columns, vec![0]);
    }

    let stages = aggregator_stages(&plan);
    assert_eq!(stages.len(), 1, "no local aggregation stage");
    let (_, finals) = &stages[0];
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].0, NodeId(1));
    assert!(finals[0].1.aggregations.iter().all(|a| a.distinct));
}

#[tokio::test]
async fn grouped_aggregation_hash_distributes_final_stage() {
    let (planner, _) = multi_node_cluster().build();
    let mut planctx = ctx(&planner);
    // SELECT k, SUM(v) FROM kv GROUP BY k.
    let node = group_node(
        LogicalPlan::Scan(kv_scan(vec![span("a", "z")])),
        vec![AggregateRef::ident(0), AggregateRef::new("SUM", 1)],
        1,
        vec![
            Column::new("k", DataType::Int64),
            Column::new("sum", DataType::Int64),
        ],
    );

    let plan = planner.create_plan_for_node(&mut planctx, &node).await.unwrap();

    let stages = aggregator_stages(&plan);
    assert_eq!(stages.len(), 2);

    // Local stage de-duplicates the IDENT(k) shared by the passthrough
    // column and the group key.
    let (_, local) = &stages[0];
    assert_eq!(local.len(), 2);
    let local_funcs: Vec<AggFunc> = local[0].1.aggregations.iter().map(|a| a.func).collect();
    assert_eq!(local_funcs, vec![AggFunc::Ident, AggFunc::Sum]);

    // Local aggregators hash-distribute on the final group columns to the
    // final stage, co-located with the feeding routers.
    let local_stage_id = stages[0].0;
    for p in plan
        .processors
        .iter()
        .filter(|p| p.spec.stage_id == local_stage_id)
    {
        match &p.spec.output[0].kind {
            RouterKind::ByHash { hash_columns } => assert_eq!(hash_columns, &vec![0]),
            other => panic!("local aggregator router is {other:?}"),
        }
    }
    let (_, finals) = &stages[1];
    assert_eq!(finals.len(), 2);
    let mut final_nodes: Vec<u32> = finals.iter().map(|(n, _)| n.0).collect();
    final_nodes.sort_unstable();
    assert_eq!(final_nodes, vec![2, 3]);
    assert_eq!(plan.merge_ordering, MergeOrdering::Terminated);
    assert_eq!(plan.result_routers.len(), 2);
}

#[tokio::test]
async fn single_node_upstream_uses_one_single_stage_aggregator() {
    let (planner, _) = TestCluster::with_ranges(vec![range("a", "z", 3)]).build();
    let mut planctx = ctx(&planner);
    let node = group_node(
        LogicalPlan::Scan(kv_scan(vec![span("a", "z")])),
        vec![AggregateRef::new("SUM", 1)],
        0,
        vec![Column::new("sum", DataType::Int64)],
    );

    let plan = planner.create_plan_for_node(&mut planctx, &node).await.unwrap();

    let stages = aggregator_stages(&plan);
    assert_eq!(stages.len(), 1, "no local stage for a single-node input");
    let (_, aggs) = &stages[0];
    assert_eq!(aggs.len(), 1);
    // Co-located with the upstream rather than pulled to the gateway.
    assert_eq!(aggs[0].0, NodeId(3));
}

#[tokio::test]
async fn pure_deduplication_reshuffles_the_column_map() {
    let (planner, _) = multi_node_cluster().build();
    let mut planctx = ctx(&planner);
    // The same aggregate twice; no rendering is involved.
    let node = group_node(
        LogicalPlan::Scan(kv_scan(vec![span("a", "z")])),
        vec![AggregateRef::new("SUM", 1), AggregateRef::new("SUM", 1)],
        0,
        vec![
            Column::new("sum1", DataType::Int64),
            Column::new("sum2", DataType::Int64),
        ],
    );

    let plan = planner.create_plan_for_node(&mut planctx, &node).await.unwrap();

    // One stream column serves both logical aggregates.
    assert_eq!(plan.result_types, vec![DataType::Int64]);
    assert_eq!(plan.plan_to_stream_col_map, vec![Some(0), Some(0)]);
}

#[tokio::test]
async fn unknown_aggregate_name_is_an_error() {
    let (planner, _) = multi_node_cluster().build();
    let mut planctx = ctx(&planner);
    let node = group_node(
        LogicalPlan::Scan(kv_scan(vec![span("a", "z")])),
        vec![AggregateRef::new("MEDIAN", 1)],
        0,
        vec![Column::new("median", DataType::Int64)],
    );

    let err = planner
        .create_plan_for_node(&mut planctx, &node)
        .await
        .unwrap_err();
    assert_eq!(err, SfqError::UnknownAggregate("MEDIAN".into()));
}

// ---------------------------------------------------------------------------
// Round-trip law: the emitted local+final+rendering subgraph computes the
// same value as a single-stage aggregation over the same input, checked with
// a small reference evaluator over literal rows.
// ---------------------------------------------------------------------------

fn eval_agg(func: AggFunc, values: &[f64]) -> f64 {
    match func {
        AggFunc::Sum | AggFunc::SumInt => values.iter().sum(),
        AggFunc::Count => values.len() as f64,
        AggFunc::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        AggFunc::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggFunc::Avg => values.iter().sum::<f64>() / values.len() as f64,
        AggFunc::Ident => values[0],
        other => panic!("evaluator does not model {other:?}"),
    }
}

fn eval_expr(expr: &Expr, row: &[f64]) -> f64 {
    match expr {
        Expr::Column(idx) => row[*idx],
        Expr::BinaryOp {
            op: BinaryOp::Divide,
            left,
            right,
        } => eval_expr(left, row) / eval_expr(right, row),
        other => panic!("evaluator does not model {other:?}"),
    }
}

fn eval_spec(spec: &AggregatorSpec, rows: &[Vec<f64>]) -> Vec<f64> {
    spec.aggregations
        .iter()
        .map(|agg| {
            let values: Vec<f64> = rows.iter().map(|row| row[agg.col_idx[0]]).collect();
            eval_agg(agg.func, &values)
        })
        .collect()
}

#[tokio::test]
async fn two_stage_aggregation_matches_single_stage_results() {
    let (planner, _) = TestCluster::with_ranges(vec![
        range("a", "g", 2),
        range("g", "m", 3),
        range("m", "z", 4),
    ])
    .build();
    let mut planctx = ctx(&planner);
    let aggregates = vec![
        AggregateRef::new("SUM", 1),
        AggregateRef::new("AVG", 1),
        AggregateRef::new("COUNT", 1),
        AggregateRef::new("MIN", 0),
    ];
    let node = group_node(
        LogicalPlan::Scan(kv_scan(vec![span("a", "z")])),
        aggregates.clone(),
        0,
        vec![
            Column::new("sum", DataType::Int64),
            Column::new("avg", DataType::Float64),
            Column::new("count", DataType::Int64),
            Column::new("min", DataType::Int64),
        ],
    );

    let plan = planner.create_plan_for_node(&mut planctx, &node).await.unwrap();
    let stages = aggregator_stages(&plan);
    assert_eq!(stages.len(), 2);
    let local_spec = stages[0].1[0].1.clone();
    let final_spec = stages[1].1[0].1.clone();
    let renders = plan
        .processors
        .iter()
        .find(|p| p.spec.stage_id == stages[1].0)
        .unwrap()
        .spec
        .post
        .render_exprs
        .clone();
    assert_eq!(renders.len(), aggregates.len());

    // Input rows (k, v), split into three per-node streams.
    let streams: Vec<Vec<Vec<f64>>> = vec![
        vec![vec![1.0, 10.0], vec![2.0, 20.0]],
        vec![vec![3.0, 7.0]],
        vec![vec![4.0, 9.0], vec![5.0, 4.0], vec![6.0, 6.0]],
    ];
    let all_rows: Vec<Vec<f64>> = streams.iter().flatten().cloned().collect();

    // Distributed execution: local stage per stream, then the final stage
    // over the concatenated local outputs, then the renderings.
    let intermediate: Vec<Vec<f64>> = streams
        .iter()
        .map(|chunk| eval_spec(&local_spec, chunk))
        .collect();
    let final_row = eval_spec(&final_spec, &intermediate);
    let distributed: Vec<f64> = renders.iter().map(|e| eval_expr(e, &final_row)).collect();

    // Reference: a single-stage aggregation over all rows.
    let reference: Vec<f64> = vec![
        eval_agg(AggFunc::Sum, &all_rows.iter().map(|r| r[1]).collect::<Vec<_>>()),
        eval_agg(AggFunc::Avg, &all_rows.iter().map(|r| r[1]).collect::<Vec<_>>()),
        eval_agg(AggFunc::Count, &all_rows.iter().map(|r| r[1]).collect::<Vec<_>>()),
        eval_agg(AggFunc::Min, &all_rows.iter().map(|r| r[0]).collect::<Vec<_>>()),
    ];

    assert_eq!(distributed, reference);
}
