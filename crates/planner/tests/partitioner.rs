mod support;

use sfq_common::{NodeId, SfqError};
use support::{ctx, range, span, TestCluster};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn spans_split_by_owning_node() {
    let (planner, _) = TestCluster::with_ranges(vec![
        range("a", "c", 1),
        range("c", "f", 2),
        range("f", "j", 1),
    ])
    .build();
    let mut planctx = ctx(&planner);

    let partitions = planner
        .partition_spans(&mut planctx, &[span("b", "h")])
        .await
        .unwrap();

    assert_eq!(partitions.len(), 2);
    assert_eq!(partitions[0].node, NodeId(1));
    assert_eq!(partitions[0].spans, vec![span("b", "c"), span("f", "h")]);
    assert_eq!(partitions[1].node, NodeId(2));
    assert_eq!(partitions[1].spans, vec![span("c", "f")]);
}

#[tokio::test]
async fn consecutive_ranges_on_one_node_coalesce() {
    let (planner, _) = TestCluster::with_ranges(vec![
        range("a", "c", 2),
        range("c", "e", 2),
        range("e", "g", 2),
    ])
    .build();
    let mut planctx = ctx(&planner);

    let partitions = planner
        .partition_spans(&mut planctx, &[span("a", "g")])
        .await
        .unwrap();

    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0].node, NodeId(2));
    assert_eq!(partitions[0].spans, vec![span("a", "g")]);
}

#[tokio::test]
async fn partitions_cover_exactly_the_input_spans() {
    let (planner, _) = TestCluster::with_ranges(vec![
        range("a", "d", 3),
        range("d", "g", 1),
        range("g", "k", 2),
        range("k", "p", 3),
    ])
    .build();
    let mut planctx = ctx(&planner);
    let inputs = [span("b", "i"), span("l", "n")];

    let partitions = planner.partition_spans(&mut planctx, &inputs).await.unwrap();

    // Non-overlapping, ascending per node, and the union tiles the inputs.
    let mut pieces: Vec<_> = partitions
        .iter()
        .flat_map(|p| {
            p.spans
                .windows(2)
                .for_each(|w| assert!(w[0].end_key <= w[1].key, "descending spans in partition"));
            p.spans.clone()
        })
        .collect();
    pieces.sort();
    for pair in pieces.windows(2) {
        assert!(!pair[0].overlaps(&pair[1]), "overlapping partitions");
    }
    let mut tiled = Vec::new();
    for input in &inputs {
        let mut cursor = input.key.clone();
        while cursor < input.end_key {
            let piece = pieces
                .iter()
                .find(|s| s.key == cursor)
                .unwrap_or_else(|| panic!("gap at {cursor:?}"));
            cursor = piece.end_key.clone();
            tiled.push(piece.clone());
        }
        assert_eq!(cursor, input.end_key);
    }
    assert_eq!(tiled.len(), pieces.len(), "pieces outside the input spans");
}

// Scenario: nodes {1,2,3} own ranges, node 2 fails the health probe, the
// gateway is node 1. Node 1 absorbs node 2's ranges with coalescing; node 3
// keeps its own.
#[tokio::test]
async fn unhealthy_owner_is_replaced_by_the_gateway() {
    let mut cluster = TestCluster::with_ranges(vec![
        range("a", "b", 1),
        range("b", "c", 2),
        range("c", "d", 3),
    ]);
    cluster.unhealthy = vec![2];
    let (planner, _) = cluster.build();
    let mut planctx = ctx(&planner);

    let partitions = planner
        .partition_spans(&mut planctx, &[span("a", "d")])
        .await
        .unwrap();

    assert_eq!(partitions.len(), 2);
    assert_eq!(partitions[0].node, NodeId(1));
    assert_eq!(partitions[0].spans, vec![span("a", "c")]);
    assert_eq!(partitions[1].node, NodeId(3));
    assert_eq!(partitions[1].spans, vec![span("c", "d")]);

    // The failed node is remembered with an empty address.
    assert_eq!(planctx.node_addresses.get(&NodeId(2)).map(String::as_str), Some(""));
}

#[tokio::test]
async fn node_missing_from_gossip_is_replaced_by_the_gateway() {
    let mut cluster = TestCluster::with_ranges(vec![range("a", "b", 1), range("b", "c", 4)]);
    cluster.unknown = vec![4];
    let (planner, _) = cluster.build();
    let mut planctx = ctx(&planner);

    let partitions = planner
        .partition_spans(&mut planctx, &[span("a", "c")])
        .await
        .unwrap();

    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0].node, NodeId(1));
    assert_eq!(partitions[0].spans, vec![span("a", "c")]);
}

// Scenario: plan version 5, node 3 advertises an accepted window of [7, 9].
// Its ranges move to the gateway, and the incompatibility decision is cached
// for the rest of the plan.
#[tokio::test]
async fn incompatible_version_is_replaced_and_cached() {
    let mut cluster = TestCluster::with_ranges(vec![
        range("a", "b", 3),
        range("b", "c", 1),
        range("c", "d", 3),
    ]);
    cluster.plan_version = 5;
    cluster.versions = vec![(3, 7, 9)];
    let (planner, view) = cluster.build();
    let mut planctx = ctx(&planner);

    let partitions = planner
        .partition_spans(&mut planctx, &[span("a", "d")])
        .await
        .unwrap();

    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0].node, NodeId(1));
    assert_eq!(partitions[0].spans, vec![span("a", "d")]);
    assert_eq!(view.version_calls_for(NodeId(3)), 1);

    // A second span through node 3 reuses the cached decision.
    let partitions = planner
        .partition_spans(&mut planctx, &[span("c", "d")])
        .await
        .unwrap();
    assert_eq!(partitions[0].node, NodeId(1));
    assert_eq!(view.version_calls_for(NodeId(3)), 1);
}

#[tokio::test]
async fn resolver_errors_propagate_unchanged() {
    let (planner, _) = TestCluster::with_ranges(vec![range("a", "b", 1)]).build();
    let mut planctx = ctx(&planner);

    // No range contains "x": the iterator reports the failure.
    let err = planner
        .partition_spans(&mut planctx, &[span("x", "y")])
        .await
        .unwrap_err();
    assert!(matches!(err, SfqError::Resolver(_)));
}

#[tokio::test]
async fn canceled_context_aborts_partitioning() {
    let (planner, _) = TestCluster::with_ranges(vec![range("a", "z", 2)]).build();
    let cancel = CancellationToken::new();
    let mut planctx = planner.new_planning_ctx(cancel.clone());
    cancel.cancel();

    let err = planner
        .partition_spans(&mut planctx, &[span("a", "b")])
        .await
        .unwrap_err();
    assert_eq!(err, SfqError::Canceled);
}
