//! Property Tests for Marker Bookkeeping
//!
//! Random sequences of subscription commands and graph writes must keep the
//! marker reference counts equal to the number of sets holding each marker,
//! and must never leave a marker in a set after the engine dropped it.

use std::collections::BTreeSet;

use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use serde_json::json;

use canopy_core::graph::{Direction, Graph, MemoryGraph, NodeId};
use canopy_core::subscriptions::{
    MarkerFlags, MarkerId, MarkerSpec, RecordingSink, SubscriptionEngine, SubscriptionId,
};
use canopy_core::write::WriteTxn;

/// Node pool size, index 0 being the root.
const NODES: usize = 6;

const DIRS: [Direction; 8] = [
    Direction::Node,
    Direction::Children,
    Direction::Parents,
    Direction::BfsDescendants,
    Direction::BfsAncestors,
    Direction::DfsDescendants,
    Direction::DfsFull,
    Direction::None,
];

#[derive(Debug, Clone)]
enum Op {
    CreateNode(usize),
    DeleteNode(usize),
    AddChild(usize, usize),
    RemoveChild(usize, usize),
    SetField(usize),
    SetAlias(usize),
    AddMarker {
        sub: u64,
        marker: u64,
        dir: usize,
        root: usize,
        detach: bool,
    },
    AddMissing {
        sub: u64,
        marker: u64,
    },
    Refresh(u64),
    DeleteMarker {
        sub: u64,
        marker: u64,
    },
    DeleteSubscription(u64),
}

fn node(i: usize) -> NodeId {
    if i == 0 {
        NodeId::ROOT
    } else {
        NodeId::from(format!("n{i}").as_str())
    }
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1..NODES).prop_map(Op::CreateNode),
        (1..NODES).prop_map(Op::DeleteNode),
        (0..NODES, 1..NODES).prop_map(|(p, c)| Op::AddChild(p, c)),
        (0..NODES, 1..NODES).prop_map(|(p, c)| Op::RemoveChild(p, c)),
        (0..NODES).prop_map(Op::SetField),
        (1..NODES).prop_map(Op::SetAlias),
        (1..4u64, 1..8u64, 0..DIRS.len(), 0..NODES, any::<bool>()).prop_map(
            |(sub, marker, dir, root, detach)| Op::AddMarker {
                sub,
                marker,
                dir,
                root,
                detach,
            }
        ),
        (1..4u64, 8..10u64).prop_map(|(sub, marker)| Op::AddMissing { sub, marker }),
        (1..10u64).prop_map(Op::Refresh),
        (1..4u64, 1..10u64).prop_map(|(sub, marker)| Op::DeleteMarker { sub, marker }),
        (1..4u64).prop_map(Op::DeleteSubscription),
    ]
}

fn apply(graph: &mut MemoryGraph, engine: &mut SubscriptionEngine, op: Op) {
    match op {
        Op::CreateNode(i) => {
            WriteTxn::new(graph, engine).create_node(node(i));
        }
        Op::DeleteNode(i) => {
            let _ = WriteTxn::new(graph, engine).delete_node(&node(i));
        }
        Op::AddChild(p, c) => {
            let _ = WriteTxn::new(graph, engine).add_child(&node(p), &node(c));
        }
        Op::RemoveChild(p, c) => {
            let _ = WriteTxn::new(graph, engine).remove_child(&node(p), &node(c));
        }
        Op::SetField(i) => {
            let _ = WriteTxn::new(graph, engine).set_field(&node(i), "v", json!(i));
        }
        Op::SetAlias(i) => {
            let _ = WriteTxn::new(graph, engine).set_alias(&node(i), "home");
        }
        Op::AddMarker {
            sub,
            marker,
            dir,
            root,
            detach,
        } => {
            let mut spec = MarkerSpec::new(MarkerId(marker), DIRS[dir], [node(root)])
                .flags(MarkerFlags::CH_HIERARCHY);
            if detach {
                spec = spec.flags(MarkerFlags::DETACH);
            }
            let _ = engine.upsert_marker(SubscriptionId(sub), spec);
        }
        Op::AddMissing { sub, marker } => {
            let _ = engine.add_missing(SubscriptionId(sub), MarkerId(marker), ["home", "n3"]);
        }
        Op::Refresh(marker) => {
            let _ = engine.refresh_marker(graph, MarkerId(marker));
        }
        Op::DeleteMarker { sub, marker } => {
            let _ = engine.delete_marker(graph, SubscriptionId(sub), MarkerId(marker));
        }
        Op::DeleteSubscription(sub) => {
            let _ = engine.delete_subscription(graph, SubscriptionId(sub));
        }
    }
    engine.send_deferred_events();
}

fn check(graph: &MemoryGraph, engine: &SubscriptionEngine) -> Result<(), TestCaseError> {
    let linked: BTreeSet<MarkerId> = engine
        .list_subscriptions()
        .iter()
        .filter_map(|sub_id| engine.subscription(sub_id))
        .flat_map(|sub| sub.markers().collect::<Vec<_>>())
        .collect();
    prop_assert_eq!(linked.len(), engine.marker_count());

    let detached = engine.detached_markers();
    let mut held: Vec<MarkerId> = detached.clone();
    for i in 0..NODES {
        if let Some(set) = graph.markers(&node(i)) {
            held.extend(set.ids());
        }
    }
    for marker_id in &held {
        prop_assert!(linked.contains(marker_id), "{} held but dropped", marker_id);
    }

    for marker_id in &linked {
        let marker = engine.marker(marker_id);
        prop_assert!(marker.is_some());
        let Some(marker) = marker else { continue };
        prop_assert!(marker.subs().next().is_some(), "{} has no subscription", marker_id);
        let holders = held.iter().filter(|id| *id == marker_id).count();
        prop_assert_eq!(marker.ref_count(), holders, "ref count of {}", marker_id);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

    /// Test that reference counts always equal the number of holding sets.
    #[test]
    fn ref_counts_track_placements(ops in prop::collection::vec(op(), 1..48)) {
        let mut graph = MemoryGraph::new();
        let mut engine = SubscriptionEngine::with_sink(RecordingSink::new());
        for op in ops {
            apply(&mut graph, &mut engine, op);
            check(&graph, &engine)?;
        }
    }

    /// Test that dropping every subscription leaves no marker behind.
    #[test]
    fn no_markers_outlive_their_subscriptions(ops in prop::collection::vec(op(), 1..48)) {
        let mut graph = MemoryGraph::new();
        let mut engine = SubscriptionEngine::with_sink(RecordingSink::new());
        for op in ops {
            apply(&mut graph, &mut engine, op);
        }

        for sub_id in engine.list_subscriptions() {
            engine.delete_subscription(&mut graph, sub_id).unwrap();
        }
        prop_assert_eq!(engine.marker_count(), 0);
        prop_assert!(engine.detached_markers().is_empty());
        prop_assert!(engine.missing_accessors().is_empty());
        for i in 0..NODES {
            if let Some(set) = graph.markers(&node(i)) {
                prop_assert!(set.is_empty(), "{} still holds markers", node(i));
            }
        }
    }
}
