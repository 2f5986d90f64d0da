//! Change Detection
//!
//! Field changes are evaluated in two phases around the mutation:
//!
//! ```text
//! let precheck = engine.field_change_precheck(graph, &node);
//! graph.set_field(&node, "age", 20.into())?;
//! engine.defer_field_change_events(graph, precheck, &["age"]);
//! ```
//!
//! The precheck records each filtered marker's verdict on the old state. The
//! commit evaluates the new state and fires a marker when the verdict
//! changed, or when it held on both sides and the changed field is one the
//! marker watches. Committing consumes the [`Precheck`], so a precheck cannot
//! be committed twice.

use super::marker::Marker;
use super::{MarkerFlags, MarkerId, SubscriptionEngine};
use crate::graph::{Graph, NodeId};

/// Markers that take part in field-change detection.
const FIELD_WATCH: MarkerFlags = MarkerFlags::from_bits(
    MarkerFlags::CH_FIELD.bits() | MarkerFlags::CH_HIERARCHY.bits(),
);

/// Pending field-change evaluation for one node.
///
/// Returned by [`SubscriptionEngine::field_change_precheck`] and consumed by
/// [`SubscriptionEngine::defer_field_change_events`]. If the mutation fails,
/// commit with an empty field list.
#[must_use = "a precheck must be committed with defer_field_change_events"]
#[derive(Debug)]
pub struct Precheck {
    node_id: NodeId,
    candidates: Vec<MarkerId>,
}

impl Precheck {
    /// The node being changed.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// True if no marker can react to a field change of this node.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Evaluate a marker's filter against a node. No filter matches everything.
pub(crate) fn filter_matches(graph: &dyn Graph, marker: &Marker, node_id: &NodeId) -> bool {
    let Some(filter) = &marker.filter else {
        return true;
    };
    let Some(node) = graph.node(node_id) else {
        return false;
    };
    match filter.matches(node) {
        Ok(result) => result,
        Err(err) => {
            tracing::warn!(marker_id = %marker.id, %node_id, %err, "filter evaluation failed");
            false
        }
    }
}

impl SubscriptionEngine {
    /// Markers relevant to `node_id` with any of `flags`: detached first, then
    /// the node's own set.
    pub(crate) fn candidates(
        &self,
        graph: &dyn Graph,
        node_id: &NodeId,
        flags: MarkerFlags,
    ) -> Vec<MarkerId> {
        let mut ids = self.detached.ids_with(flags);
        if let Some(set) = graph.markers(node_id) {
            for id in set.ids_with(flags) {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    /// Record filter verdicts for `node_id` before it is mutated.
    pub fn field_change_precheck(&mut self, graph: &dyn Graph, node_id: &NodeId) -> Precheck {
        let candidates = self.candidates(graph, node_id, FIELD_WATCH);
        for id in &candidates {
            let Some(marker) = self.markers.get(id) else {
                continue;
            };
            if !marker.flags.contains(MarkerFlags::CH_FIELD) || marker.filter.is_none() {
                continue;
            }
            let result = filter_matches(graph, marker, node_id);
            if let Some(marker) = self.markers.get_mut(id) {
                marker.history.result = result;
                marker.history.node_id = Some(*node_id);
            }
        }
        Precheck {
            node_id: *node_id,
            candidates,
        }
    }

    /// Evaluate the mutation recorded by `precheck` and defer events.
    ///
    /// `fields` are the fields that changed. An empty list commits a
    /// mutation with no visible field change.
    pub fn defer_field_change_events(
        &mut self,
        graph: &dyn Graph,
        precheck: Precheck,
        fields: &[&str],
    ) {
        let Precheck {
            node_id,
            candidates,
        } = precheck;

        for id in candidates {
            let Some(marker) = self.markers.get(&id) else {
                continue;
            };
            let flags = commit_verdict(graph, marker, &node_id, fields);
            if let Some(marker) = self.markers.get_mut(&id) {
                marker.history.node_id = None;
                marker.history.result = false;
            }
            if !flags.is_empty() {
                self.fire(id, flags);
            }
        }
    }

    /// Fire hierarchy markers after an edge of `node_id` changed.
    pub fn defer_hierarchy_events(&mut self, graph: &dyn Graph, node_id: &NodeId) {
        for id in self.candidates(graph, node_id, MarkerFlags::CH_HIERARCHY) {
            let matches = self
                .markers
                .get(&id)
                .map_or(false, |marker| filter_matches(graph, marker, node_id));
            if matches {
                self.fire(id, MarkerFlags::CH_HIERARCHY);
            }
        }
    }

    /// Fire hierarchy markers for a node that is about to be deleted.
    ///
    /// Filters are not consulted: the subscriber must learn that the node is
    /// leaving whatever it matched.
    pub fn defer_hierarchy_deletion_events(&mut self, graph: &dyn Graph, node_id: &NodeId) {
        for id in self.candidates(graph, node_id, MarkerFlags::CH_HIERARCHY) {
            self.fire(id, MarkerFlags::CH_HIERARCHY);
        }
    }
}

/// Decide which flags a marker fires with for a committed change.
fn commit_verdict(
    graph: &dyn Graph,
    marker: &Marker,
    node_id: &NodeId,
    fields: &[&str],
) -> MarkerFlags {
    let traversed = fields.iter().any(|f| marker.is_field_traversed(f));
    if marker.flags.contains(MarkerFlags::REF) && marker.is_root(node_id) && !traversed {
        return MarkerFlags::NONE;
    }

    let mut flags = MarkerFlags::NONE;
    if traversed {
        flags |= MarkerFlags::CH_HIERARCHY;
    }
    if !marker.flags.contains(MarkerFlags::CH_FIELD) {
        return flags;
    }

    let fields_match = fields.iter().any(|f| marker.fields_match(f));
    let fire = if marker.filter.is_some() {
        let before = marker.history.node_id.as_ref() == Some(node_id) && marker.history.result;
        let after = filter_matches(graph, marker, node_id);
        (before && after && fields_match) || before != after
    } else {
        fields_match
    };
    if fire {
        flags |= MarkerFlags::CH_FIELD;
    }
    flags
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::error::Error;
    use crate::expression::Filter;
    use crate::graph::{Direction, MemoryGraph};
    use crate::subscriptions::{FieldList, MarkerSpec, RecordingSink, SubscriptionId};

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    fn adult() -> Filter {
        Filter::from_fn(|ctx| {
            Ok(ctx
                .node
                .field("age")
                .and_then(Value::as_i64)
                .map_or(false, |age| age > 18))
        })
    }

    struct Fixture {
        graph: MemoryGraph,
        engine: SubscriptionEngine,
        sink: RecordingSink,
    }

    impl Fixture {
        fn new(spec: MarkerSpec) -> Self {
            let mut graph = MemoryGraph::new();
            graph.create_node(id("n"));
            graph.set_field(&id("n"), "age", json!(15)).unwrap();
            let sink = RecordingSink::new();
            let mut engine = SubscriptionEngine::with_sink(sink.clone());
            let marker_id = spec.id;
            engine.upsert_marker(SubscriptionId(1), spec).unwrap();
            engine.refresh_marker(&mut graph, marker_id).unwrap();
            Self {
                graph,
                engine,
                sink,
            }
        }

        /// Set a field through precheck/commit and return the flushed events.
        fn set(&mut self, field: &str, value: Value) -> Vec<MarkerFlags> {
            let node = id("n");
            let precheck = self.engine.field_change_precheck(&self.graph, &node);
            self.graph.set_field(&node, field, value).unwrap();
            self.engine
                .defer_field_change_events(&self.graph, precheck, &[field]);
            self.engine.send_deferred_events();
            self.sink.take().into_iter().map(|e| e.flags).collect()
        }
    }

    fn filtered() -> MarkerSpec {
        MarkerSpec::new(MarkerId(200), Direction::Node, [id("n")])
            .filter(adult())
            .fields(FieldList::new(["age"]))
    }

    #[test]
    fn false_to_false_does_not_fire() {
        let mut fx = Fixture::new(filtered());
        assert!(fx.set("age", json!(16)).is_empty());
    }

    #[test]
    fn false_to_true_fires() {
        let mut fx = Fixture::new(filtered());
        assert_eq!(fx.set("age", json!(20)), [MarkerFlags::CH_FIELD]);
    }

    #[test]
    fn true_to_false_fires() {
        let mut fx = Fixture::new(filtered());
        fx.set("age", json!(20));
        assert_eq!(fx.set("age", json!(12)), [MarkerFlags::CH_FIELD]);
    }

    #[test]
    fn stable_true_fires_only_for_watched_fields() {
        let mut fx = Fixture::new(filtered());
        fx.set("age", json!(20));
        assert_eq!(fx.set("age", json!(25)), [MarkerFlags::CH_FIELD]);
        assert!(fx.set("name", json!("bob")).is_empty());
    }

    #[test]
    fn unfiltered_markers_follow_field_list() {
        let spec = MarkerSpec::new(MarkerId(1), Direction::Node, [id("n")])
            .fields(FieldList::new(["title"]));
        let mut fx = Fixture::new(spec);
        assert!(fx.set("age", json!(30)).is_empty());
        assert_eq!(fx.set("title", json!("x")), [MarkerFlags::CH_FIELD]);
    }

    #[test]
    fn failed_mutation_commits_without_fields() {
        let mut fx = Fixture::new(filtered());
        let node = id("n");
        let precheck = fx.engine.field_change_precheck(&fx.graph, &node);
        let err = fx.graph.set_field(&node, "age.x", json!(1)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        fx.engine.defer_field_change_events(&fx.graph, precheck, &[]);
        assert_eq!(fx.engine.send_deferred_events(), 0);
        assert!(fx.engine.marker(&MarkerId(200)).unwrap().history().node_id.is_none());
    }

    #[test]
    fn ref_markers_ignore_their_roots() {
        let spec = MarkerSpec::new(MarkerId(1), Direction::Children, [id("n")])
            .flags(MarkerFlags::CH_FIELD);
        let mut fx = Fixture::new(spec);
        assert!(fx.set("age", json!(40)).is_empty());
    }

    #[test]
    fn traversed_field_is_a_hierarchy_change() {
        let spec = MarkerSpec::new(MarkerId(1), Direction::Field, [id("n")])
            .ref_field("owner")
            .flags(MarkerFlags::CH_HIERARCHY);
        let mut fx = Fixture::new(spec);
        assert_eq!(fx.set("owner", json!("x")), [MarkerFlags::CH_HIERARCHY]);
        assert!(fx.set("age", json!(1)).is_empty());
    }

    #[test]
    fn unwatched_nodes_skip_evaluation() {
        let mut fx = Fixture::new(filtered());
        fx.graph.create_node(id("other"));
        let precheck = fx.engine.field_change_precheck(&fx.graph, &id("other"));
        assert!(precheck.is_empty());
        fx.engine.defer_field_change_events(&fx.graph, precheck, &["age"]);
    }

    #[test]
    fn hierarchy_events_respect_filters() {
        let spec = MarkerSpec::new(MarkerId(1), Direction::Node, [id("n")])
            .flags(MarkerFlags::CH_HIERARCHY)
            .filter(adult());
        let mut fx = Fixture::new(spec);

        fx.engine.defer_hierarchy_events(&fx.graph, &id("n"));
        assert_eq!(fx.engine.send_deferred_events(), 0);

        fx.engine.defer_hierarchy_deletion_events(&fx.graph, &id("n"));
        assert_eq!(fx.engine.send_deferred_events(), 1);
        assert_eq!(fx.sink.take()[0].flags, MarkerFlags::CH_HIERARCHY);
    }
}
