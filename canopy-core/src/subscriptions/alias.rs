//! Alias Markers
//!
//! An alias marker watches the node an alias currently points at. It fires
//! once when that node's alias list changes and then tears down the
//! subscriptions holding it; a client that wants to keep tracking the alias
//! subscribes again.

use super::change::filter_matches;
use super::engine::UpsertOutcome;
use super::marker::MarkerSpec;
use super::{MarkerFlags, MarkerId, SubscriptionEngine, SubscriptionId};
use crate::error::Result;
use crate::expression::AliasMatch;
use crate::graph::{Direction, Graph, NodeId};

impl SubscriptionEngine {
    /// Watch `alias`, which currently resolves to `node_id`.
    pub fn add_alias_marker(
        &mut self,
        sub_id: SubscriptionId,
        marker_id: MarkerId,
        alias: &str,
        node_id: NodeId,
    ) -> Result<UpsertOutcome> {
        let spec = MarkerSpec::new(marker_id, Direction::Node, [node_id])
            .flags(MarkerFlags::CH_ALIAS)
            .filter(AliasMatch::filter(alias));
        self.upsert_marker(sub_id, spec)
    }

    /// The alias list of `node_id` is about to change.
    ///
    /// Every alias marker on the node whose alias the node still carries
    /// fires and is flushed, then its subscriptions are deleted. A node with
    /// several aliases fires the markers of all of them.
    pub fn defer_alias_change_events(&mut self, graph: &mut dyn Graph, node_id: &NodeId) {
        let view: &dyn Graph = graph;
        let fired: Vec<MarkerId> = self
            .candidates(view, node_id, MarkerFlags::CH_ALIAS)
            .into_iter()
            .filter(|id| {
                self.markers
                    .get(id)
                    .map_or(false, |marker| filter_matches(view, marker, node_id))
            })
            .collect();

        for marker_id in &fired {
            self.fire(*marker_id, MarkerFlags::CH_ALIAS);
            self.send_deferred_event(*marker_id);
        }

        for marker_id in fired {
            let subs: Vec<SubscriptionId> = match self.markers.get(&marker_id) {
                Some(marker) => marker.subs().collect(),
                None => continue,
            };
            for sub_id in subs {
                if let Err(err) = self.delete_subscription(graph, sub_id) {
                    tracing::debug!(%sub_id, %err, "alias subscription already gone");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;
    use crate::subscriptions::RecordingSink;

    #[test]
    fn alias_marker_fires_once_and_tears_down() {
        let mut graph = MemoryGraph::new();
        let node = NodeId::from("n");
        graph.create_node(node);
        graph.set_alias(&node, "home").unwrap();

        let sink = RecordingSink::new();
        let mut engine = SubscriptionEngine::with_sink(sink.clone());
        engine
            .add_alias_marker(SubscriptionId(1), MarkerId(5), "home", node)
            .unwrap();
        engine.refresh_marker(&mut graph, MarkerId(5)).unwrap();

        engine.defer_alias_change_events(&mut graph, &node);
        let events = sink.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].flags, MarkerFlags::CH_ALIAS);
        assert_eq!(events[0].sub_ids, [SubscriptionId(1)]);

        assert!(engine.subscription(&SubscriptionId(1)).is_none());
        assert!(engine.marker(&MarkerId(5)).is_none());
        assert!(graph.markers(&node).unwrap().is_empty());
    }

    #[test]
    fn other_aliases_do_not_fire() {
        let mut graph = MemoryGraph::new();
        let node = NodeId::from("n");
        graph.create_node(node);
        graph.set_alias(&node, "work").unwrap();

        let sink = RecordingSink::new();
        let mut engine = SubscriptionEngine::with_sink(sink.clone());
        engine
            .add_alias_marker(SubscriptionId(1), MarkerId(5), "home", node)
            .unwrap();
        engine.refresh_marker(&mut graph, MarkerId(5)).unwrap();

        engine.defer_alias_change_events(&mut graph, &node);
        assert!(sink.is_empty());
        assert!(engine.marker(&MarkerId(5)).is_some());
    }
}
