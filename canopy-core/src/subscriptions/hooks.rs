//! Graph Hooks
//!
//! Called by the write path when the graph changes shape, so placed markers
//! follow new edges without re-traversing from their roots.
//!
//! # Inheritance
//!
//! Whole-subtree and whole-ancestry walks are transitive: a new child of a
//! node inside the walk is inside the walk too, and copying the marker onto
//! it is enough. That only holds while the new node brings no relatives of
//! its own. When it does, the correct placement is unknown without a walk,
//! and the marker fires `CH_HIERARCHY` so the subscriber refreshes it.
//!
//! `Children` and `Parents` markers only reach one step, so they are copied
//! only when the existing end of the edge is one of their roots.

use std::collections::BTreeSet;

use super::change::filter_matches;
use super::{Action, MarkerFlags, MarkerId, SubscriptionEngine, TriggerEvent};
use crate::graph::{Direction, Graph, NodeId, Relatives};

impl SubscriptionEngine {
    /// Markers placed on `node_id` or rooted at it.
    fn anchored(&self, graph: &dyn Graph, node_id: &NodeId) -> BTreeSet<MarkerId> {
        let mut ids: BTreeSet<MarkerId> = graph
            .markers(node_id)
            .map(|set| set.ids().collect())
            .unwrap_or_default();
        if let Some(rooted) = self.roots.get(node_id) {
            ids.extend(rooted.iter().copied());
        }
        ids.retain(|id| {
            self.markers
                .get(id)
                .map_or(false, |marker| !marker.is_detached_kind())
        });
        ids
    }

    /// Propagate markers of `parent` onto its new child `child`.
    pub fn inherit_parent(&mut self, graph: &mut dyn Graph, child: &NodeId, parent: &NodeId) {
        self.inherit_hierarchy(graph, child, parent, false);
    }

    /// Propagate markers of `child` onto its new parent `parent`.
    pub fn inherit_child(&mut self, graph: &mut dyn Graph, parent: &NodeId, child: &NodeId) {
        self.inherit_hierarchy(graph, parent, child, true);
    }

    fn inherit_hierarchy(
        &mut self,
        graph: &mut dyn Graph,
        new_node: &NodeId,
        neighbor: &NodeId,
        upward: bool,
    ) {
        let (onward, one_step) = if upward {
            (Relatives::Parents, Direction::Parents)
        } else {
            (Relatives::Children, Direction::Children)
        };
        let has_relatives = graph.relative_count(new_node, onward) > 0;

        for marker_id in self.anchored(graph, neighbor) {
            let Some(marker) = self.markers.get(&marker_id) else {
                continue;
            };
            let transitive = if upward {
                marker.dir.covers_ancestors()
            } else {
                marker.dir.covers_descendants()
            };

            if transitive {
                if has_relatives {
                    self.fire(marker_id, MarkerFlags::CH_HIERARCHY);
                } else {
                    self.apply_action(
                        graph,
                        marker_id,
                        Action::SetOnNode,
                        new_node,
                        MarkerFlags::NONE,
                    );
                }
            } else if marker.dir == one_step && marker.is_root(neighbor) {
                self.apply_action(graph, marker_id, Action::SetOnNode, new_node, MarkerFlags::NONE);
            }
        }
    }

    /// Propagate field-anchored markers of `src` across a new `field` edge to `dst`.
    ///
    /// Single-step markers follow the edge only from one of their roots and
    /// evaluate their filter against `dst` right away.
    /// Transitive and expression markers fire `CH_HIERARCHY` instead of
    /// walking on from `dst`.
    pub fn inherit_edge(&mut self, graph: &mut dyn Graph, src: &NodeId, dst: &NodeId, field: &str) {
        for marker_id in self.anchored(graph, src) {
            let Some(marker) = self.markers.get(&marker_id) else {
                continue;
            };

            if marker.dir.needs_expression() {
                self.fire(marker_id, MarkerFlags::CH_HIERARCHY);
                continue;
            }
            if !marker.dir.needs_ref_field() || marker.ref_field() != Some(field) {
                continue;
            }
            // Single-hop walks only reach one step past their roots.
            let bfs = marker.dir.is_bfs();
            if !bfs && !marker.is_root(src) {
                continue;
            }

            self.apply_action(graph, marker_id, Action::SetOnNode, dst, MarkerFlags::NONE);
            if bfs {
                self.fire(marker_id, MarkerFlags::CH_HIERARCHY);
            } else {
                let matches = match self.markers.get(&marker_id) {
                    Some(marker) => filter_matches(graph, marker, dst),
                    None => false,
                };
                if matches {
                    self.fire(marker_id, MarkerFlags::CH_HIERARCHY);
                }
            }
        }
    }

    /// Fire every traversing marker on `node_id` so subscribers refresh.
    ///
    /// Used when a marker's placement can no longer be derived cheaply, for
    /// example after an edge was removed.
    pub fn defer_event_for_traversing_markers(&mut self, graph: &dyn Graph, node_id: &NodeId) {
        for marker_id in self.anchored(graph, node_id) {
            let traversing = self
                .markers
                .get(&marker_id)
                .map_or(false, |marker| marker.dir.is_traversing());
            if traversing {
                self.fire(marker_id, MarkerFlags::CH_HIERARCHY);
            }
        }
    }

    /// A node was created: wake markers waiting for its id and fire
    /// `Created` triggers.
    pub fn on_node_created(&mut self, graph: &mut dyn Graph, node_id: &NodeId) {
        self.defer_missing_accessor_events(graph, &node_id.to_string());
        self.defer_trigger_events(graph, node_id, TriggerEvent::Created);
    }

    /// A node is about to be deleted.
    ///
    /// Must run while the node still exists: deletion events and `Deleted`
    /// triggers evaluate against it, then its marker set is emptied.
    pub fn on_node_deleted(&mut self, graph: &mut dyn Graph, node_id: &NodeId) {
        self.defer_hierarchy_deletion_events(graph, node_id);
        self.defer_trigger_events(graph, node_id, TriggerEvent::Deleted);

        let held = graph
            .markers_mut(node_id)
            .map(|set| set.take())
            .unwrap_or_default();
        for marker_id in held {
            let orphaned = match self.markers.get_mut(&marker_id) {
                Some(marker) => {
                    marker.placements.swap_remove(node_id);
                    marker.ref_count() == 0 && marker.subs.is_empty()
                }
                None => false,
            };
            if orphaned {
                self.destroy_marker(marker_id);
            }
        }
        tracing::trace!(%node_id, "node markers released");
    }
}
