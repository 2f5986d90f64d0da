//! Marker Placement
//!
//! Projects a marker's watch region (root ids plus direction) onto the
//! per-node marker sets, and retracts it again.
//!
//! # Design Decisions
//!
//! 1. Walks collect visited ids first and apply [`Action::SetOnNode`] or
//!    [`Action::ClearFromNode`] afterwards, so the graph is never borrowed
//!    mutably during a traversal.
//!
//! 2. Every marker remembers the nodes holding it. Clearing walks the
//!    traversal again and then sweeps whatever the walk could no longer
//!    reach, which keeps `ref_count` exact after the graph has changed shape.
//!
//! 3. A root that does not exist is not an error: the marker is valid and
//!    simply inert until refreshed.

use super::{Action, MarkerFlags, MarkerId, SubscriptionEngine, SubscriptionId};
use crate::error::{Error, Result};
use crate::graph::{Direction, Graph, NodeId};

impl SubscriptionEngine {
    /// Apply one action for a marker.
    ///
    /// Firing actions ignore `node_id`; placement actions ignore `flags`.
    pub(crate) fn apply_action(
        &mut self,
        graph: &mut dyn Graph,
        marker_id: MarkerId,
        action: Action,
        node_id: &NodeId,
        flags: MarkerFlags,
    ) {
        match action {
            Action::Defer | Action::FireImmediate => self.fire_with(marker_id, action, flags),
            Action::SetOnNode => self.set_on_node(graph, marker_id, node_id),
            Action::ClearFromNode => self.clear_from_node(graph, marker_id, node_id),
        }
    }

    /// Fire a marker through its own action.
    pub(crate) fn fire(&mut self, marker_id: MarkerId, flags: MarkerFlags) {
        if let Some(action) = self.markers.get(&marker_id).map(|m| m.action) {
            self.fire_with(marker_id, action, flags);
        }
    }

    fn fire_with(&mut self, marker_id: MarkerId, action: Action, flags: MarkerFlags) {
        match action {
            Action::Defer => self.defer_event(marker_id, flags),
            Action::FireImmediate => {
                self.defer_event(marker_id, flags);
                self.send_deferred_event(marker_id);
            }
            Action::SetOnNode | Action::ClearFromNode => {
                tracing::warn!(%marker_id, ?action, "marker carries a placement action");
            }
        }
    }

    fn set_on_node(&mut self, graph: &mut dyn Graph, marker_id: MarkerId, node_id: &NodeId) {
        let Some(marker) = self.markers.get_mut(&marker_id) else {
            return;
        };
        let Some(set) = graph.markers_mut(node_id) else {
            return;
        };
        if set.insert(marker_id, marker.flags) {
            marker.placements.insert(*node_id);
            tracing::trace!(%marker_id, %node_id, "marker set");
        }
    }

    fn clear_from_node(&mut self, graph: &mut dyn Graph, marker_id: MarkerId, node_id: &NodeId) {
        if let Some(set) = graph.markers_mut(node_id) {
            set.remove(&marker_id);
        }
        if let Some(marker) = self.markers.get_mut(&marker_id) {
            if marker.placements.swap_remove(node_id) {
                tracing::trace!(%marker_id, %node_id, "marker cleared");
            }
        }
    }

    /// Collect the nodes a marker's traversal reaches from `root`.
    fn walk(&self, graph: &dyn Graph, marker_id: MarkerId, root: &NodeId) -> Result<Vec<NodeId>> {
        let marker = self
            .markers
            .get(&marker_id)
            .ok_or(Error::MarkerNotFound(marker_id))?;
        let mut visited = Vec::new();
        graph.traverse(root, &marker.traversal(), &mut |id| visited.push(*id))?;
        Ok(visited)
    }

    /// Place a marker on the graph, replacing any earlier placement.
    ///
    /// Detached markers go to the detached set. Roots that do not exist are
    /// skipped; any other traversal error is returned after the remaining
    /// roots were processed.
    pub fn refresh_marker(&mut self, graph: &mut dyn Graph, marker_id: MarkerId) -> Result<()> {
        let marker = self
            .markers
            .get(&marker_id)
            .ok_or(Error::MarkerNotFound(marker_id))?;
        if marker.ref_count() > 0 {
            self.clear_marker(graph, marker_id);
        }

        let Some(marker) = self.markers.get_mut(&marker_id) else {
            return Err(Error::MarkerNotFound(marker_id));
        };

        if marker.is_detached_kind() {
            if self.detached.insert(marker_id, marker.flags) {
                marker.detached = true;
            }
            if marker.flags.contains(MarkerFlags::REFRESH) {
                self.fire(marker_id, MarkerFlags::REFRESH);
            }
            tracing::debug!(%marker_id, "marker detached");
            return Ok(());
        }

        if marker.dir.needs_ref_field() && marker.ref_field.is_none() {
            return Err(Error::invalid(format!(
                "{} traversal needs a ref field",
                marker.dir.name()
            )));
        }
        if marker.dir.needs_expression() && marker.traversal_expression.is_none() {
            return Err(Error::invalid(format!(
                "{} traversal needs an expression",
                marker.dir.name()
            )));
        }
        if matches!(
            marker.dir,
            Direction::Children
                | Direction::Parents
                | Direction::Ref
                | Direction::EdgeField
                | Direction::Field
        ) {
            marker.flags.insert(MarkerFlags::REF);
        }

        let roots = marker.node_ids().to_vec();
        let mut last_err = None;
        for root in &roots {
            match self.walk(graph, marker_id, root) {
                Ok(visited) => {
                    for node_id in &visited {
                        self.apply_action(
                            graph,
                            marker_id,
                            Action::SetOnNode,
                            node_id,
                            MarkerFlags::NONE,
                        );
                    }
                }
                Err(err) if err.is_not_found() => {
                    tracing::trace!(%marker_id, node_id = %root, "root not found, marker inert");
                }
                Err(err) => {
                    tracing::warn!(%marker_id, node_id = %root, %err, "marker traversal failed");
                    last_err = Some(err);
                }
            }
        }

        if self.config.log_events {
            if let Some(marker) = self.markers.get(&marker_id) {
                tracing::debug!(%marker_id, ref_count = marker.ref_count(), "marker refreshed");
            }
        }
        last_err.map_or(Ok(()), Err)
    }

    /// Refresh every marker of a subscription.
    ///
    /// Best effort: failures are logged and the last one is returned once all
    /// markers were processed.
    pub fn refresh_subscription(
        &mut self,
        graph: &mut dyn Graph,
        sub_id: SubscriptionId,
    ) -> Result<()> {
        let marker_ids: Vec<MarkerId> = self
            .subscriptions
            .get(&sub_id)
            .ok_or(Error::SubscriptionNotFound(sub_id))?
            .markers()
            .collect();

        let mut last_err = None;
        for marker_id in marker_ids {
            if let Err(err) = self.refresh_marker(graph, marker_id) {
                tracing::warn!(%sub_id, %marker_id, %err, "refresh failed");
                last_err = Some(err);
            }
        }
        last_err.map_or(Ok(()), Err)
    }

    /// Remove a marker from every node its traversal reaches from `node_id`.
    pub fn clear_node_sub(
        &mut self,
        graph: &mut dyn Graph,
        marker_id: MarkerId,
        node_id: &NodeId,
    ) -> Result<()> {
        let visited = match self.walk(graph, marker_id, node_id) {
            Ok(visited) => visited,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        for id in &visited {
            self.apply_action(graph, marker_id, Action::ClearFromNode, id, MarkerFlags::NONE);
        }
        Ok(())
    }

    /// Remove a marker from the detached set and from every node set.
    ///
    /// Aborts the process if a node still exists but its marker set cannot be
    /// reached, since the marker would otherwise outlive its placement.
    pub(crate) fn clear_marker(&mut self, graph: &mut dyn Graph, marker_id: MarkerId) {
        let Some(marker) = self.markers.get_mut(&marker_id) else {
            return;
        };
        if marker.detached {
            self.detached.remove(&marker_id);
            marker.detached = false;
        }

        if !marker.is_detached_kind() {
            let roots = marker.node_ids().to_vec();
            for root in &roots {
                if let Err(err) = self.clear_node_sub(graph, marker_id, root) {
                    tracing::warn!(%marker_id, node_id = %root, %err, "clear traversal failed, sweeping");
                }
            }
        }

        let Some(marker) = self.markers.get_mut(&marker_id) else {
            return;
        };
        let leftovers: Vec<NodeId> = marker.placements.drain(..).collect();
        for node_id in &leftovers {
            if !graph.contains(node_id) {
                continue;
            }
            match graph.markers_mut(node_id) {
                Some(set) => {
                    set.remove(&marker_id);
                }
                None => {
                    tracing::error!(%marker_id, %node_id, "marker set unreachable during clear");
                    std::process::abort();
                }
            }
        }
    }
}
