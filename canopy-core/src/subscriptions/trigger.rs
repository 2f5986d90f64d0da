//! Trigger Markers
//!
//! Trigger markers react to node lifecycle events anywhere in the graph.
//! They live in the detached set and are filtered against the node the event
//! concerns.

use super::change::filter_matches;
use super::engine::UpsertOutcome;
use super::marker::MarkerSpec;
use super::{MarkerFlags, MarkerId, SubscriptionEngine, SubscriptionId, TriggerEvent};
use crate::error::Result;
use crate::expression::Filter;
use crate::graph::{Graph, NodeId};

impl SubscriptionEngine {
    /// Fire on `event` for every node matching `filter`.
    pub fn add_trigger_marker(
        &mut self,
        sub_id: SubscriptionId,
        marker_id: MarkerId,
        event: TriggerEvent,
        filter: Option<Filter>,
    ) -> Result<UpsertOutcome> {
        let mut spec = MarkerSpec::trigger(marker_id, event);
        if let Some(filter) = filter {
            spec = spec.filter(filter);
        }
        self.upsert_marker(sub_id, spec)
    }

    /// Report a lifecycle event for `node_id`.
    ///
    /// For `Deleted` this must be called while the node still exists.
    pub fn defer_trigger_events(&mut self, graph: &dyn Graph, node_id: &NodeId, event: TriggerEvent) {
        for marker_id in self.detached.ids_with(MarkerFlags::TRIGGER) {
            let fires = self.markers.get(&marker_id).map_or(false, |marker| {
                marker.trigger_event() == Some(event) && filter_matches(graph, marker, node_id)
            });
            if fires {
                tracing::trace!(%marker_id, %node_id, ?event, "trigger fired");
                self.fire(marker_id, MarkerFlags::TRIGGER);
            }
        }
    }
}
