//! Missing-Accessor Markers
//!
//! A client can ask to be told when a node id or alias that does not exist
//! yet appears. Such markers are never placed; they sit in an index keyed by
//! the accessor string until the write path reports the accessor, fire once
//! and are removed from their subscriptions.

use super::engine::UpsertOutcome;
use super::marker::MarkerSpec;
use super::{MarkerFlags, MarkerId, SubscriptionEngine, SubscriptionId};
use crate::error::{Error, Result};
use crate::graph::{Direction, Graph};

impl SubscriptionEngine {
    /// Wait for any of `accessors` to appear.
    pub fn add_missing<I, S>(
        &mut self,
        sub_id: SubscriptionId,
        marker_id: MarkerId,
        accessors: I,
    ) -> Result<UpsertOutcome>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let accessors: Vec<String> = accessors
            .into_iter()
            .map(Into::into)
            .filter(|a: &String| !a.is_empty())
            .collect();
        if accessors.is_empty() {
            return Err(Error::invalid("missing-accessor marker without accessors"));
        }
        if let Some(existing) = self.markers.get(&marker_id) {
            if !existing.flags.contains(MarkerFlags::MISSING) {
                return Err(Error::invalid(format!(
                    "marker {marker_id} is not a missing-accessor marker"
                )));
            }
        }

        let spec = MarkerSpec::new(marker_id, Direction::None, []).flags(MarkerFlags::MISSING);
        let outcome = self.upsert_marker(sub_id, spec)?;
        for accessor in accessors {
            tracing::trace!(%marker_id, %accessor, "waiting for accessor");
            self.missing.entry(accessor).or_default().insert(marker_id);
        }
        Ok(outcome)
    }

    /// `accessor` now resolves to a node.
    ///
    /// Fires and flushes every marker waiting for it, then removes those
    /// markers from all their subscriptions. Returns the number of markers
    /// fired.
    pub fn defer_missing_accessor_events(&mut self, graph: &mut dyn Graph, accessor: &str) -> usize {
        let Some(waiting) = self.missing.shift_remove(accessor) else {
            return 0;
        };

        let mut fired = 0;
        for marker_id in waiting {
            let Some(marker) = self.markers.get(&marker_id) else {
                continue;
            };
            let subs: Vec<SubscriptionId> = marker.subs().collect();

            self.fire(marker_id, MarkerFlags::MISSING);
            self.send_deferred_event(marker_id);
            fired += 1;

            for sub_id in subs {
                if let Err(err) = self.delete_marker(graph, sub_id, marker_id) {
                    tracing::debug!(%sub_id, %marker_id, %err, "missing marker already unlinked");
                }
            }
        }
        tracing::debug!(%accessor, fired, "accessor appeared");
        fired
    }
}
