//! Deferred Event Queue
//!
//! Markers that fire during a write are queued here and flushed as one batch
//! when the command ends. A marker is queued at most once per batch; a second
//! firing only merges its flags into the pending history.

use indexmap::IndexSet;

use super::event::MarkerEvent;
use super::{MarkerFlags, MarkerId, SubscriptionEngine};

/// Ordered, deduplicated queue of fired markers.
#[derive(Debug, Default)]
pub struct DeferredEvents {
    queue: IndexSet<MarkerId>,
}

impl DeferredEvents {
    /// Queued marker ids in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = MarkerId> + '_ {
        self.queue.iter().copied()
    }

    /// Is the marker queued?
    pub fn contains(&self, id: &MarkerId) -> bool {
        self.queue.contains(id)
    }

    /// Number of queued markers.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl SubscriptionEngine {
    /// Record that a marker fired with `flags`.
    pub fn defer_event(&mut self, marker_id: MarkerId, flags: MarkerFlags) {
        let Some(marker) = self.markers.get_mut(&marker_id) else {
            tracing::warn!(%marker_id, "deferring an event for an unknown marker");
            return;
        };
        marker.history.flags |= flags;
        if self.deferred.queue.insert(marker_id) {
            tracing::trace!(%marker_id, ?flags, "event deferred");
        }
    }

    /// Publish one marker's event right away.
    ///
    /// Subscription ids are read now, not when the event was deferred.
    pub(crate) fn send_event(&mut self, marker_id: MarkerId) -> bool {
        let Some(marker) = self.markers.get_mut(&marker_id) else {
            return false;
        };
        let event = MarkerEvent {
            marker_id,
            flags: marker.history.flags,
            sub_ids: marker.subs.iter().copied().collect(),
        };
        marker.history.flags = MarkerFlags::NONE;

        if self.config.log_events {
            tracing::debug!(
                %marker_id,
                flags = ?event.flags,
                subs = event.sub_ids.len(),
                "publishing event"
            );
        }
        let payload = event.encode();
        self.sink.publish(&event, payload);
        true
    }

    /// Flush one marker's pending event, if it has one.
    pub fn send_deferred_event(&mut self, marker_id: MarkerId) -> bool {
        if !self.deferred.queue.shift_remove(&marker_id) {
            return false;
        }
        self.send_event(marker_id)
    }

    /// Flush every pending event in the order the markers first fired.
    ///
    /// Called once at the end of every top-level write command.
    pub fn send_deferred_events(&mut self) -> usize {
        let queue = std::mem::take(&mut self.deferred.queue);
        let mut sent = 0;
        for marker_id in queue {
            if self.send_event(marker_id) {
                sent += 1;
            }
        }
        if sent > 0 {
            tracing::debug!(sent, "deferred events flushed");
        }
        sent
    }

    /// The queue of markers waiting to be flushed.
    pub fn pending_events(&self) -> &DeferredEvents {
        &self.deferred
    }
}
