//! Published Events
//!
//! A flushed marker becomes a [`MarkerEvent`]. The engine encodes it into the
//! binary wire payload and hands both to an [`EventSink`], which owns the
//! actual delivery to remote clients.
//!
//! # Wire Format
//!
//! ```text
//! marker_id: u64 LE | flags: u32 LE | sub_id: u64 LE ...
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{MarkerFlags, MarkerId, SubscriptionId};
use crate::error::{Error, Result};

const HEADER_LEN: usize = 12;

/// One published notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerEvent {
    /// The marker that fired.
    pub marker_id: MarkerId,
    /// Every flag merged while the event was pending.
    pub flags: MarkerFlags,
    /// Subscriptions referencing the marker at flush time.
    pub sub_ids: Vec<SubscriptionId>,
}

impl MarkerEvent {
    /// Encode to the wire payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 8 * self.sub_ids.len());
        buf.extend_from_slice(&self.marker_id.0.to_le_bytes());
        buf.extend_from_slice(&self.flags.bits().to_le_bytes());
        for sub_id in &self.sub_ids {
            buf.extend_from_slice(&sub_id.0.to_le_bytes());
        }
        buf
    }

    /// Decode a wire payload.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN || (buf.len() - HEADER_LEN) % 8 != 0 {
            return Err(Error::invalid(format!(
                "event payload of {} bytes is malformed",
                buf.len()
            )));
        }
        let (header, subs) = buf.split_at(HEADER_LEN);
        let mut marker_id = [0u8; 8];
        marker_id.copy_from_slice(&header[..8]);
        let mut flags = [0u8; 4];
        flags.copy_from_slice(&header[8..]);

        let sub_ids = subs
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                SubscriptionId(u64::from_le_bytes(raw))
            })
            .collect();

        Ok(Self {
            marker_id: MarkerId(u64::from_le_bytes(marker_id)),
            flags: MarkerFlags::from_bits(u32::from_le_bytes(flags)),
            sub_ids,
        })
    }
}

/// The pub/sub transport contract.
pub trait EventSink: Send {
    /// Deliver one event. `payload` is `event` in wire encoding.
    fn publish(&mut self, event: &MarkerEvent, payload: Vec<u8>);
}

/// Sink that keeps every event in memory.
///
/// Clones share the same buffer, so a test can keep one handle while the
/// engine owns another.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<MarkerEvent>>>,
}

impl RecordingSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events.
    pub fn events(&self) -> Vec<MarkerEvent> {
        self.events.lock().clone()
    }

    /// Remove and return the recorded events.
    pub fn take(&self) -> Vec<MarkerEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for RecordingSink {
    fn publish(&mut self, event: &MarkerEvent, _payload: Vec<u8>) {
        self.events.lock().push(event.clone());
    }
}

/// Sink that fans encoded payloads out over a broadcast channel.
///
/// Each connected client task holds a receiver; lagging receivers lose the
/// oldest payloads, as with any tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<Arc<[u8]>>,
}

impl BroadcastSink {
    /// Create a sink with the given channel capacity.
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<Arc<[u8]>>) {
        let (sender, receiver) = broadcast::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Attach another receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<[u8]>> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&mut self, event: &MarkerEvent, payload: Vec<u8>) {
        if self.sender.send(Arc::from(payload)).is_err() {
            tracing::trace!(marker_id = %event.marker_id, "no receivers for event");
        }
    }
}
