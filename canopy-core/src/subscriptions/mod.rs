//! Subscriptions
//!
//! This module implements the change-notification engine: clients register
//! subscriptions, each holding one or more markers, and receive batched
//! events when the watched part of the graph changes.
//!
//! # Concepts
//!
//! ## Markers
//!
//! A [`Marker`] describes one watch: root node ids and a traversal
//! direction, an optional filter, an optional field match list, and flags
//! saying which kinds of change it cares about. Markers are shared between
//! subscriptions and deduplicated by [`MarkerId`].
//!
//! ## Placement
//!
//! Refreshing a marker walks the graph from its roots and records the marker
//! in the local [`MarkerSet`] of every visited node. Markers that do not
//! traverse (direction `None`, `DETACH`, triggers) go to the engine's
//! detached set instead and are consulted for every node.
//!
//! ## Change detection
//!
//! The write path calls [`SubscriptionEngine::field_change_precheck`] before
//! touching a node and [`SubscriptionEngine::defer_field_change_events`]
//! after. The pair decides per filtered marker whether the change is visible
//! to the subscriber.
//!
//! ## Delivery
//!
//! Fired markers are queued once per write and flushed by
//! [`SubscriptionEngine::send_deferred_events`] at the end of the command.
//! Each flushed marker becomes one [`MarkerEvent`] handed to the
//! [`EventSink`].
//!
//! # Implementation Notes
//!
//! The engine owns every marker in an arena keyed by marker id. Node-local
//! sets, the detached set, subscriptions and the deferred queue hold ids, so
//! there are no back-pointers to keep valid; a marker is dropped once no
//! subscription references it and no set holds it.

mod alias;
mod change;
mod deferred;
mod engine;
mod event;
mod hooks;
mod marker;
mod marker_set;
mod missing;
mod traversal;
mod trigger;

pub use change::Precheck;
pub use deferred::DeferredEvents;
pub use engine::{MarkerInfo, Subscription, SubscriptionEngine, UpsertOutcome};
pub use event::{BroadcastSink, EventSink, MarkerEvent, RecordingSink};
pub use marker::{FieldList, History, Marker, MarkerSpec, MarkerTarget};
pub use marker_set::MarkerSet;

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Globally unique marker identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkerId(pub u64);

impl MarkerId {
    /// Derive an id from watched field names, chained onto a previous id.
    ///
    /// Refining an existing watch with more fields yields a new, stable id
    /// without coordination between clients.
    pub fn derive(prev: Option<MarkerId>, fields: &str) -> Self {
        let seed = prev.map_or(0, |id| id.0);
        Self(xxh3_64_with_seed(fields.as_bytes(), seed))
    }
}

impl fmt::Display for MarkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Marker flag bitset.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkerFlags(u32);

impl MarkerFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Hierarchy (edge) changes.
    pub const CH_HIERARCHY: Self = Self(0x0001);
    /// Field changes.
    pub const CH_FIELD: Self = Self(0x0002);
    /// Alias changes.
    pub const CH_ALIAS: Self = Self(0x0004);
    /// Node lifecycle trigger.
    pub const TRIGGER: Self = Self(0x0008);
    /// Waiting for a node id or alias to appear.
    pub const MISSING: Self = Self(0x0010);
    /// Never traversal-placed.
    pub const DETACH: Self = Self(0x0020);
    /// Changes of the root node itself are ignored.
    pub const REF: Self = Self(0x0040);
    /// Emit a synthetic event on refresh.
    pub const REFRESH: Self = Self(0x0080);

    const NAMES: [(Self, &'static str); 8] = [
        (Self::CH_HIERARCHY, "hierarchy"),
        (Self::CH_FIELD, "field"),
        (Self::CH_ALIAS, "alias"),
        (Self::TRIGGER, "trigger"),
        (Self::MISSING, "missing"),
        (Self::DETACH, "detach"),
        (Self::REF, "ref"),
        (Self::REFRESH, "refresh"),
    ];

    /// Build from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True if every flag in `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any flag in `other` is set.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// True if no flag is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Set the flags in `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clear the flags in `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Names of the set flags.
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Parse a single flag name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(flag, _)| *flag)
    }
}

impl BitOr for MarkerFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for MarkerFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for MarkerFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for MarkerFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MarkerFlags({})", self.names().join("|"))
    }
}

/// Node lifecycle events that trigger markers react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    /// A node was created.
    Created,
    /// A node was updated.
    Updated,
    /// A node is being deleted.
    Deleted,
}

/// What the engine does with a marker at a given point.
///
/// `Defer` and `FireImmediate` are firing actions carried by markers;
/// `SetOnNode` and `ClearFromNode` are applied by placement walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Queue the event until the end of the write.
    #[default]
    Defer,
    /// Queue the event and flush it right away.
    FireImmediate,
    /// Add the marker to a node's local set.
    SetOnNode,
    /// Remove the marker from a node's local set.
    ClearFromNode,
}

impl Action {
    /// Whether a marker may carry this action.
    pub fn is_firing(self) -> bool {
        matches!(self, Self::Defer | Self::FireImmediate)
    }
}
