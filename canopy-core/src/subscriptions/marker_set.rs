//! Marker Sets
//!
//! Ordered set of marker ids with a cached OR of the members' flags. Every
//! node carries one in its metadata, and the engine keeps one for detached
//! markers.

use std::collections::BTreeMap;

use super::{MarkerFlags, MarkerId};

/// Markers placed on one node (or the detached markers).
#[derive(Debug, Clone, Default)]
pub struct MarkerSet {
    /// Members with the flags they had when added.
    members: BTreeMap<MarkerId, MarkerFlags>,

    /// OR of all member flags.
    flags_filter: MarkerFlags,
}

impl MarkerSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a marker. Returns false if it was already a member.
    pub fn insert(&mut self, id: MarkerId, flags: MarkerFlags) -> bool {
        if self.members.insert(id, flags).is_some() {
            return false;
        }
        self.flags_filter |= flags;
        true
    }

    /// Remove a marker. Returns false if it was not a member.
    pub fn remove(&mut self, id: &MarkerId) -> bool {
        if self.members.remove(id).is_none() {
            return false;
        }
        self.flags_filter = self
            .members
            .values()
            .fold(MarkerFlags::NONE, |acc, flags| acc | *flags);
        true
    }

    /// Remove every member and return their ids.
    pub fn take(&mut self) -> Vec<MarkerId> {
        self.flags_filter = MarkerFlags::NONE;
        std::mem::take(&mut self.members).into_keys().collect()
    }

    /// Is `id` a member?
    pub fn contains(&self, id: &MarkerId) -> bool {
        self.members.contains_key(id)
    }

    /// Member ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = MarkerId> + '_ {
        self.members.keys().copied()
    }

    /// Member ids whose flags intersect `flags`, skipping the scan when the
    /// cached filter already rules every member out.
    pub fn ids_with(&self, flags: MarkerFlags) -> Vec<MarkerId> {
        if !self.flags_filter.intersects(flags) {
            return Vec::new();
        }
        self.members
            .iter()
            .filter(|(_, f)| f.intersects(flags))
            .map(|(id, _)| *id)
            .collect()
    }

    /// OR of all member flags.
    pub fn flags_filter(&self) -> MarkerFlags {
        self.flags_filter
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True if the set has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
