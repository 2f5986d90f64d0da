//! Graph Nodes
//!
//! This module defines the node types stored by [`MemoryGraph`](super::MemoryGraph).

use std::fmt;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use super::NodeView;
use crate::error::{Error, Result};
use crate::subscriptions::MarkerSet;

/// Size of a node id in bytes.
pub const NODE_ID_SIZE: usize = 10;

/// Fixed-size node identifier.
///
/// Shorter ids are zero padded. Ids are compared bytewise, so the padding is
/// part of the identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    /// The hierarchy root.
    pub const ROOT: NodeId = NodeId(*b"root\0\0\0\0\0\0");

    /// Build an id, rejecting empty or oversized input.
    pub fn try_new(id: &str) -> Result<Self> {
        if id.is_empty() || id.len() > NODE_ID_SIZE {
            return Err(Error::invalid(format!(
                "node id must be 1..={NODE_ID_SIZE} bytes, got {}",
                id.len()
            )));
        }
        Ok(Self::from(id))
    }

    /// Raw bytes including padding.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    /// The id without trailing padding.
    pub fn trimmed(&self) -> &[u8] {
        let end = self
            .0
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |pos| pos + 1);
        &self.0[..end]
    }
}

impl From<&str> for NodeId {
    /// Pads short ids and truncates long ones to [`NODE_ID_SIZE`].
    fn from(id: &str) -> Self {
        let mut buf = [0u8; NODE_ID_SIZE];
        let len = id.len().min(NODE_ID_SIZE);
        buf[..len].copy_from_slice(&id.as_bytes()[..len]);
        Self(buf)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.trimmed()))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::try_new(&s).map_err(serde::de::Error::custom)
    }
}

/// Engine-owned metadata carried by every node.
#[derive(Debug, Default)]
pub struct NodeMetadata {
    /// Markers placed on this node.
    pub sub_markers: MarkerSet,
}

/// A node in the in-memory graph.
#[derive(Debug)]
pub struct Node {
    /// Unique identifier for this node.
    id: NodeId,

    /// Parent nodes in the hierarchy.
    parents: IndexSet<NodeId>,

    /// Child nodes in the hierarchy.
    children: IndexSet<NodeId>,

    /// Named edge fields and their destinations.
    edges: IndexMap<String, IndexSet<NodeId>>,

    /// The node's data object.
    data: Map<String, Value>,

    /// Aliases resolving to this node.
    aliases: Vec<String>,

    metadata: NodeMetadata,
}

impl Node {
    /// Create an empty node.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            parents: IndexSet::new(),
            children: IndexSet::new(),
            edges: IndexMap::new(),
            data: Map::new(),
            aliases: Vec::new(),
            metadata: NodeMetadata::default(),
        }
    }

    /// Get the node's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Direct parents.
    pub fn parents(&self) -> &IndexSet<NodeId> {
        &self.parents
    }

    /// Direct children.
    pub fn children(&self) -> &IndexSet<NodeId> {
        &self.children
    }

    pub(crate) fn add_parent(&mut self, id: NodeId) -> bool {
        self.parents.insert(id)
    }

    pub(crate) fn remove_parent(&mut self, id: &NodeId) -> bool {
        self.parents.shift_remove(id)
    }

    pub(crate) fn add_child(&mut self, id: NodeId) -> bool {
        self.children.insert(id)
    }

    pub(crate) fn remove_child(&mut self, id: &NodeId) -> bool {
        self.children.shift_remove(id)
    }

    /// Destinations of an edge field.
    pub fn edge(&self, field: &str) -> Option<&IndexSet<NodeId>> {
        self.edges.get(field)
    }

    /// All edge fields.
    pub fn edges(&self) -> &IndexMap<String, IndexSet<NodeId>> {
        &self.edges
    }

    pub(crate) fn add_edge(&mut self, field: &str, dst: NodeId) -> bool {
        self.edges.entry(field.to_string()).or_default().insert(dst)
    }

    pub(crate) fn remove_edge(&mut self, field: &str, dst: &NodeId) -> bool {
        let removed = self
            .edges
            .get_mut(field)
            .map_or(false, |dsts| dsts.shift_remove(dst));
        if self.edges.get(field).map_or(false, IndexSet::is_empty) {
            self.edges.shift_remove(field);
        }
        removed
    }

    /// Drop every reference to `id` from hierarchy sets and edge fields.
    pub(crate) fn forget(&mut self, id: &NodeId) {
        self.parents.shift_remove(id);
        self.children.shift_remove(id);
        self.edges.retain(|_, dsts| {
            dsts.shift_remove(id);
            !dsts.is_empty()
        });
    }

    /// Nodes referenced by a field.
    ///
    /// `children` and `parents` resolve to the hierarchy when
    /// `include_hierarchy` is set; anything else is an edge field.
    pub fn field_refs(&self, field: &str, include_hierarchy: bool) -> Vec<NodeId> {
        match field {
            "children" if include_hierarchy => self.children.iter().copied().collect(),
            "parents" if include_hierarchy => self.parents.iter().copied().collect(),
            _ => self
                .edges
                .get(field)
                .map(|dsts| dsts.iter().copied().collect())
                .unwrap_or_default(),
        }
    }

    /// The data object.
    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    /// Set a field by dotted path, creating intermediate objects.
    ///
    /// Returns the previous value.
    pub fn set_field(&mut self, path: &str, value: Value) -> Result<Option<Value>> {
        let mut segments = path.split('.').peekable();
        let mut object = &mut self.data;
        while let Some(segment) = segments.next() {
            if segment.is_empty() {
                return Err(Error::invalid(format!("bad field path {path:?}")));
            }
            if segments.peek().is_none() {
                return Ok(object.insert(segment.to_string(), value));
            }
            let slot = object
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            object = slot
                .as_object_mut()
                .ok_or_else(|| Error::invalid(format!("{segment:?} in {path:?} is not an object")))?;
        }
        Err(Error::invalid("empty field path"))
    }

    /// Remove a field by dotted path.
    pub fn remove_field(&mut self, path: &str) -> Option<Value> {
        match path.rsplit_once('.') {
            Some((parent, last)) => {
                let mut object = &mut self.data;
                for segment in parent.split('.') {
                    object = object.get_mut(segment)?.as_object_mut()?;
                }
                object.remove(last)
            }
            None => self.data.remove(path),
        }
    }

    pub(crate) fn add_alias(&mut self, alias: &str) -> bool {
        if self.aliases.iter().any(|a| a == alias) {
            return false;
        }
        self.aliases.push(alias.to_string());
        true
    }

    pub(crate) fn remove_alias(&mut self, alias: &str) -> bool {
        let before = self.aliases.len();
        self.aliases.retain(|a| a != alias);
        before != self.aliases.len()
    }

    /// Engine metadata.
    pub fn metadata(&self) -> &NodeMetadata {
        &self.metadata
    }

    /// Mutable engine metadata.
    pub fn metadata_mut(&mut self) -> &mut NodeMetadata {
        &mut self.metadata
    }
}

impl NodeView for Node {
    fn id(&self) -> &NodeId {
        &self.id
    }

    fn field(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut value = self.data.get(segments.next()?)?;
        for segment in segments {
            value = value.as_object()?.get(segment)?;
        }
        Some(value)
    }

    fn aliases(&self) -> &[String] {
        &self.aliases
    }
}
