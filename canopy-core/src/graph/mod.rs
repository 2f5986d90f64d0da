//! Node Graph
//!
//! This module defines the contract between the subscription engine and the
//! graph storage it watches, plus an in-memory implementation of that
//! contract.
//!
//! # Overview
//!
//! The graph is a directed hierarchy where:
//!
//! - Nodes are identified by a fixed-size [`NodeId`]
//! - Parent/child edges form the hierarchy
//! - Named edge fields hold additional references between nodes
//! - Every node carries metadata, including its local marker set
//!
//! The engine never walks the graph by itself. It asks the graph to
//! [`traverse`](Graph::traverse) from a root in some [`Direction`] and acts on
//! every visited node id.
//!
//! # Design Decisions
//!
//! 1. Traversal visits ids rather than nodes so the caller can mutate node
//!    metadata after the walk without holding a borrow of the graph.
//!
//! 2. Per-node marker sets live in the node's metadata and are reached through
//!    [`Graph::markers_mut`]; deleting a node deletes its set.
//!
//! 3. Predicates see nodes through the read-only [`NodeView`] trait.

mod memory;
mod node;

pub use memory::MemoryGraph;
pub use node::{Node, NodeId, NodeMetadata, NODE_ID_SIZE};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::expression::Filter;
use crate::subscriptions::MarkerSet;

/// Graph walk patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// No traversal; the marker is detached.
    None,
    /// The root node only.
    Node,
    /// The root and the single node referenced by a reference field.
    Ref,
    /// The root and its direct children.
    Children,
    /// The root and its direct parents.
    Parents,
    /// All ancestors, breadth first.
    BfsAncestors,
    /// All descendants, breadth first.
    BfsDescendants,
    /// All ancestors, depth first.
    DfsAncestors,
    /// All descendants, depth first.
    DfsDescendants,
    /// The root and the full subtree below it, depth first.
    DfsFull,
    /// The root and the destinations of an edge field.
    EdgeField,
    /// An edge field followed transitively, breadth first.
    BfsEdgeField,
    /// The root and the nodes referenced by any field.
    Field,
    /// Any field followed transitively, breadth first.
    BfsField,
    /// The root and the nodes in fields selected by an expression.
    Expression,
    /// Expression-selected fields followed transitively, breadth first.
    BfsExpression,
}

impl Direction {
    const NAMES: [(Direction, &'static str); 16] = [
        (Direction::None, "none"),
        (Direction::Node, "node"),
        (Direction::Ref, "ref"),
        (Direction::Children, "children"),
        (Direction::Parents, "parents"),
        (Direction::BfsAncestors, "bfs_ancestors"),
        (Direction::BfsDescendants, "bfs_descendants"),
        (Direction::DfsAncestors, "dfs_ancestors"),
        (Direction::DfsDescendants, "dfs_descendants"),
        (Direction::DfsFull, "dfs_full"),
        (Direction::EdgeField, "edge_field"),
        (Direction::BfsEdgeField, "bfs_edge_field"),
        (Direction::Field, "field"),
        (Direction::BfsField, "bfs_field"),
        (Direction::Expression, "expression"),
        (Direction::BfsExpression, "bfs_expression"),
    ];

    /// Wire name of the direction.
    pub fn name(self) -> &'static str {
        Self::NAMES
            .iter()
            .find(|(dir, _)| *dir == self)
            .map(|(_, name)| *name)
            .unwrap_or("none")
    }

    /// Parse a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(dir, _)| *dir)
    }

    /// Directions anchored on a named field.
    pub fn needs_ref_field(self) -> bool {
        matches!(
            self,
            Self::Ref | Self::EdgeField | Self::BfsEdgeField | Self::Field | Self::BfsField
        )
    }

    /// Directions driven by a traversal expression.
    pub fn needs_expression(self) -> bool {
        matches!(self, Self::Expression | Self::BfsExpression)
    }

    /// Anything that reaches beyond a single node.
    pub fn is_traversing(self) -> bool {
        !matches!(self, Self::None | Self::Node)
    }

    /// Breadth-first variants that follow their anchor transitively.
    pub fn is_bfs(self) -> bool {
        matches!(
            self,
            Self::BfsAncestors
                | Self::BfsDescendants
                | Self::BfsEdgeField
                | Self::BfsField
                | Self::BfsExpression
        )
    }

    /// Whole-subtree walks; a marker on a parent applies to every new child.
    pub fn covers_descendants(self) -> bool {
        matches!(self, Self::BfsDescendants | Self::DfsDescendants | Self::DfsFull)
    }

    /// Whole-ancestry walks; a marker on a child applies to every new parent.
    pub fn covers_ancestors(self) -> bool {
        matches!(self, Self::BfsAncestors | Self::DfsAncestors)
    }
}

/// One traversal request.
#[derive(Debug, Clone, Copy)]
pub struct Traversal<'a> {
    /// Walk pattern.
    pub dir: Direction,
    /// Field name for field-anchored directions.
    pub ref_field: Option<&'a str>,
    /// Field selector for expression directions.
    pub expression: Option<&'a Filter>,
}

impl<'a> Traversal<'a> {
    /// A traversal that needs neither a field nor an expression.
    pub fn new(dir: Direction) -> Self {
        Self {
            dir,
            ref_field: None,
            expression: None,
        }
    }
}

/// Which relatives to count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relatives {
    /// Direct parents.
    Parents,
    /// Direct children.
    Children,
}

/// Read-only view of a node for predicate evaluation.
pub trait NodeView {
    /// The node's id.
    fn id(&self) -> &NodeId;

    /// Look up a data field by dotted path.
    fn field(&self, path: &str) -> Option<&Value>;

    /// Aliases currently pointing at this node.
    fn aliases(&self) -> &[String];
}

/// The graph storage contract consumed by the subscription engine.
pub trait Graph {
    /// Whether the node exists.
    fn contains(&self, id: &NodeId) -> bool;

    /// Read view of a node.
    fn node(&self, id: &NodeId) -> Option<&dyn NodeView>;

    /// Walk from `root` and call `visit` for every node the walk reaches.
    ///
    /// Fails with [`Error::NodeNotFound`](crate::Error::NodeNotFound) if the
    /// root does not exist.
    fn traverse(
        &self,
        root: &NodeId,
        traversal: &Traversal<'_>,
        visit: &mut dyn FnMut(&NodeId),
    ) -> Result<()>;

    /// The node's local marker set.
    fn markers(&self, id: &NodeId) -> Option<&MarkerSet>;

    /// Mutable access to the node's local marker set.
    fn markers_mut(&mut self, id: &NodeId) -> Option<&mut MarkerSet>;

    /// Number of direct parents or children of a node.
    fn relative_count(&self, id: &NodeId, relatives: Relatives) -> usize;

    /// Resolve a node id or alias string to an existing node.
    fn resolve(&self, accessor: &str) -> Option<NodeId>;
}
