//! In-Memory Graph
//!
//! A hash-map backed implementation of [`Graph`]. Mutation methods here are
//! raw storage operations: they do not call any subscription hooks. The
//! [`WriteTxn`](crate::write::WriteTxn) write path wraps them and pairs every
//! mutation with the engine calls it requires.
//!
//! # Traversal
//!
//! Hierarchy walks exclude the root except for `Children`, `Parents` and
//! `DfsFull`, which anchor the marker on the root so hierarchy changes of the
//! root itself are seen. Field and expression walks also visit the root,
//! which owns the anchoring field.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::Value;

use super::node::{Node, NodeId};
use super::{Direction, Graph, NodeView, Relatives, Traversal};
use crate::error::{Error, Result};
use crate::expression::EvalContext;
use crate::subscriptions::MarkerSet;

/// In-memory hierarchy with edge fields and aliases.
#[derive(Debug)]
pub struct MemoryGraph {
    /// All nodes, indexed by id.
    nodes: HashMap<NodeId, Node>,

    /// Alias name to node id.
    aliases: HashMap<String, NodeId>,
}

impl MemoryGraph {
    /// Create a graph containing only the root node.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(NodeId::ROOT, Node::new(NodeId::ROOT));
        Self {
            nodes,
            aliases: HashMap::new(),
        }
    }

    /// Add a node. Returns false if it already existed.
    pub fn create_node(&mut self, id: NodeId) -> bool {
        if self.nodes.contains_key(&id) {
            return false;
        }
        self.nodes.insert(id, Node::new(id));
        true
    }

    /// Remove a node and every edge pointing at it.
    ///
    /// Returns the removed node so the caller can inspect its metadata.
    pub fn remove_node(&mut self, id: &NodeId) -> Option<Node> {
        let node = self.nodes.remove(id)?;
        for other in self.nodes.values_mut() {
            other.forget(id);
        }
        for alias in node.aliases() {
            self.aliases.remove(alias);
        }
        Some(node)
    }

    /// Get a node.
    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Get a mutable node.
    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    fn require_mut(&mut self, id: &NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(id).ok_or(Error::NodeNotFound(*id))
    }

    fn require_both(&self, a: &NodeId, b: &NodeId) -> Result<()> {
        for id in [a, b] {
            if !self.nodes.contains_key(id) {
                return Err(Error::NodeNotFound(*id));
            }
        }
        Ok(())
    }

    /// Add a parent/child edge. Returns false if it already existed.
    pub fn add_child(&mut self, parent: &NodeId, child: &NodeId) -> Result<bool> {
        self.require_both(parent, child)?;
        if parent == child {
            return Err(Error::invalid("a node cannot be its own child"));
        }
        let added = self.require_mut(parent)?.add_child(*child);
        self.require_mut(child)?.add_parent(*parent);
        Ok(added)
    }

    /// Remove a parent/child edge.
    pub fn remove_child(&mut self, parent: &NodeId, child: &NodeId) -> Result<bool> {
        self.require_both(parent, child)?;
        let removed = self.require_mut(parent)?.remove_child(child);
        self.require_mut(child)?.remove_parent(parent);
        Ok(removed)
    }

    /// Add `dst` to the edge field `field` of `src`.
    pub fn add_edge(&mut self, src: &NodeId, field: &str, dst: &NodeId) -> Result<bool> {
        self.require_both(src, dst)?;
        if matches!(field, "children" | "parents") || field.is_empty() {
            return Err(Error::invalid(format!("{field:?} is not an edge field name")));
        }
        Ok(self.require_mut(src)?.add_edge(field, *dst))
    }

    /// Remove `dst` from the edge field `field` of `src`.
    pub fn remove_edge(&mut self, src: &NodeId, field: &str, dst: &NodeId) -> Result<bool> {
        Ok(self.require_mut(src)?.remove_edge(field, dst))
    }

    /// Set a data field by dotted path. Returns the previous value.
    pub fn set_field(&mut self, id: &NodeId, path: &str, value: Value) -> Result<Option<Value>> {
        self.require_mut(id)?.set_field(path, value)
    }

    /// Remove a data field by dotted path.
    pub fn remove_field(&mut self, id: &NodeId, path: &str) -> Result<Option<Value>> {
        Ok(self.require_mut(id)?.remove_field(path))
    }

    /// Point `alias` at `id`. Returns the node that previously held the alias.
    pub fn set_alias(&mut self, id: &NodeId, alias: &str) -> Result<Option<NodeId>> {
        if alias.is_empty() {
            return Err(Error::invalid("empty alias"));
        }
        self.require_mut(id)?.add_alias(alias);
        let previous = self.aliases.insert(alias.to_string(), *id);
        if let Some(prev) = previous.filter(|prev| prev != id) {
            if let Some(node) = self.nodes.get_mut(&prev) {
                node.remove_alias(alias);
            }
        }
        Ok(previous.filter(|prev| prev != id))
    }

    /// Remove an alias. Returns the node it pointed at.
    pub fn remove_alias(&mut self, alias: &str) -> Option<NodeId> {
        let id = self.aliases.remove(alias)?;
        if let Some(node) = self.nodes.get_mut(&id) {
            node.remove_alias(alias);
        }
        Some(id)
    }

    /// Node currently holding an alias.
    pub fn alias_target(&self, alias: &str) -> Option<NodeId> {
        self.aliases.get(alias).copied()
    }

    /// Resolve a node id or alias string.
    pub fn resolve(&self, accessor: &str) -> Option<NodeId> {
        if accessor.len() <= super::NODE_ID_SIZE {
            let id = NodeId::from(accessor);
            if self.nodes.contains_key(&id) {
                return Some(id);
            }
        }
        self.alias_target(accessor)
    }

    /// Get the total number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn hierarchy_step(&self, id: &NodeId, up: bool) -> Vec<NodeId> {
        self.nodes
            .get(id)
            .map(|node| {
                let set = if up { node.parents() } else { node.children() };
                set.iter().copied().collect()
            })
            .unwrap_or_default()
    }

    fn bfs(
        &self,
        root: &NodeId,
        include_root: bool,
        visit: &mut dyn FnMut(&NodeId),
        next: &mut dyn FnMut(&NodeId) -> Result<Vec<NodeId>>,
    ) -> Result<()> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(*root);
        queue.push_back(*root);

        while let Some(id) = queue.pop_front() {
            if id != *root || include_root {
                visit(&id);
            }
            for neighbor in next(&id)? {
                if self.nodes.contains_key(&neighbor) && visited.insert(neighbor) {
                    queue.push_back(neighbor);
                }
            }
        }
        Ok(())
    }

    fn dfs(&self, root: &NodeId, include_root: bool, up: bool, visit: &mut dyn FnMut(&NodeId)) {
        let mut visited = HashSet::new();
        let mut stack = vec![*root];

        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            if id != *root || include_root {
                visit(&id);
            }
            // Reverse so the first child is visited first.
            for neighbor in self.hierarchy_step(&id, up).into_iter().rev() {
                if !visited.contains(&neighbor) {
                    stack.push(neighbor);
                }
            }
        }
    }

    fn expression_fields(&self, id: &NodeId, traversal: &Traversal<'_>) -> Result<Vec<NodeId>> {
        let expression = traversal
            .expression
            .ok_or_else(|| Error::invalid("expression traversal without an expression"))?;
        let Some(node) = self.nodes.get(id) else {
            return Ok(Vec::new());
        };
        let ctx = EvalContext::new(node, &expression.registers);
        let fields = expression.expression.select_fields(&ctx)?;
        Ok(fields
            .iter()
            .flat_map(|field| node.field_refs(field, true))
            .collect())
    }
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph for MemoryGraph {
    fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    fn node(&self, id: &NodeId) -> Option<&dyn NodeView> {
        self.nodes.get(id).map(|node| node as &dyn NodeView)
    }

    fn traverse(
        &self,
        root: &NodeId,
        traversal: &Traversal<'_>,
        visit: &mut dyn FnMut(&NodeId),
    ) -> Result<()> {
        let node = self.nodes.get(root).ok_or(Error::NodeNotFound(*root))?;
        let field = || {
            traversal
                .ref_field
                .ok_or_else(|| Error::invalid(format!("{} needs a field", traversal.dir.name())))
        };

        match traversal.dir {
            Direction::None => {}
            Direction::Node => visit(root),
            Direction::Children | Direction::Parents => {
                visit(root);
                let up = traversal.dir == Direction::Parents;
                for id in self.hierarchy_step(root, up) {
                    visit(&id);
                }
            }
            Direction::BfsAncestors | Direction::BfsDescendants => {
                let up = traversal.dir == Direction::BfsAncestors;
                self.bfs(root, false, visit, &mut |id| Ok(self.hierarchy_step(id, up)))?;
            }
            Direction::DfsAncestors => self.dfs(root, false, true, visit),
            Direction::DfsDescendants => self.dfs(root, false, false, visit),
            Direction::DfsFull => self.dfs(root, true, false, visit),
            Direction::Ref => {
                let field = field()?;
                let dsts = node.field_refs(field, false);
                if dsts.len() > 1 {
                    return Err(Error::not_supported(format!(
                        "reference field {field:?} on {root} holds {} nodes",
                        dsts.len()
                    )));
                }
                visit(root);
                for dst in dsts.iter().filter(|dst| self.nodes.contains_key(*dst)) {
                    visit(dst);
                }
            }
            Direction::EdgeField | Direction::Field => {
                let field = field()?;
                let include_hierarchy = traversal.dir == Direction::Field;
                visit(root);
                for dst in node.field_refs(field, include_hierarchy) {
                    if dst != *root && self.nodes.contains_key(&dst) {
                        visit(&dst);
                    }
                }
            }
            Direction::BfsEdgeField | Direction::BfsField => {
                let field = field()?;
                let include_hierarchy = traversal.dir == Direction::BfsField;
                self.bfs(root, true, visit, &mut |id| {
                    Ok(self
                        .nodes
                        .get(id)
                        .map(|n| n.field_refs(field, include_hierarchy))
                        .unwrap_or_default())
                })?;
            }
            Direction::Expression => {
                visit(root);
                for dst in self.expression_fields(root, traversal)? {
                    if dst != *root && self.nodes.contains_key(&dst) {
                        visit(&dst);
                    }
                }
            }
            Direction::BfsExpression => {
                self.bfs(root, true, visit, &mut |id| self.expression_fields(id, traversal))?;
            }
        }
        Ok(())
    }

    fn markers(&self, id: &NodeId) -> Option<&MarkerSet> {
        self.nodes.get(id).map(|node| &node.metadata().sub_markers)
    }

    fn markers_mut(&mut self, id: &NodeId) -> Option<&mut MarkerSet> {
        self.nodes
            .get_mut(id)
            .map(|node| &mut node.metadata_mut().sub_markers)
    }

    fn relative_count(&self, id: &NodeId, relatives: Relatives) -> usize {
        self.nodes.get(id).map_or(0, |node| match relatives {
            Relatives::Parents => node.parents().len(),
            Relatives::Children => node.children().len(),
        })
    }

    fn resolve(&self, accessor: &str) -> Option<NodeId> {
        MemoryGraph::resolve(self, accessor)
    }
}
