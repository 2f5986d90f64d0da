//! Write Path
//!
//! [`WriteTxn`] wraps the raw [`MemoryGraph`] mutations of one top-level
//! command and pairs each of them with the engine hooks it requires. Events
//! deferred during the transaction are flushed by [`WriteTxn::commit`], or
//! when the transaction is dropped.
//!
//! # Example
//!
//! ```
//! use canopy_core::graph::{MemoryGraph, NodeId};
//! use canopy_core::subscriptions::{RecordingSink, SubscriptionEngine};
//! use canopy_core::write::WriteTxn;
//!
//! let mut graph = MemoryGraph::new();
//! let mut engine = SubscriptionEngine::with_sink(RecordingSink::new());
//!
//! let mut txn = WriteTxn::new(&mut graph, &mut engine);
//! txn.create_node(NodeId::from("ma1"));
//! txn.add_child(&NodeId::ROOT, &NodeId::from("ma1")).unwrap();
//! txn.set_field(&NodeId::from("ma1"), "title", "hello".into()).unwrap();
//! txn.commit();
//! ```

use serde_json::Value;

use crate::error::{Error, Result};
use crate::graph::{Graph, MemoryGraph, NodeId, NodeView};
use crate::subscriptions::{SubscriptionEngine, TriggerEvent};

/// One write command against a graph and its subscription engine.
pub struct WriteTxn<'a> {
    graph: &'a mut MemoryGraph,
    engine: &'a mut SubscriptionEngine,
    finished: bool,
}

impl<'a> WriteTxn<'a> {
    /// Start a write.
    pub fn new(graph: &'a mut MemoryGraph, engine: &'a mut SubscriptionEngine) -> Self {
        Self {
            graph,
            engine,
            finished: false,
        }
    }

    /// The graph as modified so far.
    pub fn graph(&self) -> &MemoryGraph {
        &*self.graph
    }

    /// The engine.
    pub fn engine(&mut self) -> &mut SubscriptionEngine {
        &mut *self.engine
    }

    /// Create a node. Returns false if it already existed.
    pub fn create_node(&mut self, id: NodeId) -> bool {
        if !self.graph.create_node(id) {
            return false;
        }
        self.engine.on_node_created(&mut *self.graph, &id);
        true
    }

    /// Set a data field. Returns the previous value.
    pub fn set_field(&mut self, id: &NodeId, field: &str, value: Value) -> Result<Option<Value>> {
        let precheck = self.engine.field_change_precheck(&*self.graph, id);
        let new = value.clone();
        let result = self.graph.set_field(id, field, value);

        let changed = matches!(&result, Ok(old) if old.as_ref() != Some(&new));
        let single = [field];
        let fields: &[&str] = if changed { &single } else { &[] };
        self.engine
            .defer_field_change_events(&*self.graph, precheck, fields);
        if changed {
            self.engine
                .defer_trigger_events(&*self.graph, id, TriggerEvent::Updated);
        }
        result
    }

    /// Remove a data field. Returns the removed value.
    pub fn remove_field(&mut self, id: &NodeId, field: &str) -> Result<Option<Value>> {
        let precheck = self.engine.field_change_precheck(&*self.graph, id);
        let result = self.graph.remove_field(id, field);

        let changed = matches!(&result, Ok(Some(_)));
        let single = [field];
        let fields: &[&str] = if changed { &single } else { &[] };
        self.engine
            .defer_field_change_events(&*self.graph, precheck, fields);
        if changed {
            self.engine
                .defer_trigger_events(&*self.graph, id, TriggerEvent::Updated);
        }
        result
    }

    /// Make `child` a child of `parent`. Returns false if the edge existed.
    pub fn add_child(&mut self, parent: &NodeId, child: &NodeId) -> Result<bool> {
        if !self.graph.add_child(parent, child)? {
            return Ok(false);
        }
        let graph: &mut dyn Graph = &mut *self.graph;
        self.engine.inherit_parent(graph, child, parent);
        self.engine.inherit_child(graph, parent, child);
        self.engine.inherit_edge(graph, parent, child, "children");
        self.engine.inherit_edge(graph, child, parent, "parents");
        self.engine.defer_hierarchy_events(graph, parent);
        self.engine.defer_hierarchy_events(graph, child);
        Ok(true)
    }

    /// Remove a parent/child edge. Returns false if there was none.
    ///
    /// Markers that reached `child` through `parent` cannot be retracted
    /// without a walk, so traversing markers on both ends fire instead.
    pub fn remove_child(&mut self, parent: &NodeId, child: &NodeId) -> Result<bool> {
        let linked = self
            .graph
            .get(parent)
            .map_or(false, |node| node.children().contains(child));
        if !linked {
            return self.graph.remove_child(parent, child);
        }
        let graph: &mut dyn Graph = &mut *self.graph;
        self.engine.defer_event_for_traversing_markers(graph, child);
        self.engine.defer_event_for_traversing_markers(graph, parent);
        if !self.graph.remove_child(parent, child)? {
            return Ok(false);
        }
        let graph: &mut dyn Graph = &mut *self.graph;
        self.engine.defer_hierarchy_events(graph, parent);
        self.engine.defer_hierarchy_events(graph, child);
        Ok(true)
    }

    /// Add `dst` to the edge field `field` of `src`.
    pub fn add_edge(&mut self, src: &NodeId, field: &str, dst: &NodeId) -> Result<bool> {
        let precheck = self.engine.field_change_precheck(&*self.graph, src);
        let result = self.graph.add_edge(src, field, dst);

        let added = matches!(result, Ok(true));
        if added {
            self.engine.inherit_edge(&mut *self.graph, src, dst, field);
        }
        let single = [field];
        let fields: &[&str] = if added { &single } else { &[] };
        self.engine
            .defer_field_change_events(&*self.graph, precheck, fields);
        result
    }

    /// Remove `dst` from the edge field `field` of `src`.
    pub fn remove_edge(&mut self, src: &NodeId, field: &str, dst: &NodeId) -> Result<bool> {
        let precheck = self.engine.field_change_precheck(&*self.graph, src);
        let result = self.graph.remove_edge(src, field, dst);

        let removed = matches!(result, Ok(true));
        let single = [field];
        let fields: &[&str] = if removed { &single } else { &[] };
        self.engine
            .defer_field_change_events(&*self.graph, precheck, fields);
        result
    }

    /// Point `alias` at `id`.
    ///
    /// Alias markers on the node losing the alias fire before the change;
    /// markers waiting for the alias to exist fire after it.
    pub fn set_alias(&mut self, id: &NodeId, alias: &str) -> Result<()> {
        if !self.graph.contains(id) {
            return Err(Error::NodeNotFound(*id));
        }
        if let Some(previous) = self.graph.alias_target(alias).filter(|prev| prev != id) {
            self.engine
                .defer_alias_change_events(&mut *self.graph, &previous);
        }
        self.graph.set_alias(id, alias)?;
        self.engine
            .defer_missing_accessor_events(&mut *self.graph, alias);
        Ok(())
    }

    /// Remove an alias. Returns the node it pointed at.
    pub fn remove_alias(&mut self, alias: &str) -> Option<NodeId> {
        let holder = self.graph.alias_target(alias)?;
        self.engine
            .defer_alias_change_events(&mut *self.graph, &holder);
        self.graph.remove_alias(alias)
    }

    /// Delete a node and every edge touching it.
    pub fn delete_node(&mut self, id: &NodeId) -> Result<()> {
        if *id == NodeId::ROOT {
            return Err(Error::invalid("the root node cannot be deleted"));
        }
        let node = self.graph.get(id).ok_or(Error::NodeNotFound(*id))?;
        let neighbors: Vec<NodeId> = node
            .parents()
            .iter()
            .chain(node.children().iter())
            .copied()
            .collect();
        let has_aliases = !node.aliases().is_empty();

        if has_aliases {
            self.engine.defer_alias_change_events(&mut *self.graph, id);
        }
        self.engine.on_node_deleted(&mut *self.graph, id);
        self.graph.remove_node(id);

        for neighbor in &neighbors {
            self.engine.defer_hierarchy_events(&*self.graph, neighbor);
        }
        Ok(())
    }

    /// Finish the command and flush deferred events.
    pub fn commit(mut self) -> usize {
        self.finished = true;
        self.engine.send_deferred_events()
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.engine.send_deferred_events();
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::graph::Direction;
    use crate::subscriptions::{
        FieldList, MarkerFlags, MarkerId, MarkerSpec, RecordingSink, SubscriptionId,
    };

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    #[test]
    fn unchanged_value_does_not_fire() {
        let mut graph = MemoryGraph::new();
        graph.create_node(id("n"));
        let sink = RecordingSink::new();
        let mut engine = SubscriptionEngine::with_sink(sink.clone());
        let spec = MarkerSpec::new(MarkerId(1), Direction::Node, [id("n")])
            .fields(FieldList::new(["title"]));
        engine.upsert_marker(SubscriptionId(1), spec).unwrap();
        engine.refresh_marker(&mut graph, MarkerId(1)).unwrap();

        let mut txn = WriteTxn::new(&mut graph, &mut engine);
        txn.set_field(&id("n"), "title", json!("a")).unwrap();
        assert_eq!(txn.commit(), 1);

        let mut txn = WriteTxn::new(&mut graph, &mut engine);
        txn.set_field(&id("n"), "title", json!("a")).unwrap();
        assert_eq!(txn.commit(), 0);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn drop_flushes_pending_events() {
        let mut graph = MemoryGraph::new();
        graph.create_node(id("n"));
        let sink = RecordingSink::new();
        let mut engine = SubscriptionEngine::with_sink(sink.clone());
        let spec = MarkerSpec::new(MarkerId(1), Direction::Node, [id("n")])
            .flags(MarkerFlags::CH_HIERARCHY);
        engine.upsert_marker(SubscriptionId(1), spec).unwrap();
        engine.refresh_marker(&mut graph, MarkerId(1)).unwrap();

        {
            let mut txn = WriteTxn::new(&mut graph, &mut engine);
            txn.add_child(&NodeId::ROOT, &id("n")).unwrap();
        }
        assert_eq!(sink.len(), 1);
        assert!(engine.pending_events().is_empty());
    }

    #[test]
    fn removing_absent_child_is_silent() {
        let mut graph = MemoryGraph::new();
        for n in ["a", "b", "x"] {
            graph.create_node(id(n));
        }
        graph.add_child(&id("a"), &id("b")).unwrap();
        let sink = RecordingSink::new();
        let mut engine = SubscriptionEngine::with_sink(sink.clone());
        let spec = MarkerSpec::new(MarkerId(1), Direction::DfsFull, [id("a")])
            .flags(MarkerFlags::CH_HIERARCHY);
        engine.upsert_marker(SubscriptionId(1), spec).unwrap();
        engine.refresh_marker(&mut graph, MarkerId(1)).unwrap();

        let mut txn = WriteTxn::new(&mut graph, &mut engine);
        assert!(!txn.remove_child(&id("a"), &id("x")).unwrap());
        assert!(txn.remove_child(&id("a"), &id("ghost")).unwrap_err().is_not_found());
        assert_eq!(txn.commit(), 0);
        assert!(sink.is_empty());

        let mut txn = WriteTxn::new(&mut graph, &mut engine);
        assert!(txn.remove_child(&id("a"), &id("b")).unwrap());
        assert_eq!(txn.commit(), 1);
    }

    #[test]
    fn root_cannot_be_deleted() {
        let mut graph = MemoryGraph::new();
        let mut engine = SubscriptionEngine::with_sink(RecordingSink::new());
        let mut txn = WriteTxn::new(&mut graph, &mut engine);
        assert!(matches!(
            txn.delete_node(&NodeId::ROOT),
            Err(Error::InvalidArgument(_))
        ));
        assert!(txn.delete_node(&id("ghost")).unwrap_err().is_not_found());
    }
}
