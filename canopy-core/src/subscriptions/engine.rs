//! Subscription Engine
//!
//! The engine is the registry of subscriptions and markers plus the
//! aggregate containers that do not belong to any single node: the detached
//! marker set, the missing-accessor index and the deferred event queue.
//!
//! # Lifecycle
//!
//! 1. [`upsert_marker`](SubscriptionEngine::upsert_marker) creates a marker
//!    (or finds an existing one with the same id) and links it to a
//!    subscription, creating the subscription on first use.
//!
//! 2. [`refresh_marker`](SubscriptionEngine::refresh_marker) places the marker
//!    on the graph.
//!
//! 3. [`delete_marker`](SubscriptionEngine::delete_marker) and
//!    [`delete_subscription`](SubscriptionEngine::delete_subscription) unlink.
//!    A marker left with no subscriptions has its pending event flushed, is
//!    cleared from every node and is destroyed.
//!
//! The engine is single threaded: it is owned by the graph instance and only
//! mutated by the thread executing the current write command.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use tokio::sync::broadcast;

use super::deferred::DeferredEvents;
use super::event::{BroadcastSink, EventSink};
use super::marker::{Marker, MarkerSpec};
use super::marker_set::MarkerSet;
use super::{MarkerFlags, MarkerId, SubscriptionId, TriggerEvent};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::graph::{Direction, Graph, NodeId};

/// Result of linking a marker to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// A new marker was created and linked.
    Created,
    /// An existing marker was linked to the subscription.
    Linked,
    /// The subscription already referenced the marker.
    AlreadySubscribed,
}

/// A user-visible group of markers, deleted as a unit.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: SubscriptionId,
    markers: BTreeSet<MarkerId>,
}

impl Subscription {
    fn new(id: SubscriptionId) -> Self {
        Self {
            id,
            markers: BTreeSet::new(),
        }
    }

    /// Subscription id.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Linked marker ids in ascending order.
    pub fn markers(&self) -> impl Iterator<Item = MarkerId> + '_ {
        self.markers.iter().copied()
    }

    /// Is the marker linked?
    pub fn contains(&self, marker_id: &MarkerId) -> bool {
        self.markers.contains(marker_id)
    }

    /// Number of linked markers.
    pub fn len(&self) -> usize {
        self.markers.len()
    }

    /// True if no marker is linked.
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

/// Serializable description of a marker for list and debug commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkerInfo {
    pub marker_id: MarkerId,
    pub flags: Vec<&'static str>,
    pub dir: Direction,
    pub node_ids: Vec<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ref_field: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    pub has_filter: bool,
    pub subs: Vec<SubscriptionId>,
    pub ref_count: usize,
}

impl From<&Marker> for MarkerInfo {
    fn from(marker: &Marker) -> Self {
        Self {
            marker_id: marker.id,
            flags: marker.flags.names(),
            dir: marker.dir,
            node_ids: marker.node_ids().to_vec(),
            trigger: marker.trigger_event(),
            ref_field: marker.ref_field.clone(),
            fields: marker
                .fields
                .as_ref()
                .map(|f| f.names().to_vec())
                .unwrap_or_default(),
            has_filter: marker.filter.is_some(),
            subs: marker.subs().collect(),
            ref_count: marker.ref_count(),
        }
    }
}

/// The subscription and change-notification engine.
pub struct SubscriptionEngine {
    pub(crate) config: EngineConfig,

    /// Subscriptions by id.
    pub(crate) subscriptions: BTreeMap<SubscriptionId, Subscription>,

    /// Marker arena by id.
    pub(crate) markers: BTreeMap<MarkerId, Marker>,

    /// Markers by root node id, for inheritance on new edges.
    pub(crate) roots: HashMap<NodeId, BTreeSet<MarkerId>>,

    /// Markers not bound to graph locations.
    pub(crate) detached: MarkerSet,

    /// Node id or alias string to the markers waiting for it.
    pub(crate) missing: IndexMap<String, IndexSet<MarkerId>>,

    pub(crate) deferred: DeferredEvents,

    pub(crate) sink: Box<dyn EventSink>,
}

impl SubscriptionEngine {
    /// Create an engine publishing to `sink`.
    pub fn new(config: EngineConfig, sink: Box<dyn EventSink>) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, sink))
    }

    /// Create an engine with the default configuration.
    pub fn with_sink(sink: impl EventSink + 'static) -> Self {
        Self::build(EngineConfig::default(), Box::new(sink))
    }

    /// Create an engine publishing over a broadcast channel of
    /// `config.broadcast_capacity` payloads.
    pub fn with_broadcast(
        config: EngineConfig,
    ) -> Result<(Self, broadcast::Receiver<Arc<[u8]>>)> {
        config.validate()?;
        let (sink, receiver) = BroadcastSink::new(config.broadcast_capacity);
        Ok((Self::build(config, Box::new(sink)), receiver))
    }

    fn build(config: EngineConfig, sink: Box<dyn EventSink>) -> Self {
        Self {
            config,
            subscriptions: BTreeMap::new(),
            markers: BTreeMap::new(),
            roots: HashMap::new(),
            detached: MarkerSet::new(),
            missing: IndexMap::new(),
            deferred: DeferredEvents::default(),
            sink,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------------

    /// Register an empty subscription.
    pub fn create_subscription(&mut self, sub_id: SubscriptionId) -> Result<()> {
        if self.subscriptions.contains_key(&sub_id) {
            return Err(Error::SubscriptionExists(sub_id));
        }
        self.subscriptions.insert(sub_id, Subscription::new(sub_id));
        tracing::debug!(%sub_id, "subscription created");
        Ok(())
    }

    /// Validate a spec and build the marker it describes.
    ///
    /// The marker is not registered; pass the spec to
    /// [`upsert_marker`](Self::upsert_marker) for that.
    pub fn new_marker(&self, spec: MarkerSpec) -> Result<Marker> {
        if self.markers.contains_key(&spec.id) {
            return Err(Error::MarkerExists(spec.id));
        }

        let mut flags = spec.flags;
        if spec.trigger.is_some() {
            flags |= MarkerFlags::TRIGGER;
        }
        if flags.contains(MarkerFlags::TRIGGER) {
            if spec.trigger.is_none() {
                return Err(Error::invalid("trigger marker without a trigger event"));
            }
            if !spec.node_ids.is_empty() {
                return Err(Error::invalid("trigger markers cannot have node ids"));
            }
            flags |= MarkerFlags::DETACH;
        } else if spec.node_ids.is_empty() && !flags.contains(MarkerFlags::MISSING) {
            return Err(Error::invalid("marker needs node ids or a trigger event"));
        }

        if spec.node_ids.len() > self.config.max_node_ids_per_marker {
            return Err(Error::invalid(format!(
                "{} node ids exceed the limit of {}",
                spec.node_ids.len(),
                self.config.max_node_ids_per_marker
            )));
        }

        if let Some(fields) = &spec.fields {
            if flags.contains(MarkerFlags::MISSING) {
                return Err(Error::invalid("missing-accessor markers cannot have a field list"));
            }
            if fields.byte_len() > self.config.max_fields_len {
                return Err(Error::invalid("field list too long"));
            }
            flags |= MarkerFlags::CH_FIELD;
        }

        if !spec.action.is_firing() {
            return Err(Error::invalid(format!(
                "{:?} is not a marker action",
                spec.action
            )));
        }

        Ok(Marker::from_spec(spec, flags))
    }

    /// Link a marker to a subscription, creating either as needed.
    ///
    /// If a marker with the spec's id already exists, the spec is ignored and
    /// the existing marker is linked.
    pub fn upsert_marker(
        &mut self,
        sub_id: SubscriptionId,
        spec: MarkerSpec,
    ) -> Result<UpsertOutcome> {
        if self.markers.contains_key(&spec.id) {
            return self.link_marker(sub_id, spec.id);
        }

        let marker = self.new_marker(spec)?;
        let marker_id = marker.id;
        for root in marker.node_ids() {
            self.roots.entry(*root).or_default().insert(marker_id);
        }
        self.markers.insert(marker_id, marker);
        self.link_marker(sub_id, marker_id)?;

        tracing::debug!(%sub_id, %marker_id, "marker created");
        Ok(UpsertOutcome::Created)
    }

    /// Link an existing marker to a subscription.
    pub fn link_marker(
        &mut self,
        sub_id: SubscriptionId,
        marker_id: MarkerId,
    ) -> Result<UpsertOutcome> {
        let marker = self
            .markers
            .get_mut(&marker_id)
            .ok_or(Error::MarkerNotFound(marker_id))?;
        let sub = self
            .subscriptions
            .entry(sub_id)
            .or_insert_with(|| Subscription::new(sub_id));

        if !sub.markers.insert(marker_id) {
            return Ok(UpsertOutcome::AlreadySubscribed);
        }
        marker.subs.insert(sub_id);
        Ok(UpsertOutcome::Linked)
    }

    /// Unlink a marker from a subscription.
    ///
    /// A subscription left empty is removed; a marker left without
    /// subscriptions is retired.
    pub fn delete_marker(
        &mut self,
        graph: &mut dyn Graph,
        sub_id: SubscriptionId,
        marker_id: MarkerId,
    ) -> Result<()> {
        let sub = self
            .subscriptions
            .get_mut(&sub_id)
            .ok_or(Error::SubscriptionNotFound(sub_id))?;
        if !sub.markers.remove(&marker_id) {
            return Err(Error::MarkerNotFound(marker_id));
        }
        if sub.markers.is_empty() {
            self.subscriptions.remove(&sub_id);
            tracing::debug!(%sub_id, "subscription emptied");
        }

        let orphaned = match self.markers.get_mut(&marker_id) {
            Some(marker) => {
                marker.subs.remove(&sub_id);
                marker.subs.is_empty()
            }
            None => false,
        };
        if orphaned {
            self.retire_marker(graph, marker_id);
        }
        Ok(())
    }

    /// Remove a subscription and unlink all of its markers.
    pub fn delete_subscription(
        &mut self,
        graph: &mut dyn Graph,
        sub_id: SubscriptionId,
    ) -> Result<()> {
        let sub = self
            .subscriptions
            .remove(&sub_id)
            .ok_or(Error::SubscriptionNotFound(sub_id))?;

        for marker_id in sub.markers {
            let orphaned = match self.markers.get_mut(&marker_id) {
                Some(marker) => {
                    marker.subs.remove(&sub_id);
                    marker.subs.is_empty()
                }
                None => false,
            };
            if orphaned {
                self.retire_marker(graph, marker_id);
            }
        }
        tracing::debug!(%sub_id, "subscription deleted");
        Ok(())
    }

    /// Flush, clear and destroy a marker nothing references any more.
    pub(crate) fn retire_marker(&mut self, graph: &mut dyn Graph, marker_id: MarkerId) {
        // Sub ids are only available while the marker exists.
        self.send_deferred_event(marker_id);
        self.clear_marker(graph, marker_id);
        self.destroy_marker(marker_id);
    }

    /// Drop a marker from the arena and every index.
    ///
    /// The marker must already be cleared from all marker sets.
    pub(crate) fn destroy_marker(&mut self, marker_id: MarkerId) {
        self.send_deferred_event(marker_id);

        let Some(marker) = self.markers.remove(&marker_id) else {
            return;
        };
        debug_assert_eq!(marker.ref_count(), 0, "destroying a placed marker");

        for root in marker.node_ids() {
            if let Some(ids) = self.roots.get_mut(root) {
                ids.remove(&marker_id);
                if ids.is_empty() {
                    self.roots.remove(root);
                }
            }
        }
        self.missing.retain(|_, ids| {
            ids.shift_remove(&marker_id);
            !ids.is_empty()
        });

        for sub_id in &marker.subs {
            if let Some(sub) = self.subscriptions.get_mut(sub_id) {
                sub.markers.remove(&marker_id);
            }
        }
        tracing::debug!(%marker_id, "marker destroyed");
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    /// Look up a marker.
    pub fn marker(&self, marker_id: &MarkerId) -> Option<&Marker> {
        self.markers.get(marker_id)
    }

    /// Look up a subscription.
    pub fn subscription(&self, sub_id: &SubscriptionId) -> Option<&Subscription> {
        self.subscriptions.get(sub_id)
    }

    /// All subscription ids in ascending order.
    pub fn list_subscriptions(&self) -> Vec<SubscriptionId> {
        self.subscriptions.keys().copied().collect()
    }

    /// Describe the markers of a subscription.
    pub fn list_markers(&self, sub_id: &SubscriptionId) -> Result<Vec<MarkerInfo>> {
        let sub = self
            .subscriptions
            .get(sub_id)
            .ok_or(Error::SubscriptionNotFound(*sub_id))?;
        Ok(sub
            .markers()
            .filter_map(|id| self.markers.get(&id))
            .map(MarkerInfo::from)
            .collect())
    }

    /// Describe one marker.
    pub fn marker_info(&self, marker_id: &MarkerId) -> Result<MarkerInfo> {
        self.markers
            .get(marker_id)
            .map(MarkerInfo::from)
            .ok_or(Error::MarkerNotFound(*marker_id))
    }

    /// Number of registered markers.
    pub fn marker_count(&self) -> usize {
        self.markers.len()
    }

    /// Ids of the detached markers.
    pub fn detached_markers(&self) -> Vec<MarkerId> {
        self.detached.ids().collect()
    }

    /// Accessors that missing-accessor markers are waiting for.
    pub fn missing_accessors(&self) -> Vec<String> {
        self.missing.keys().cloned().collect()
    }

    /// Ids of the markers placed on a node.
    pub fn node_markers(&self, graph: &dyn Graph, node_id: &NodeId) -> Result<Vec<MarkerId>> {
        graph
            .markers(node_id)
            .map(|set| set.ids().collect())
            .ok_or(Error::NodeNotFound(*node_id))
    }
}

impl std::fmt::Debug for SubscriptionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionEngine")
            .field("subscriptions", &self.subscriptions.len())
            .field("markers", &self.markers.len())
            .field("detached", &self.detached.len())
            .field("missing", &self.missing.len())
            .field("deferred", &self.deferred.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;
    use crate::subscriptions::{Action, FieldList, RecordingSink};

    fn engine() -> SubscriptionEngine {
        SubscriptionEngine::with_sink(RecordingSink::new())
    }

    fn node_spec(id: u64) -> MarkerSpec {
        MarkerSpec::new(MarkerId(id), Direction::Node, [NodeId::from("a")])
    }

    #[test]
    fn create_subscription_twice_fails() {
        let mut engine = engine();
        engine.create_subscription(SubscriptionId(1)).unwrap();
        let err = engine.create_subscription(SubscriptionId(1)).unwrap_err();
        assert_eq!(err, Error::SubscriptionExists(SubscriptionId(1)));
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut engine = engine();
        let sub = SubscriptionId(1);
        assert_eq!(engine.upsert_marker(sub, node_spec(7)).unwrap(), UpsertOutcome::Created);
        assert_eq!(
            engine.upsert_marker(sub, node_spec(7)).unwrap(),
            UpsertOutcome::AlreadySubscribed
        );
        assert_eq!(
            engine.upsert_marker(SubscriptionId(2), node_spec(7)).unwrap(),
            UpsertOutcome::Linked
        );
        let marker = engine.marker(&MarkerId(7)).unwrap();
        assert_eq!(marker.subs().collect::<Vec<_>>(), [SubscriptionId(1), SubscriptionId(2)]);
    }

    #[test]
    fn new_marker_rejects_duplicates() {
        let mut engine = engine();
        engine.upsert_marker(SubscriptionId(1), node_spec(7)).unwrap();
        assert_eq!(
            engine.new_marker(node_spec(7)).unwrap_err(),
            Error::MarkerExists(MarkerId(7))
        );
    }

    #[test]
    fn trigger_exclusivity() {
        let engine = engine();
        let spec = node_spec(1).flags(MarkerFlags::TRIGGER);
        assert!(matches!(engine.new_marker(spec), Err(Error::InvalidArgument(_))));

        let spec = MarkerSpec::new(MarkerId(2), Direction::Node, []);
        assert!(matches!(engine.new_marker(spec), Err(Error::InvalidArgument(_))));

        let spec = MarkerSpec::trigger(MarkerId(3), TriggerEvent::Deleted);
        let marker = engine.new_marker(spec).unwrap();
        assert!(marker.flags().contains(MarkerFlags::TRIGGER | MarkerFlags::DETACH));
    }

    #[test]
    fn missing_markers_cannot_watch_fields() {
        let engine = engine();
        let spec = MarkerSpec::new(MarkerId(1), Direction::None, [])
            .flags(MarkerFlags::MISSING)
            .fields(FieldList::new(["title"]));
        assert!(matches!(engine.new_marker(spec), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn field_list_implies_ch_field() {
        let engine = engine();
        let marker = engine
            .new_marker(node_spec(1).fields(FieldList::new(["title"])))
            .unwrap();
        assert!(marker.flags().contains(MarkerFlags::CH_FIELD));
    }

    #[test]
    fn placement_actions_are_not_marker_actions() {
        let engine = engine();
        let spec = node_spec(1).action(Action::SetOnNode);
        assert!(matches!(engine.new_marker(spec), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn node_id_limit() {
        let config = EngineConfig {
            max_node_ids_per_marker: 1,
            ..EngineConfig::default()
        };
        let engine = SubscriptionEngine::new(config, Box::new(RecordingSink::new())).unwrap();
        let spec = MarkerSpec::new(
            MarkerId(1),
            Direction::Node,
            [NodeId::from("a"), NodeId::from("b")],
        );
        assert!(matches!(engine.new_marker(spec), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn deleting_last_link_destroys_marker() {
        let mut engine = engine();
        let mut graph = MemoryGraph::new();
        engine.upsert_marker(SubscriptionId(1), node_spec(7)).unwrap();

        engine.delete_marker(&mut graph, SubscriptionId(1), MarkerId(7)).unwrap();
        assert!(engine.marker(&MarkerId(7)).is_none());
        assert!(engine.subscription(&SubscriptionId(1)).is_none());
        assert!(engine.roots.is_empty());
    }

    #[test]
    fn delete_errors() {
        let mut engine = engine();
        let mut graph = MemoryGraph::new();
        let err = engine
            .delete_marker(&mut graph, SubscriptionId(1), MarkerId(7))
            .unwrap_err();
        assert!(err.is_not_found());

        engine.upsert_marker(SubscriptionId(1), node_spec(7)).unwrap();
        let err = engine
            .delete_marker(&mut graph, SubscriptionId(1), MarkerId(8))
            .unwrap_err();
        assert_eq!(err, Error::MarkerNotFound(MarkerId(8)));

        let err = engine
            .delete_subscription(&mut graph, SubscriptionId(9))
            .unwrap_err();
        assert_eq!(err, Error::SubscriptionNotFound(SubscriptionId(9)));
    }

    #[test]
    fn broadcast_engine_uses_configured_capacity() {
        let config = EngineConfig::from_json(r#"{"broadcast_capacity": 2}"#).unwrap();
        let (mut engine, mut rx) = SubscriptionEngine::with_broadcast(config).unwrap();
        engine.upsert_marker(SubscriptionId(1), node_spec(3)).unwrap();
        engine.defer_event(MarkerId(3), MarkerFlags::CH_FIELD);
        engine.send_deferred_events();

        let payload = rx.try_recv().unwrap();
        let event = crate::subscriptions::MarkerEvent::decode(&payload).unwrap();
        assert_eq!(event.marker_id, MarkerId(3));
        assert_eq!(event.sub_ids, [SubscriptionId(1)]);
    }

    #[test]
    fn marker_info_describes_marker() {
        let mut engine = engine();
        engine
            .upsert_marker(
                SubscriptionId(4),
                node_spec(9).flags(MarkerFlags::CH_HIERARCHY),
            )
            .unwrap();
        let info = engine.marker_info(&MarkerId(9)).unwrap();
        assert_eq!(info.flags, ["hierarchy"]);
        assert_eq!(info.node_ids, [NodeId::from("a")]);
        assert_eq!(info.subs, [SubscriptionId(4)]);
        assert_eq!(info.ref_count, 0);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["dir"], "node");
        assert_eq!(json["node_ids"][0], "a");
    }
}
