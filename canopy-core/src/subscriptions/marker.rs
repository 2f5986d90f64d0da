//! Markers
//!
//! A marker is the unit of watching. Its root node ids are fixed at creation;
//! everything else is configured through [`MarkerSpec`] before the marker is
//! first placed on the graph.

use std::collections::BTreeSet;

use indexmap::IndexSet;
use smallvec::SmallVec;

use super::{Action, MarkerFlags, MarkerId, SubscriptionId, TriggerEvent};
use crate::expression::Filter;
use crate::graph::{Direction, NodeId, Traversal};

/// What a marker is anchored on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerTarget {
    /// Root node ids the traversal starts from. Empty only for missing-accessor markers.
    Nodes(SmallVec<[NodeId; 2]>),
    /// Lifecycle event of a trigger marker.
    Trigger(TriggerEvent),
}

/// Field-name match list.
///
/// Entries match a changed field exactly, as a dotted prefix (`a` matches
/// `a.b`), or through a trailing wildcard (`a.*`, `*`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldList(Vec<String>);

impl FieldList {
    /// Build from individual names, dropping empty ones.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            fields
                .into_iter()
                .map(Into::into)
                .filter(|f: &String| !f.is_empty())
                .collect(),
        )
    }

    /// Parse a newline or nul separated list.
    pub fn parse(text: &str) -> Self {
        Self::new(text.split(['\n', '\0']))
    }

    /// The entries.
    pub fn names(&self) -> &[String] {
        &self.0
    }

    /// Total byte length of all entries.
    pub fn byte_len(&self) -> usize {
        self.0.iter().map(String::len).sum()
    }

    /// True if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Does a change to `field` concern this list?
    pub fn matches(&self, field: &str) -> bool {
        let field = base_field_name(field);
        self.0.iter().any(|entry| entry_matches(entry, field))
    }
}

fn entry_matches(entry: &str, field: &str) -> bool {
    if entry == "*" || entry == field {
        return true;
    }
    let prefix = entry.strip_suffix(".*").unwrap_or(entry);
    field
        .strip_prefix(prefix)
        .map_or(false, |rest| rest.starts_with('.'))
}

/// Strip array indexing: `tags[3]` and `tags[3].name` both become `tags`.
pub(crate) fn base_field_name(field: &str) -> &str {
    match field.find('[') {
        Some(pos) => &field[..pos],
        None => field,
    }
}

/// Per-marker evaluation state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct History {
    /// Filter result recorded by the last precheck.
    pub result: bool,
    /// Node the precheck ran against.
    pub node_id: Option<NodeId>,
    /// Flags merged by deferred events not yet sent.
    pub flags: MarkerFlags,
}

/// Creation parameters for a marker.
#[derive(Debug, Clone)]
pub struct MarkerSpec {
    /// Marker id.
    pub id: MarkerId,
    /// Flags requested by the client.
    pub flags: MarkerFlags,
    /// Traversal direction.
    pub dir: Direction,
    /// Root node ids.
    pub node_ids: Vec<NodeId>,
    /// Lifecycle event for trigger markers.
    pub trigger: Option<TriggerEvent>,
    /// Anchoring field for field directions.
    pub ref_field: Option<String>,
    /// Field selector for expression directions.
    pub traversal_expression: Option<Filter>,
    /// Filter predicate.
    pub filter: Option<Filter>,
    /// Field match list.
    pub fields: Option<FieldList>,
    /// Firing action.
    pub action: Action,
}

impl MarkerSpec {
    /// A marker watching `node_ids` in direction `dir`.
    pub fn new<I>(id: MarkerId, dir: Direction, node_ids: I) -> Self
    where
        I: IntoIterator<Item = NodeId>,
    {
        Self {
            id,
            flags: MarkerFlags::NONE,
            dir,
            node_ids: node_ids.into_iter().collect(),
            trigger: None,
            ref_field: None,
            traversal_expression: None,
            filter: None,
            fields: None,
            action: Action::Defer,
        }
    }

    /// A detached trigger marker for a node lifecycle event.
    pub fn trigger(id: MarkerId, event: TriggerEvent) -> Self {
        let mut spec = Self::new(id, Direction::None, []);
        spec.flags = MarkerFlags::TRIGGER;
        spec.trigger = Some(event);
        spec
    }

    /// Add flags.
    pub fn flags(mut self, flags: MarkerFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Set the anchoring field.
    pub fn ref_field(mut self, field: impl Into<String>) -> Self {
        self.ref_field = Some(field.into());
        self
    }

    /// Set the traversal expression.
    pub fn traversal_expression(mut self, expression: Filter) -> Self {
        self.traversal_expression = Some(expression);
        self
    }

    /// Set the filter predicate.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Set the field match list. Implies `CH_FIELD`.
    pub fn fields(mut self, fields: FieldList) -> Self {
        self.fields = Some(fields);
        self
    }

    /// Set the firing action.
    pub fn action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }
}

/// A registered watch.
#[derive(Debug)]
pub struct Marker {
    pub(crate) id: MarkerId,
    pub(crate) flags: MarkerFlags,
    pub(crate) dir: Direction,
    pub(crate) target: MarkerTarget,
    pub(crate) ref_field: Option<String>,
    pub(crate) traversal_expression: Option<Filter>,
    pub(crate) filter: Option<Filter>,
    pub(crate) fields: Option<FieldList>,
    pub(crate) action: Action,
    pub(crate) history: History,

    /// Subscriptions referencing this marker.
    pub(crate) subs: BTreeSet<SubscriptionId>,

    /// Nodes whose local set holds this marker.
    pub(crate) placements: IndexSet<NodeId>,

    /// Whether the detached set holds this marker.
    pub(crate) detached: bool,
}

impl Marker {
    pub(crate) fn from_spec(spec: MarkerSpec, flags: MarkerFlags) -> Self {
        let target = match spec.trigger {
            Some(event) => MarkerTarget::Trigger(event),
            None => MarkerTarget::Nodes(spec.node_ids.into_iter().collect()),
        };
        Self {
            id: spec.id,
            flags,
            dir: spec.dir,
            target,
            ref_field: spec.ref_field,
            traversal_expression: spec.traversal_expression,
            filter: spec.filter,
            fields: spec.fields,
            action: spec.action,
            history: History::default(),
            subs: BTreeSet::new(),
            placements: IndexSet::new(),
            detached: false,
        }
    }

    /// Marker id.
    pub fn id(&self) -> MarkerId {
        self.id
    }

    /// Current flags.
    pub fn flags(&self) -> MarkerFlags {
        self.flags
    }

    /// Traversal direction.
    pub fn dir(&self) -> Direction {
        self.dir
    }

    /// Root node ids; empty for trigger markers.
    pub fn node_ids(&self) -> &[NodeId] {
        match &self.target {
            MarkerTarget::Nodes(ids) => ids,
            MarkerTarget::Trigger(_) => &[],
        }
    }

    /// Lifecycle event for trigger markers.
    pub fn trigger_event(&self) -> Option<TriggerEvent> {
        match self.target {
            MarkerTarget::Trigger(event) => Some(event),
            MarkerTarget::Nodes(_) => None,
        }
    }

    /// Anchoring field.
    pub fn ref_field(&self) -> Option<&str> {
        self.ref_field.as_deref()
    }

    /// Filter predicate.
    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    /// Field match list.
    pub fn fields(&self) -> Option<&FieldList> {
        self.fields.as_ref()
    }

    /// Firing action.
    pub fn action(&self) -> Action {
        self.action
    }

    /// Evaluation state.
    pub fn history(&self) -> &History {
        &self.history
    }

    /// Subscriptions referencing this marker.
    pub fn subs(&self) -> impl Iterator<Item = SubscriptionId> + '_ {
        self.subs.iter().copied()
    }

    /// Nodes whose local set holds this marker.
    pub fn placements(&self) -> impl Iterator<Item = &NodeId> + '_ {
        self.placements.iter()
    }

    /// Whether the detached set holds this marker.
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Number of marker sets holding this marker.
    pub fn ref_count(&self) -> usize {
        self.placements.len() + usize::from(self.detached)
    }

    /// Is `node_id` one of the roots?
    pub fn is_root(&self, node_id: &NodeId) -> bool {
        self.node_ids().contains(node_id)
    }

    /// Does a change to `field` match the field list? No list matches everything.
    pub fn fields_match(&self, field: &str) -> bool {
        self.fields.as_ref().map_or(true, |fields| fields.matches(field))
    }

    /// Whether this marker's own traversal follows `field`.
    ///
    /// A change to such a field changes the shape of the watched region
    /// rather than just a watched value.
    pub fn is_field_traversed(&self, field: &str) -> bool {
        let field = base_field_name(field);
        if self.dir.needs_ref_field() {
            return self.ref_field.as_deref() == Some(field);
        }
        if self.dir.needs_expression() {
            return self.traversal_expression.as_ref().map_or(false, |expr| {
                expr.expression
                    .referenced_fields()
                    .iter()
                    .any(|f| f == field)
            });
        }
        false
    }

    /// Traversal parameters for placement walks.
    pub(crate) fn traversal(&self) -> Traversal<'_> {
        Traversal {
            dir: self.dir,
            ref_field: self.ref_field.as_deref(),
            expression: self.traversal_expression.as_ref(),
        }
    }

    /// Whether the marker is kept in the detached set instead of on nodes.
    pub(crate) fn is_detached_kind(&self) -> bool {
        self.dir == Direction::None
            || self.flags.intersects(MarkerFlags::DETACH | MarkerFlags::TRIGGER)
    }
}
