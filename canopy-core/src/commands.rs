//! Subscription Commands
//!
//! Typed requests and replies for the subscription commands of the wire
//! protocol. Framing and dispatch belong to the protocol layer; this module
//! turns already decoded requests into engine calls and produces
//! serializable replies.
//!
//! Every command that can fire markers flushes the deferred queue before it
//! returns, since each command is a write boundary.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::expression::{ExpressionCompiler, Filter};
use crate::graph::{Direction, Graph, NodeId};
use crate::subscriptions::{
    Action, FieldList, MarkerFlags, MarkerId, MarkerInfo, MarkerSpec, SubscriptionEngine,
    SubscriptionId, TriggerEvent, UpsertOutcome,
};

/// Add a marker to a subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddMarkerRequest {
    pub sub_id: SubscriptionId,
    pub marker_id: MarkerId,
    pub dir: Direction,
    #[serde(default)]
    pub node_ids: Vec<NodeId>,
    /// Flag names, e.g. `["field", "hierarchy"]`.
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub ref_field: Option<String>,
    #[serde(default)]
    pub traversal_expression: Option<String>,
    #[serde(default)]
    pub filter: Option<String>,
    /// Registers for the filter expression.
    #[serde(default)]
    pub filter_args: Vec<String>,
    /// Newline separated field match list.
    #[serde(default)]
    pub fields: Option<String>,
    #[serde(default)]
    pub action: Action,
}

/// Add an alias marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddAliasMarkerRequest {
    pub sub_id: SubscriptionId,
    pub marker_id: MarkerId,
    pub alias: String,
}

/// Add a trigger marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTriggerMarkerRequest {
    pub sub_id: SubscriptionId,
    pub marker_id: MarkerId,
    pub event: TriggerEvent,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub filter_args: Vec<String>,
}

/// Add a missing-accessor marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddMissingRequest {
    pub sub_id: SubscriptionId,
    pub marker_id: MarkerId,
    pub accessors: Vec<String>,
}

/// Select what `debug` describes. All fields empty means the whole engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugRequest {
    #[serde(default)]
    pub sub_id: Option<SubscriptionId>,
    #[serde(default)]
    pub marker_id: Option<MarkerId>,
    #[serde(default)]
    pub node_id: Option<NodeId>,
}

/// Reply to the add commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddReply {
    pub marker_id: MarkerId,
    pub outcome: UpsertOutcome,
}

/// Protocol error reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReply {
    /// Errno-style code: `ENOENT`, `EEXIST`, `EINVAL` or `ENOTSUP`.
    pub code: &'static str,
    pub message: String,
}

impl From<&Error> for ErrorReply {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code().errno_name(),
            message: err.to_string(),
        }
    }
}

/// Executes subscription commands against one graph.
pub struct Commands<'a> {
    engine: &'a mut SubscriptionEngine,
    graph: &'a mut dyn Graph,
    compiler: &'a dyn ExpressionCompiler,
}

impl<'a> Commands<'a> {
    /// Bind an engine, its graph and the expression compiler.
    pub fn new(
        engine: &'a mut SubscriptionEngine,
        graph: &'a mut dyn Graph,
        compiler: &'a dyn ExpressionCompiler,
    ) -> Self {
        Self {
            engine,
            graph,
            compiler,
        }
    }

    fn compile_filter(&self, text: &str, args: Vec<String>) -> Result<Filter> {
        Ok(Filter::new(self.compiler.compile(text)?).with_registers(args))
    }

    /// `add-marker`
    pub fn add_marker(&mut self, req: AddMarkerRequest) -> Result<AddReply> {
        let mut flags = MarkerFlags::NONE;
        for name in &req.flags {
            flags |= MarkerFlags::from_name(name)
                .ok_or_else(|| Error::invalid(format!("unknown marker flag {name:?}")))?;
        }

        let mut spec = MarkerSpec::new(req.marker_id, req.dir, req.node_ids)
            .flags(flags)
            .action(req.action);
        if let Some(field) = req.ref_field {
            spec = spec.ref_field(field);
        }
        if let Some(text) = &req.traversal_expression {
            spec = spec.traversal_expression(self.compile_filter(text, Vec::new())?);
        }
        if let Some(text) = &req.filter {
            spec = spec.filter(self.compile_filter(text, req.filter_args)?);
        }
        if let Some(text) = &req.fields {
            spec = spec.fields(FieldList::parse(text));
        }

        let outcome = self.engine.upsert_marker(req.sub_id, spec)?;
        Ok(AddReply {
            marker_id: req.marker_id,
            outcome,
        })
    }

    /// `add-alias-marker`
    pub fn add_alias_marker(&mut self, req: AddAliasMarkerRequest) -> Result<AddReply> {
        let node_id = self
            .graph
            .resolve(&req.alias)
            .ok_or_else(|| Error::NodeNotFound(NodeId::from(req.alias.as_str())))?;
        let outcome = self
            .engine
            .add_alias_marker(req.sub_id, req.marker_id, &req.alias, node_id)?;
        Ok(AddReply {
            marker_id: req.marker_id,
            outcome,
        })
    }

    /// `add-trigger-marker`
    pub fn add_trigger_marker(&mut self, req: AddTriggerMarkerRequest) -> Result<AddReply> {
        let filter = match &req.filter {
            Some(text) => Some(self.compile_filter(text, req.filter_args)?),
            None => None,
        };
        let outcome = self
            .engine
            .add_trigger_marker(req.sub_id, req.marker_id, req.event, filter)?;
        Ok(AddReply {
            marker_id: req.marker_id,
            outcome,
        })
    }

    /// `add-missing`
    pub fn add_missing(&mut self, req: AddMissingRequest) -> Result<AddReply> {
        let outcome = self
            .engine
            .add_missing(req.sub_id, req.marker_id, req.accessors)?;
        Ok(AddReply {
            marker_id: req.marker_id,
            outcome,
        })
    }

    /// `delete-marker`
    pub fn delete_marker(&mut self, sub_id: SubscriptionId, marker_id: MarkerId) -> Result<()> {
        let result = self.engine.delete_marker(&mut *self.graph, sub_id, marker_id);
        self.engine.send_deferred_events();
        result
    }

    /// `delete-subscription`
    pub fn delete_subscription(&mut self, sub_id: SubscriptionId) -> Result<()> {
        let result = self.engine.delete_subscription(&mut *self.graph, sub_id);
        self.engine.send_deferred_events();
        result
    }

    /// `refresh`: re-place every marker of a subscription.
    pub fn refresh(&mut self, sub_id: SubscriptionId) -> Result<()> {
        let result = self.engine.refresh_subscription(&mut *self.graph, sub_id);
        self.engine.send_deferred_events();
        result
    }

    /// `refresh-marker`
    pub fn refresh_marker(&mut self, marker_id: MarkerId) -> Result<()> {
        let result = self.engine.refresh_marker(&mut *self.graph, marker_id);
        self.engine.send_deferred_events();
        result
    }

    /// `list`: all subscription ids.
    pub fn list(&self) -> Vec<SubscriptionId> {
        self.engine.list_subscriptions()
    }

    /// `list-markers`
    pub fn list_markers(&self, sub_id: SubscriptionId) -> Result<Vec<MarkerInfo>> {
        self.engine.list_markers(&sub_id)
    }

    /// `debug`: describe a subscription, a marker, a node's markers, or the
    /// whole engine.
    pub fn debug(&self, req: DebugRequest) -> Result<Value> {
        if let Some(sub_id) = req.sub_id {
            return to_json(&self.engine.list_markers(&sub_id)?);
        }
        if let Some(marker_id) = req.marker_id {
            return to_json(&self.engine.marker_info(&marker_id)?);
        }
        if let Some(node_id) = req.node_id {
            let infos: Vec<MarkerInfo> = self
                .engine
                .node_markers(&*self.graph, &node_id)?
                .iter()
                .filter_map(|id| self.engine.marker_info(id).ok())
                .collect();
            return to_json(&infos);
        }
        Ok(json!({
            "subscriptions": self.engine.list_subscriptions(),
            "markers": self.engine.marker_count(),
            "detached": self.engine.detached_markers(),
            "missing": self.engine.missing_accessors(),
            "pending": self.engine.pending_events().len(),
        }))
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::invalid(format!("debug output: {e}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::expression::{EvalContext, Expression};
    use crate::graph::MemoryGraph;
    use crate::subscriptions::RecordingSink;

    /// Understands `has <field>` only.
    struct HasField;

    struct HasExpr(String);

    impl Expression for HasExpr {
        fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<bool> {
            Ok(ctx.node.field(&self.0).is_some())
        }
    }

    impl ExpressionCompiler for HasField {
        fn compile(&self, text: &str) -> Result<Arc<dyn Expression>> {
            match text.strip_prefix("has ") {
                Some(field) => Ok(Arc::new(HasExpr(field.to_string()))),
                None => Err(Error::Expression(format!("cannot parse {text:?}"))),
            }
        }
    }

    fn request(json: Value) -> AddMarkerRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn add_marker_from_wire_request() {
        let mut graph = MemoryGraph::new();
        graph.create_node(NodeId::from("n"));
        let mut engine = SubscriptionEngine::with_sink(RecordingSink::new());
        let mut cmds = Commands::new(&mut engine, &mut graph, &HasField);

        let reply = cmds
            .add_marker(request(json!({
                "sub_id": 1,
                "marker_id": 42,
                "dir": "node",
                "node_ids": ["n"],
                "flags": ["hierarchy"],
                "filter": "has title",
                "fields": "title\nbody",
            })))
            .unwrap();
        assert_eq!(reply.outcome, UpsertOutcome::Created);
        cmds.refresh(SubscriptionId(1)).unwrap();

        let infos = cmds.list_markers(SubscriptionId(1)).unwrap();
        assert_eq!(infos[0].flags, ["hierarchy", "field"]);
        assert!(infos[0].has_filter);
        assert_eq!(infos[0].ref_count, 1);
        assert_eq!(cmds.list(), [SubscriptionId(1)]);
    }

    #[test]
    fn bad_requests_map_to_error_codes() {
        let mut graph = MemoryGraph::new();
        let mut engine = SubscriptionEngine::with_sink(RecordingSink::new());
        let mut cmds = Commands::new(&mut engine, &mut graph, &HasField);

        let err = cmds
            .add_marker(request(json!({
                "sub_id": 1, "marker_id": 1, "dir": "node", "node_ids": ["n"],
                "flags": ["sideways"],
            })))
            .unwrap_err();
        assert_eq!(ErrorReply::from(&err).code, "EINVAL");

        let err = cmds
            .add_marker(request(json!({
                "sub_id": 1, "marker_id": 1, "dir": "node", "node_ids": ["n"],
                "filter": "title > 3",
            })))
            .unwrap_err();
        assert_eq!(ErrorReply::from(&err).code, "EINVAL");

        let err = cmds.delete_subscription(SubscriptionId(3)).unwrap_err();
        assert_eq!(ErrorReply::from(&err).code, "ENOENT");
    }

    #[test]
    fn alias_marker_needs_existing_alias() {
        let mut graph = MemoryGraph::new();
        graph.create_node(NodeId::from("n"));
        graph.set_alias(&NodeId::from("n"), "home").unwrap();
        let mut engine = SubscriptionEngine::with_sink(RecordingSink::new());
        let mut cmds = Commands::new(&mut engine, &mut graph, &HasField);

        let req = AddAliasMarkerRequest {
            sub_id: SubscriptionId(1),
            marker_id: MarkerId(2),
            alias: "home".into(),
        };
        assert_eq!(cmds.add_alias_marker(req).unwrap().outcome, UpsertOutcome::Created);

        let req = AddAliasMarkerRequest {
            sub_id: SubscriptionId(1),
            marker_id: MarkerId(3),
            alias: "away".into(),
        };
        assert!(cmds.add_alias_marker(req).unwrap_err().is_not_found());
    }

    #[test]
    fn debug_describes_engine() {
        let mut graph = MemoryGraph::new();
        let mut engine = SubscriptionEngine::with_sink(RecordingSink::new());
        let mut cmds = Commands::new(&mut engine, &mut graph, &HasField);
        cmds.add_missing(AddMissingRequest {
            sub_id: SubscriptionId(7),
            marker_id: MarkerId(70),
            accessors: vec!["later".into()],
        })
        .unwrap();
        cmds.add_trigger_marker(AddTriggerMarkerRequest {
            sub_id: SubscriptionId(7),
            marker_id: MarkerId(71),
            event: TriggerEvent::Created,
            filter: Some("has title".into()),
            filter_args: Vec::new(),
        })
        .unwrap();
        cmds.refresh_marker(MarkerId(71)).unwrap();

        let summary = cmds.debug(DebugRequest::default()).unwrap();
        assert_eq!(summary["subscriptions"], json!([7]));
        assert_eq!(summary["missing"], json!(["later"]));
        assert_eq!(summary["detached"], json!([71]));

        let marker = cmds
            .debug(DebugRequest {
                marker_id: Some(MarkerId(71)),
                ..DebugRequest::default()
            })
            .unwrap();
        assert_eq!(marker["trigger"], "created");
        assert_eq!(marker["ref_count"], 1);

        let root = cmds
            .debug(DebugRequest {
                node_id: Some(NodeId::ROOT),
                ..DebugRequest::default()
            })
            .unwrap();
        assert_eq!(root, json!([]));
    }
}
