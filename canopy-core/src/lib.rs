//! Canopy Core
//!
//! This crate provides the subscription and change-notification engine of
//! the Canopy graph database. It implements:
//!
//! - Subscriptions and shared, deduplicated markers
//! - Traversal-aware marker placement on graph nodes
//! - Two-phase (precheck/commit) field change detection
//! - Deferred, coalesced event delivery at write boundaries
//! - Alias, missing-accessor and lifecycle trigger markers
//!
//! Graph storage, the predicate language and the network transport are
//! external collaborators. The crate defines their contracts as traits and
//! ships small reference implementations so the engine can be embedded and
//! tested on its own.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: the graph contract and an in-memory graph
//! - `expression`: the compiled predicate contract
//! - `subscriptions`: the engine itself and the event sinks
//! - `commands`: typed subscription commands for the protocol layer
//! - `write`: a write path pairing graph mutations with engine hooks
//!
//! # Example
//!
//! ```rust
//! use canopy_core::graph::{Direction, MemoryGraph, NodeId};
//! use canopy_core::subscriptions::{
//!     FieldList, MarkerId, MarkerSpec, RecordingSink, SubscriptionEngine, SubscriptionId,
//! };
//! use canopy_core::write::WriteTxn;
//!
//! let mut graph = MemoryGraph::new();
//! graph.create_node(NodeId::from("ma1"));
//!
//! let sink = RecordingSink::new();
//! let mut engine = SubscriptionEngine::with_sink(sink.clone());
//!
//! // Watch the title of ma1.
//! let spec = MarkerSpec::new(MarkerId(1), Direction::Node, [NodeId::from("ma1")])
//!     .fields(FieldList::new(["title"]));
//! engine.upsert_marker(SubscriptionId(1), spec).unwrap();
//! engine.refresh_marker(&mut graph, MarkerId(1)).unwrap();
//!
//! // Change it.
//! let mut txn = WriteTxn::new(&mut graph, &mut engine);
//! txn.set_field(&NodeId::from("ma1"), "title", "hello".into()).unwrap();
//! txn.commit();
//!
//! assert_eq!(sink.events()[0].sub_ids, [SubscriptionId(1)]);
//! ```

pub mod commands;
pub mod config;
pub mod error;
pub mod expression;
pub mod graph;
pub mod subscriptions;
pub mod write;

pub use config::EngineConfig;
pub use error::{Error, ErrorCode, Result};
