//! Dependency Graph
//!
//! This module implements the graph that updates travel through.
//!
//! # Overview
//!
//! - Nodes carry an ordered pipeline of steps, a scope, metadata tags and
//!   ownership links.
//! - Edges run from a node to the downstream nodes (`next`) that receive its
//!   output once its pipeline completes.
//! - Ownership links form a tree: disposing a node disposes everything it
//!   owns.
//!
//! The graph is indexed by node ID for O(1) lookups, and both edge
//! directions are kept so disposal can detach a node from its neighbours.

mod node;
mod registry;
mod scope;
mod step;

pub use node::{FxRole, Node, NodeBuilder, NodeId, NodeMeta, NodeOp, NodeRef, UnitKind};
pub use registry::{ForkMap, Graph};
pub use scope::Scope;
pub use step::{downcast, payload, run_pipeline, FilterFn, Flow, Payload, Step, StepContext, StepFn};
