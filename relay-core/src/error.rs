//! Kernel Errors
//!
//! Errors that surface to the caller of a launch or a graph operation.
//! Failures of effect handlers never appear here: they are converted into
//! `fail` settlements by the effect runtime.

use thiserror::Error;

use crate::graph::NodeId;

/// Boxed error returned by step functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the kernel.
#[derive(Debug, Error)]
pub enum KernelError {
    /// A step function in a node pipeline returned an error.
    #[error("step failed in node {node} ({name})")]
    Step {
        node: NodeId,
        name: String,
        #[source]
        source: BoxError,
    },

    /// A payload did not have the type the receiving node expects.
    #[error("payload type mismatch: expected {expected}")]
    PayloadType { expected: &'static str },

    /// A scope entry a step relies on is absent.
    #[error("scope entry `{key}` is missing")]
    MissingScope { key: &'static str },

    /// The node is not (or no longer) part of the graph.
    #[error("node {0} is not in the graph")]
    UnknownNode(NodeId),

    /// Derived stores only change through their source.
    #[error("derived store {0} cannot be written directly")]
    DerivedStore(NodeId),

    /// A single drain processed more updates than allowed.
    #[error("drain exceeded {limit} updates, the graph likely contains a cycle")]
    DrainLimit { limit: usize },

    /// An effect was configured without a handler.
    #[error("effect `{effect}` has no handler")]
    MissingHandler { effect: String },

    /// Kernel configuration could not be parsed.
    #[error("invalid kernel config: {0}")]
    Config(#[from] serde_json::Error),
}

/// Error returned by an awaited effect call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError<E> {
    /// The handler rejected; carries the rejection value.
    #[error("effect call failed: {0:?}")]
    Failed(E),

    /// The effect was disposed before the call settled.
    #[error("effect call was abandoned before it settled")]
    Abandoned,

    /// The handler panicked; carries the panic message.
    #[error("effect handler panicked: {0}")]
    Panicked(String),
}

impl<E> CallError<E> {
    /// The rejection value, if the handler rejected.
    pub fn into_failure(self) -> Option<E> {
        match self {
            Self::Failed(error) => Some(error),
            Self::Abandoned | Self::Panicked(_) => None,
        }
    }
}
