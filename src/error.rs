//! Engine error taxonomy.
//!
//! Evaluation failures propagate up the call stack that issued the request;
//! the cache and pool keep their own bookkeeping consistent on unwind.
//! Resource exhaustion is NOT an error: the pool returns `None` and callers
//! fall back to an unpooled path. Configuration inconsistencies (bad warp
//! keys, empty remap tables) are logged and degrade to passthrough instead
//! of surfacing here.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by graph evaluation
#[derive(Error, Debug)]
pub enum EvalError {
    /// A non-empty input unexpectedly produced nothing
    #[error("evaluation failed: node '{node_name}' produced no image for frame {frame}")]
    EvaluationFailed {
        node: Uuid,
        node_name: String,
        frame: i32,
    },

    /// Referenced node id is not in the graph
    #[error("unknown node {0}")]
    UnknownNode(Uuid),

    /// Media reader failed to produce samples
    #[error("media read failed: {0}")]
    MediaRead(#[from] crate::media::MediaError),

    /// A cache build claim was abandoned by another thread and could not be retried
    #[error("cache build abandoned for node {node} frame {frame}")]
    BuildAbandoned { node: Uuid, frame: i32 },

    /// No view node has been selected for top-level evaluation
    #[error("no view node set")]
    NoViewNode,
}

/// Errors from graph topology edits
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("unknown node {0}")]
    UnknownNode(Uuid),

    #[error("node '{name}' accepts at most {max} inputs, got {got}")]
    TooManyInputs { name: String, max: usize, got: usize },

    #[error("input list for '{name}' would create a cycle")]
    Cycle { name: String },

    #[error("unknown node type '{0}'")]
    UnknownType(String),
}

pub type EvalResult<T> = std::result::Result<T, EvalError>;
