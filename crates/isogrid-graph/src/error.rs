//! Dependency graph error types.

use thiserror::Error;

/// Errors that can occur while reading or mutating the graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("instance {id} is missing {field}")]
    MissingField { id: String, field: &'static str },

    #[error("instance {0} cannot depend on itself")]
    SelfDependency(String),

    #[error("state store error: {0}")]
    State(#[from] isogrid_state::StateError),
}

pub type GraphResult<T> = Result<T, GraphError>;
