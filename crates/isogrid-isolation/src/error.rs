//! Isolation error types.

use thiserror::Error;

use isogrid_graph::GraphError;
use isogrid_state::{IsolationState, StateError};

/// Errors that can occur while creating, killing or deleting isolations.
#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("ambiguous: {0}")]
    Ambiguous(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("instance {0} is already part of an isolation")]
    AlreadyIsolated(String),

    #[error("isolation {id} is {actual}, expected {expected}")]
    InvalidState {
        id: String,
        actual: IsolationState,
        expected: IsolationState,
    },

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("dependency graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("collaborator error: {0}")]
    Collaborator(#[from] anyhow::Error),
}

impl IsolationError {
    /// Whether retrying the same call cannot succeed.
    pub fn is_terminal(&self) -> bool {
        match self {
            IsolationError::Validation(_)
            | IsolationError::NotFound(_)
            | IsolationError::Ambiguous(_)
            | IsolationError::AccessDenied(_)
            | IsolationError::AlreadyIsolated(_)
            | IsolationError::InvalidState { .. } => true,
            IsolationError::State(e) => state_is_terminal(e),
            IsolationError::Graph(GraphError::State(e)) => state_is_terminal(e),
            IsolationError::Graph(_) => true,
            IsolationError::Collaborator(_) => false,
        }
    }
}

fn state_is_terminal(e: &StateError) -> bool {
    matches!(e, StateError::NotFound(_) | StateError::Invariant(_))
}

pub type IsolationResult<T> = Result<T, IsolationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_categories() {
        assert!(IsolationError::Ambiguous("acme/api".into()).is_terminal());
        assert!(IsolationError::Graph(GraphError::InstanceNotFound("x".into())).is_terminal());
        assert!(IsolationError::State(StateError::NotFound("x".into())).is_terminal());
        assert!(!IsolationError::State(StateError::Transaction("busy".into())).is_terminal());
        assert!(!IsolationError::Collaborator(anyhow::anyhow!("queue down")).is_terminal());
    }
}
