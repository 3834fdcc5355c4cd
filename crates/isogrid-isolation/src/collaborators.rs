//! Contracts for the systems the orchestrator drives but does not own.
//!
//! Every collaborator is an async trait object returning `anyhow::Result`;
//! failures surface as [`IsolationError::Collaborator`](crate::IsolationError)
//! unless the call site treats them as best-effort.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use isogrid_state::{BuildRef, GithubId, Instance, InstanceId, IsolationId, Owner};

/// The user an operation acts on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub github_id: GithubId,
    pub username: String,
    /// Organizations the user belongs to.
    #[serde(default)]
    pub org_ids: Vec<GithubId>,
}

/// Asynchronous follow-up work handed to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum QueueMessage {
    RedeployInstance {
        instance_id: InstanceId,
        triggered_by: GithubId,
    },
    RedeployIsolation {
        isolation_id: IsolationId,
    },
    DeleteInstance {
        instance_id: InstanceId,
    },
    KillInstance {
        instance_id: InstanceId,
        container_id: String,
    },
}

impl QueueMessage {
    /// Wire name of the message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            QueueMessage::RedeployInstance { .. } => "redeploy-instance",
            QueueMessage::RedeployIsolation { .. } => "redeploy-isolation",
            QueueMessage::DeleteInstance { .. } => "delete-instance",
            QueueMessage::KillInstance { .. } => "kill-instance",
        }
    }
}

/// Why an instance-changed event is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateReason {
    Isolation,
    Deisolation,
    Update,
}

impl UpdateReason {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateReason::Isolation => "isolation",
            UpdateReason::Deisolation => "deisolation",
            UpdateReason::Update => "update",
        }
    }
}

impl std::fmt::Display for UpdateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Latest commit sha on `branch` of `repo` (`org/repo`).
    async fn get_branch(&self, repo: &str, branch: &str) -> anyhow::Result<String>;
}

#[async_trait]
pub trait BuildSubsystem: Send + Sync {
    /// Build `repo` at `commit` with `source`'s build configuration.
    async fn build_from_commit(
        &self,
        source: &Instance,
        repo: &str,
        commit: &str,
    ) -> anyhow::Result<BuildRef>;

    /// Reuse `source`'s current build as-is.
    async fn copy_build(&self, source: &Instance) -> anyhow::Result<BuildRef>;
}

/// Fire-and-forget publish; delivery guarantees belong to the queue.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, message: QueueMessage) -> anyhow::Result<()>;
}

/// Best-effort instance-changed events.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn instance_updated(
        &self,
        instance: &Instance,
        reason: UpdateReason,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Permissions: Send + Sync {
    async fn is_owner_of(&self, user: &SessionUser, owner: &Owner) -> anyhow::Result<bool>;
}

/// Locally known users.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_github_id(&self, github_id: GithubId) -> anyhow::Result<Option<SessionUser>>;
}

/// Every collaborator the orchestrator needs, shared across tasks.
#[derive(Clone)]
pub struct Collaborators {
    pub source_control: Arc<dyn SourceControl>,
    pub builds: Arc<dyn BuildSubsystem>,
    pub queue: Arc<dyn MessageQueue>,
    pub notifier: Arc<dyn Notifier>,
    pub permissions: Arc<dyn Permissions>,
    pub users: Arc<dyn UserDirectory>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_messages_are_tagged_by_kind() {
        let message = QueueMessage::DeleteInstance {
            instance_id: "i1".to_string(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["kind"], "delete-instance");
        assert_eq!(json["instance_id"], "i1");
        assert_eq!(message.kind(), "delete-instance");

        let parsed: QueueMessage =
            serde_json::from_str(r#"{"kind":"redeploy-isolation","isolation_id":"iso"}"#).unwrap();
        assert_eq!(parsed.kind(), "redeploy-isolation");
    }
}
