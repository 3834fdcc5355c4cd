//! Auto-isolation trigger.
//!
//! When a push builds a new instance off a master, the master's
//! auto-isolation configuration (if any) names the dependencies to clone
//! alongside it. The new instance becomes the isolation master.

use serde::Serialize;
use tracing::{Instrument, info, info_span, warn};

use isogrid_state::{GithubId, Instance, InstanceId, IsolationId};

use crate::collaborators::SessionUser;
use crate::error::{IsolationError, IsolationResult};
use crate::request::IsolationRequest;
use crate::service::IsolationService;

/// What happened to one instance of a push batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Isolated {
        instance_id: InstanceId,
        isolation_id: IsolationId,
        children: usize,
    },
    Skipped {
        instance_id: InstanceId,
        reason: String,
    },
    Failed {
        instance_id: InstanceId,
        error: String,
    },
}

#[derive(Clone)]
pub struct AutoIsolationTrigger {
    service: IsolationService,
}

impl AutoIsolationTrigger {
    pub fn new(service: IsolationService) -> Self {
        Self { service }
    }

    /// Process instances created by a push, one at a time.
    ///
    /// A failure on one instance is reported in its outcome and does not
    /// stop the rest.
    pub async fn on_instances_created(
        &self,
        instance_ids: &[InstanceId],
        pusher: Option<GithubId>,
    ) -> Vec<TriggerOutcome> {
        let mut outcomes = Vec::with_capacity(instance_ids.len());
        for instance_id in instance_ids {
            let span = info_span!("auto_isolate", %instance_id);
            let outcome = match self
                .isolate_if_configured(instance_id, pusher)
                .instrument(span)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(%instance_id, error = %e, "auto-isolation failed");
                    TriggerOutcome::Failed {
                        instance_id: instance_id.clone(),
                        error: e.to_string(),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn isolate_if_configured(
        &self,
        instance_id: &str,
        pusher: Option<GithubId>,
    ) -> IsolationResult<TriggerOutcome> {
        let skipped = |reason: &str| {
            info!(reason, "auto-isolation skipped");
            Ok::<_, IsolationError>(TriggerOutcome::Skipped {
                instance_id: instance_id.to_string(),
                reason: reason.to_string(),
            })
        };

        let instance = self.service.require_instance(instance_id)?;
        let Some(parent_hash) = instance.parent.as_deref() else {
            return skipped("instance has no parent");
        };
        let Some(parent) = self.service.store.find_instance_by_short_hash(parent_hash)? else {
            return skipped("parent instance not found");
        };
        let Some(config) = self.service.store.get_auto_isolation_config(&parent.id)? else {
            return skipped("no auto-isolation configuration");
        };

        let request = IsolationRequest {
            master: instance.id.clone(),
            children: config.requested_dependencies.clone(),
            redeploy_on_killed: config.redeploy_on_killed,
        };
        let user = self.acting_user(&instance, pusher).await?;
        let created = self
            .service
            .create_isolation_and_emit_instance_updates(&request, &user)
            .await?;
        Ok(TriggerOutcome::Isolated {
            instance_id: instance.id,
            isolation_id: created.isolation.id,
            children: created.children.len(),
        })
    }

    /// The push author if known locally, else the instance's creator.
    async fn acting_user(
        &self,
        instance: &Instance,
        pusher: Option<GithubId>,
    ) -> IsolationResult<SessionUser> {
        let users = &self.service.collaborators.users;
        if let Some(github_id) = pusher {
            if let Some(user) = users.find_by_github_id(github_id).await? {
                return Ok(user);
            }
            info!(pusher = github_id, "push author unknown, falling back to creator");
        }
        users
            .find_by_github_id(instance.created_by)
            .await?
            .ok_or_else(|| IsolationError::NotFound(format!("user {}", instance.created_by)))
    }
}
