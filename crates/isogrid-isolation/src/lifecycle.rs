//! Isolation lifecycle: killing, quiescence detection and redeploy.
//!
//! An isolation is killed by moving it to `killing` and asking the container
//! subsystem to stop every member. Each container-state report is fed to the
//! [`LifecycleMonitor`]; once no member's container is running or stopping,
//! the group moves to `killed` and a `redeploy-isolation` message is queued.
//! The `killing → killed` step is a conditional update, so only one of
//! several racing reporters performs it.

use serde::Serialize;
use tracing::{Instrument, debug, info, info_span};

use isogrid_state::{
    ContainerRef, ContainerStatus, InstanceId, IsolationGroup, IsolationId, IsolationState,
};

use crate::collaborators::QueueMessage;
use crate::error::{IsolationError, IsolationResult};
use crate::service::IsolationService;

impl IsolationService {
    /// Transition `killing → killed` once every member has quiesced.
    ///
    /// Returns whether this call performed the transition. Nothing changes
    /// while `redeploy_on_killed` is off, the group is not `killing`, or any
    /// member container reports running/stopping.
    pub async fn redeploy_if_all_killed(&self, isolation_id: &str) -> IsolationResult<bool> {
        let Some(isolation) = self.store.get_isolation(isolation_id)? else {
            debug!(%isolation_id, "isolation gone, nothing to redeploy");
            return Ok(false);
        };
        if !isolation.redeploy_on_killed || isolation.state != IsolationState::Killing {
            debug!(
                %isolation_id,
                state = %isolation.state,
                redeploy_on_killed = isolation.redeploy_on_killed,
                "redeploy not armed"
            );
            return Ok(false);
        }

        let still_active = self
            .store
            .list_isolation_members(isolation_id)?
            .iter()
            .filter(|m| m.container.as_ref().is_some_and(|c| c.status.is_active()))
            .count();
        if still_active > 0 {
            debug!(%isolation_id, still_active, "members still running");
            return Ok(false);
        }

        let transitioned = self.store.update_isolation_if(
            isolation_id,
            |g| g.redeploy_on_killed && g.state == IsolationState::Killing,
            |g| g.state = IsolationState::Killed,
        )?;
        if transitioned.is_none() {
            debug!(%isolation_id, "another caller already transitioned the isolation");
            return Ok(false);
        }

        self.collaborators
            .queue
            .publish(QueueMessage::RedeployIsolation {
                isolation_id: isolation_id.to_string(),
            })
            .await?;
        info!(%isolation_id, "isolation killed, redeploy queued");
        Ok(true)
    }

    /// Start killing an active isolation.
    ///
    /// Stores `redeploy_on_killed`, queues a `kill-instance` message per
    /// member with a live container, then checks quiescence straight away
    /// in case nothing was running.
    pub async fn kill_isolation(
        &self,
        isolation_id: &str,
        redeploy_on_killed: bool,
    ) -> IsolationResult<IsolationGroup> {
        let span = info_span!("kill_isolation", %isolation_id, redeploy_on_killed);
        async {
            let updated = self.store.update_isolation_if(
                isolation_id,
                |g| g.state == IsolationState::Active,
                |g| {
                    g.state = IsolationState::Killing;
                    g.redeploy_on_killed = redeploy_on_killed;
                },
            )?;
            let Some(isolation) = updated else {
                return Err(self.unexpected_state(isolation_id, IsolationState::Active)?);
            };

            let messages = self
                .store
                .list_isolation_members(isolation_id)?
                .into_iter()
                .filter_map(|m| match m.container {
                    Some(c) if c.status.is_active() || c.status == ContainerStatus::Starting => {
                        Some(QueueMessage::KillInstance {
                            instance_id: m.id,
                            container_id: c.container_id,
                        })
                    }
                    _ => None,
                })
                .collect::<Vec<_>>();
            let killed = messages.len();
            self.publish_all(messages, &span).await?;
            info!(containers = killed, "isolation killing");

            self.redeploy_if_all_killed(isolation_id).await?;
            Ok::<_, IsolationError>(self.store.get_isolation(isolation_id)?.unwrap_or(isolation))
        }
        .instrument(span.clone())
        .await
    }

    /// Return a redeployed isolation to `active` (`killed → active`).
    pub async fn complete_redeploy(&self, isolation_id: &str) -> IsolationResult<IsolationGroup> {
        let updated = self.store.update_isolation_if(
            isolation_id,
            |g| g.state == IsolationState::Killed,
            |g| g.state = IsolationState::Active,
        )?;
        match updated {
            Some(isolation) => {
                info!(%isolation_id, "isolation redeployed");
                Ok(isolation)
            }
            None => Err(self.unexpected_state(isolation_id, IsolationState::Killed)?),
        }
    }

    /// Whether the isolation's master is a testing instance.
    pub async fn is_testing_isolation(&self, isolation_id: &str) -> IsolationResult<bool> {
        Ok(self
            .store
            .find_isolation_master(isolation_id)?
            .is_some_and(|m| m.is_testing))
    }

    /// Build the error for a conditional update that did not apply.
    fn unexpected_state(
        &self,
        isolation_id: &str,
        expected: IsolationState,
    ) -> IsolationResult<IsolationError> {
        Ok(match self.store.get_isolation(isolation_id)? {
            Some(current) => IsolationError::InvalidState {
                id: isolation_id.to_string(),
                actual: current.state,
                expected,
            },
            None => IsolationError::NotFound(format!("isolation {isolation_id}")),
        })
    }
}

/// Outcome of one container-state report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerStateOutcome {
    pub instance_id: InstanceId,
    pub isolation_id: Option<IsolationId>,
    /// Whether this report moved the isolation to `killed`.
    pub redeployed: bool,
}

/// Feeds container-state reports into the isolation state machine.
#[derive(Clone)]
pub struct LifecycleMonitor {
    service: IsolationService,
}

impl LifecycleMonitor {
    pub fn new(service: IsolationService) -> Self {
        Self { service }
    }

    /// Record a container status and check the owning isolation for
    /// quiescence when the container went down.
    pub async fn on_container_state(
        &self,
        instance_id: &str,
        container_id: &str,
        status: ContainerStatus,
    ) -> IsolationResult<ContainerStateOutcome> {
        let instance = self
            .service
            .store
            .update_instance(instance_id, |i| {
                i.container = Some(ContainerRef {
                    container_id: container_id.to_string(),
                    status,
                });
            })?
            .ok_or_else(|| IsolationError::NotFound(format!("instance {instance_id}")))?;
        debug!(%instance_id, ?status, "container state recorded");

        let redeployed = match &instance.isolated {
            Some(isolation_id) if !status.is_active() => {
                self.service.redeploy_if_all_killed(isolation_id).await?
            }
            _ => false,
        };
        Ok(ContainerStateOutcome {
            instance_id: instance.id,
            isolation_id: instance.isolated,
            redeployed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use isogrid_core::HostnameScheme;
    use isogrid_graph::{DependencyGraph, DnsCache};
    use isogrid_state::{Instance, Owner, StateStore};

    use crate::collaborators::Collaborators;
    use crate::local::*;

    fn owner() -> Owner {
        Owner {
            github_id: 7,
            username: "acme".to_string(),
        }
    }

    fn setup() -> (StateStore, MemoryQueue, IsolationService) {
        let store = StateStore::open_in_memory().unwrap();
        let queue = MemoryQueue::new();
        let graph = DependencyGraph::new(
            store.clone(),
            HostnameScheme::new("isogrid.local").unwrap(),
            DnsCache::new(),
        );
        let collaborators = Collaborators {
            source_control: Arc::new(PinnedSourceControl::new(HashMap::new())),
            builds: Arc::new(LocalBuilds::new()),
            queue: Arc::new(queue.clone()),
            notifier: Arc::new(MemoryNotifier::new()),
            permissions: Arc::new(OwnerPermissions),
            users: Arc::new(MemoryUsers::default()),
        };
        let service = IsolationService::new(store.clone(), graph, collaborators);
        (store, queue, service)
    }

    fn seed_group(store: &StateStore, state: IsolationState, statuses: &[ContainerStatus]) {
        store
            .put_isolation(&IsolationGroup {
                id: "iso".to_string(),
                master_instance_id: "m".to_string(),
                owner: owner(),
                created_by: 7,
                redeploy_on_killed: true,
                state,
                created_at: 1,
                updated_at: 1,
            })
            .unwrap();
        for (n, status) in statuses.iter().enumerate() {
            let id = if n == 0 { "m".to_string() } else { format!("c{n}") };
            let mut inst = Instance::new(&id, &format!("h{n}"), &id, owner(), &format!("{id}.isogrid.local"));
            inst.isolated = Some("iso".to_string());
            inst.is_isolation_group_master = n == 0;
            inst.container = Some(ContainerRef {
                container_id: format!("ctr-{id}"),
                status: *status,
            });
            store.put_instance(&inst).unwrap();
        }
    }

    #[tokio::test]
    async fn not_armed_when_active() {
        let (store, queue, service) = setup();
        seed_group(&store, IsolationState::Active, &[ContainerStatus::Exited]);
        assert!(!service.redeploy_if_all_killed("iso").await.unwrap());
        assert!(queue.messages().is_empty());
    }

    #[tokio::test]
    async fn missing_isolation_is_false() {
        let (_, _, service) = setup();
        assert!(!service.redeploy_if_all_killed("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn kill_with_nothing_running_transitions_immediately() {
        let (store, queue, service) = setup();
        seed_group(
            &store,
            IsolationState::Active,
            &[ContainerStatus::Exited, ContainerStatus::Dead],
        );

        let isolation = service.kill_isolation("iso", true).await.unwrap();
        assert_eq!(isolation.state, IsolationState::Killed);
        assert_eq!(queue.of_kind("kill-instance").len(), 0);
        assert_eq!(queue.of_kind("redeploy-isolation").len(), 1);
    }

    #[tokio::test]
    async fn kill_requires_active() {
        let (store, _, service) = setup();
        seed_group(&store, IsolationState::Killing, &[ContainerStatus::Running]);
        let err = service.kill_isolation("iso", true).await.unwrap_err();
        assert!(matches!(
            err,
            IsolationError::InvalidState {
                actual: IsolationState::Killing,
                ..
            }
        ));
        assert!(matches!(
            service.kill_isolation("ghost", true).await,
            Err(IsolationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn monitor_drives_killing_to_killed_then_redeploy_completes() {
        let (store, queue, service) = setup();
        seed_group(
            &store,
            IsolationState::Active,
            &[ContainerStatus::Running, ContainerStatus::Stopping],
        );
        let monitor = LifecycleMonitor::new(service.clone());

        let killing = service.kill_isolation("iso", true).await.unwrap();
        assert_eq!(killing.state, IsolationState::Killing);
        assert_eq!(queue.of_kind("kill-instance").len(), 2);

        let first = monitor
            .on_container_state("m", "ctr-m", ContainerStatus::Exited)
            .await
            .unwrap();
        assert!(!first.redeployed);

        let last = monitor
            .on_container_state("c1", "ctr-c1", ContainerStatus::Exited)
            .await
            .unwrap();
        assert!(last.redeployed);
        assert_eq!(last.isolation_id.as_deref(), Some("iso"));
        assert_eq!(queue.of_kind("redeploy-isolation").len(), 1);

        let active = service.complete_redeploy("iso").await.unwrap();
        assert_eq!(active.state, IsolationState::Active);
        assert!(service.complete_redeploy("iso").await.is_err());
    }

    #[tokio::test]
    async fn testing_isolation_follows_master_flag() {
        let (store, _, service) = setup();
        seed_group(&store, IsolationState::Active, &[ContainerStatus::Running]);
        assert!(!service.is_testing_isolation("iso").await.unwrap());

        store.update_instance("m", |i| i.is_testing = true).unwrap();
        assert!(service.is_testing_isolation("iso").await.unwrap());
        assert!(!service.is_testing_isolation("ghost").await.unwrap());
    }
}
