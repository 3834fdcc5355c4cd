//! Isolation orchestrator.
//!
//! Drives an isolation group through `absent → active → killing → killed →
//! absent`. Multi-entity changes are ordered single-document writes; a crash
//! part-way leaves partial state that later reconciliation re-derives from
//! the instances themselves.

use futures::future::join_all;
use serde::Serialize;
use tracing::{Instrument, Span, debug, info, info_span, warn};
use uuid::Uuid;

use isogrid_graph::{DependencyGraph, EdgeDiff, RewireReport};
use isogrid_state::{Instance, IsolationGroup, IsolationState, StateStore, epoch_secs};

use crate::collaborators::{Collaborators, QueueMessage, SessionUser, UpdateReason};
use crate::error::{IsolationError, IsolationResult};
use crate::fork::{ForkContext, ForkEngine};
use crate::request::IsolationRequest;

/// Result of a successful create.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedIsolation {
    pub isolation: IsolationGroup,
    pub master: Instance,
    pub children: Vec<Instance>,
    pub edges: EdgeDiff,
}

#[derive(Clone)]
pub struct IsolationService {
    pub(crate) store: StateStore,
    pub(crate) graph: DependencyGraph,
    pub(crate) forks: ForkEngine,
    pub(crate) collaborators: Collaborators,
}

impl IsolationService {
    pub fn new(store: StateStore, graph: DependencyGraph, collaborators: Collaborators) -> Self {
        let forks = ForkEngine::new(
            store.clone(),
            graph.scheme().clone(),
            collaborators.source_control.clone(),
            collaborators.builds.clone(),
        );
        Self {
            store,
            graph,
            forks,
            collaborators,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn forks(&self) -> &ForkEngine {
        &self.forks
    }

    // ── Create ─────────────────────────────────────────────────────

    /// Create an isolation group around `request.master` and fork every
    /// requested child into it.
    ///
    /// Validation, lookup, forking and graph wiring failures abort and
    /// propagate. Notifications are best-effort. On success a
    /// `redeploy-instance` message is queued for the master.
    pub async fn create_isolation_and_emit_instance_updates(
        &self,
        request: &IsolationRequest,
        user: &SessionUser,
    ) -> IsolationResult<CreatedIsolation> {
        let span = info_span!(
            "create_isolation",
            master_id = %request.master,
            user = user.github_id,
            isolation_id = tracing::field::Empty,
        );
        self.create_and_emit_in(request, user, &span)
            .instrument(span.clone())
            .await
    }

    async fn create_and_emit_in(
        &self,
        request: &IsolationRequest,
        user: &SessionUser,
        span: &Span,
    ) -> IsolationResult<CreatedIsolation> {
        let created = self.create_isolation(request, user, span).await?;
        let mut members = Vec::with_capacity(created.children.len() + 1);
        members.push(created.master.clone());
        members.extend(created.children.iter().cloned());
        self.notify_all(&members, UpdateReason::Isolation, span).await;

        self.collaborators
            .queue
            .publish(QueueMessage::RedeployInstance {
                instance_id: created.master.id.clone(),
                triggered_by: user.github_id,
            })
            .await?;
        info!(
            children = created.children.len(),
            edges_added = created.edges.added.len(),
            edges_removed = created.edges.removed.len(),
            "isolation created"
        );
        Ok(created)
    }

    async fn create_isolation(
        &self,
        request: &IsolationRequest,
        user: &SessionUser,
        span: &Span,
    ) -> IsolationResult<CreatedIsolation> {
        request.validate()?;

        let master = self
            .store
            .get_instance(&request.master)?
            .ok_or_else(|| IsolationError::NotFound(format!("instance {}", request.master)))?;
        if master.isolated.is_some() {
            return Err(IsolationError::AlreadyIsolated(master.id));
        }
        let plan = request.plan(master.branch.as_deref())?;

        let now = epoch_secs();
        let isolation = IsolationGroup {
            id: Uuid::new_v4().to_string(),
            master_instance_id: master.id.clone(),
            owner: master.owner.clone(),
            created_by: user.github_id,
            redeploy_on_killed: request.redeploy_on_killed,
            state: IsolationState::Active,
            created_at: now,
            updated_at: now,
        };
        span.record("isolation_id", isolation.id.as_str());
        self.store.put_isolation(&isolation)?;
        let master = self.flag_master(&master.id, &isolation.id)?;

        let ctx = ForkContext {
            master_short_hash: &master.short_hash,
            isolation_id: &isolation.id,
            user,
        };
        let non_repo = join_all(plan.non_repo.iter().map(|source| {
            self.forks
                .fork_non_repo_child(source, &ctx)
                .instrument(info_span!(parent: span, "fork_non_repo_child", %source))
        }));
        let repo = join_all(plan.repo.iter().map(|child| {
            self.forks
                .fork_repo_child(child, &ctx)
                .instrument(info_span!(parent: span, "fork_repo_child", branch = %child.branch))
        }));
        let (non_repo, repo) = tokio::join!(non_repo, repo);
        let children = settle(non_repo.into_iter().chain(repo), "fork child")?;

        let mut members = Vec::with_capacity(children.len() + 1);
        members.push(master.id.clone());
        members.extend(children.iter().map(|c| c.id.clone()));
        let edges = self.graph.match_group_membership(&members)?;

        let master = self.require_instance(&master.id)?;
        let children = children
            .iter()
            .map(|c| self.require_instance(&c.id))
            .collect::<IsolationResult<Vec<_>>>()?;
        Ok(CreatedIsolation {
            isolation,
            master,
            children,
            edges,
        })
    }

    /// Mark the master isolated-as-master unless a concurrent create beat us.
    fn flag_master(&self, master_id: &str, isolation_id: &str) -> IsolationResult<Instance> {
        let mut raced = false;
        let updated = self.store.update_instance(master_id, |i| {
            if i.isolated.is_some() {
                raced = true;
                return;
            }
            i.isolated = Some(isolation_id.to_string());
            i.is_isolation_group_master = true;
        })?;
        match updated {
            Some(master) if !raced => Ok(master),
            Some(_) => {
                self.store.delete_isolation(isolation_id)?;
                Err(IsolationError::AlreadyIsolated(master_id.to_string()))
            }
            None => {
                self.store.delete_isolation(isolation_id)?;
                Err(IsolationError::NotFound(format!("instance {master_id}")))
            }
        }
    }

    // ── Delete ─────────────────────────────────────────────────────

    /// Tear down an isolation group. Returns the de-isolated master.
    ///
    /// Children are not deleted here; one `delete-instance` message is queued
    /// per child and the deletion happens out-of-band.
    pub async fn delete_isolation(&self, isolation_id: &str) -> IsolationResult<Instance> {
        let span = info_span!("delete_isolation", %isolation_id, master_id = tracing::field::Empty);
        self.delete_isolation_in(isolation_id, &span)
            .instrument(span.clone())
            .await
    }

    async fn delete_isolation_in(&self, isolation_id: &str, span: &Span) -> IsolationResult<Instance> {
        let master = self
            .store
            .find_isolation_master(isolation_id)?
            .ok_or_else(|| IsolationError::NotFound(format!("master of isolation {isolation_id}")))?;
        span.record("master_id", master.id.as_str());

        let master = self
            .store
            .update_instance(&master.id, Instance::deisolate)?
            .ok_or_else(|| IsolationError::NotFound(format!("instance {}", master.id)))?;

        let children: Vec<Instance> = self
            .store
            .list_isolation_members(isolation_id)?
            .into_iter()
            .filter(|i| i.id != master.id)
            .collect();
        let messages = children
            .iter()
            .map(|c| QueueMessage::DeleteInstance {
                instance_id: c.id.clone(),
            })
            .collect();
        self.publish_all(messages, span).await?;

        self.store.delete_isolation(isolation_id)?;
        self.graph
            .set_dependencies_from_environment(&master.id, &master.owner.username)?;

        self.collaborators
            .queue
            .publish(QueueMessage::RedeployInstance {
                instance_id: master.id.clone(),
                triggered_by: master.created_by,
            })
            .await?;

        info!(children = children.len(), "isolation deleted");
        self.require_instance(&master.id)
    }

    /// [`delete_isolation`](Self::delete_isolation) plus a best-effort
    /// notification for the master.
    pub async fn delete_isolation_and_emit_instance_updates(
        &self,
        isolation_id: &str,
    ) -> IsolationResult<Instance> {
        let master = self.delete_isolation(isolation_id).await?;
        self.notify(&master, UpdateReason::Deisolation).await;
        Ok(master)
    }

    // ── Lookups ────────────────────────────────────────────────────

    /// Fetch an isolation group on behalf of a user.
    ///
    /// The one place this crate checks permissions itself: `AccessDenied`
    /// unless the user owns the group's owner.
    pub async fn find_isolation_for_user(
        &self,
        isolation_id: &str,
        user: &SessionUser,
    ) -> IsolationResult<IsolationGroup> {
        let isolation = self
            .store
            .get_isolation(isolation_id)?
            .ok_or_else(|| IsolationError::NotFound(format!("isolation {isolation_id}")))?;
        if !self
            .collaborators
            .permissions
            .is_owner_of(user, &isolation.owner)
            .await?
        {
            warn!(%isolation_id, user = user.github_id, "isolation access denied");
            return Err(IsolationError::AccessDenied(format!(
                "user {} does not own isolation {isolation_id}",
                user.github_id
            )));
        }
        Ok(isolation)
    }

    /// Delete a forked child (the consumer side of `delete-instance`).
    ///
    /// Dependents fall back to the child's parent before the record goes.
    pub async fn delete_forked_instance(&self, instance_id: &str) -> IsolationResult<RewireReport> {
        let span = info_span!("delete_forked_instance", %instance_id);
        let _entered = span.enter();
        let instance = self.require_instance(instance_id)?;
        if instance.is_isolation_group_master {
            return Err(IsolationError::Validation(format!(
                "instance {instance_id} is an isolation master; delete the isolation instead"
            )));
        }
        let report = self.graph.remove_self_from_graph(&instance)?;
        self.store.delete_instance(instance_id)?;
        info!(rewired = report.rewired.len(), "forked instance deleted");
        Ok(report)
    }

    // ── Helpers ────────────────────────────────────────────────────

    pub(crate) fn require_instance(&self, id: &str) -> IsolationResult<Instance> {
        self.store
            .get_instance(id)?
            .ok_or_else(|| IsolationError::NotFound(format!("instance {id}")))
    }

    /// Publish every message concurrently; all run, the first failure wins.
    pub(crate) async fn publish_all(
        &self,
        messages: Vec<QueueMessage>,
        span: &Span,
    ) -> IsolationResult<()> {
        let queue = &self.collaborators.queue;
        let results = join_all(messages.into_iter().map(|message| {
            let branch = info_span!(parent: span, "publish", kind = message.kind());
            async move { queue.publish(message).await.map_err(IsolationError::from) }
                .instrument(branch)
        }))
        .await;
        settle(results, "publish message").map(|_| ())
    }

    async fn notify(&self, instance: &Instance, reason: UpdateReason) {
        match self
            .collaborators
            .notifier
            .instance_updated(instance, reason)
            .await
        {
            Ok(()) => debug!(instance_id = %instance.id, %reason, "instance update emitted"),
            Err(e) => warn!(
                instance_id = %instance.id,
                %reason,
                error = %e,
                "failed to emit instance update"
            ),
        }
    }

    async fn notify_all(&self, instances: &[Instance], reason: UpdateReason, span: &Span) {
        join_all(instances.iter().map(|instance| {
            self.notify(instance, reason).instrument(info_span!(
                parent: span,
                "notify",
                instance_id = %instance.id
            ))
        }))
        .await;
    }
}

/// Wait-all semantics: every branch has already run; log each failure and
/// return the first.
fn settle<T, I>(results: I, what: &str) -> IsolationResult<Vec<T>>
where
    I: IntoIterator<Item = IsolationResult<T>>,
{
    let mut ok = Vec::new();
    let mut first_err = None;
    for result in results {
        match result {
            Ok(value) => ok.push(value),
            Err(e) => {
                warn!(error = %e, "{} failed", what);
                first_err.get_or_insert(e);
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(ok),
    }
}
